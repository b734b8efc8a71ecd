//! Wire protocol for the virtual GPU command channel.
//!
//! A stream is a flat sequence of little-endian dwords. Each command starts with
//! a header word `(length_in_dwords << 8) | opcode` followed by `length` payload
//! words. 32-bit floats are packed as raw IEEE-754 bits; doubles are split into
//! a low word and a high word.
//!
//! - [`CommandWriter`] encodes commands into a caller-owned buffer.
//! - [`CommandStreamIter`] / [`decode_stream`] walk and decode streams.
//! - [`translate`] maps bridging-layer enum values into wire values.

#![forbid(unsafe_code)]

mod command;
mod decode;
mod header;
mod opcode;
mod writer;

pub mod translate;

pub use command::{
    barrier_flags, clear_buffers, ClearParams, DrawInfo, HostCopy, InlineWriteTarget,
    ObjectType, VertexBufferBinding, Viewport, WireCommand, WireHandle,
};
pub use decode::{
    count_commands, decode_command, decode_header, decode_stream, CommandStreamIter, DecodeError,
    RawCommand,
};
pub use header::{
    dwords_for_bytes, pack_f32, pack_f64, unpack_f32, unpack_f64, CommandHeader,
    MAX_PAYLOAD_DWORDS,
};
pub use opcode::{
    WireOpcode, CLEAR_PAYLOAD_DWORDS, DRAW_VBO_PAYLOAD_DWORDS, INLINE_WRITE_HEADER_DWORDS,
    VERTEX_BUFFER_DWORDS, VIEWPORT_DWORDS,
};
pub use writer::{CommandWriter, EncodeError, EncodedStream};
