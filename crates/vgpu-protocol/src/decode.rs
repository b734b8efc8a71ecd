//! Command stream decoding.
//!
//! The walker only trusts the header `length` to find the next command, so
//! streams containing opcodes from a newer encoder still parse: unknown
//! commands surface as [`WireCommand::Unknown`] and are otherwise skipped.

use crate::command::WireCommand;
use crate::header::CommandHeader;
use crate::opcode::{WireOpcode, INLINE_WRITE_HEADER_DWORDS, VERTEX_BUFFER_DWORDS, VIEWPORT_DWORDS};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("command stream length {len} is not a multiple of 4")]
    NotDwordAligned { len: usize },
    #[error("command at byte {offset} needs {needed} bytes but only {available} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("opcode {opcode} payload has {found} dwords, expected {expected}")]
    PayloadSizeMismatch {
        opcode: u8,
        expected: &'static str,
        found: u32,
    },
}

/// One command located in a byte stream, not yet interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCommand<'a> {
    pub header: CommandHeader,
    /// Byte offset of the header within the stream.
    pub offset: usize,
    payload: &'a [u8],
}

impl<'a> RawCommand<'a> {
    pub fn opcode(&self) -> Option<WireOpcode> {
        WireOpcode::from_u8(self.header.opcode)
    }

    pub fn payload_bytes(&self) -> &'a [u8] {
        self.payload
    }

    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(4)?;
        let bytes = self.payload.get(start..start + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn payload_words(&self) -> Vec<u32> {
        self.payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

pub fn decode_header(buf: &[u8]) -> Result<CommandHeader, DecodeError> {
    if buf.len() < CommandHeader::SIZE_BYTES {
        return Err(DecodeError::Truncated {
            offset: 0,
            needed: CommandHeader::SIZE_BYTES,
            available: buf.len(),
        });
    }
    let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok(CommandHeader::from_word(word))
}

/// Iterator over the commands of a byte stream.
///
/// Yields an error once and then stops if the stream is malformed.
#[derive(Debug, Clone)]
pub struct CommandStreamIter<'a> {
    buf: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> CommandStreamIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            cursor: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for CommandStreamIter<'a> {
    type Item = Result<RawCommand<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.buf.len() {
            return None;
        }
        if self.cursor == 0 && self.buf.len() % 4 != 0 {
            self.failed = true;
            return Some(Err(DecodeError::NotDwordAligned {
                len: self.buf.len(),
            }));
        }

        let rest = &self.buf[self.cursor..];
        let header = match decode_header(rest) {
            Ok(h) => h,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };
        let total = header.total_bytes();
        if total > rest.len() {
            self.failed = true;
            return Some(Err(DecodeError::Truncated {
                offset: self.cursor,
                needed: total,
                available: rest.len(),
            }));
        }

        let cmd = RawCommand {
            header,
            offset: self.cursor,
            payload: &rest[CommandHeader::SIZE_BYTES..total],
        };
        self.cursor += total;
        Some(Ok(cmd))
    }
}

fn check_shape(raw: &RawCommand<'_>) -> Result<(), DecodeError> {
    let len = raw.header.length;
    let mismatch = |expected: &'static str| DecodeError::PayloadSizeMismatch {
        opcode: raw.header.opcode,
        expected,
        found: len,
    };

    let Some(op) = raw.opcode() else {
        return Ok(());
    };
    if let Some(fixed) = op.fixed_payload_dwords() {
        return if len == fixed {
            Ok(())
        } else {
            Err(mismatch("the fixed command size"))
        };
    }
    match op {
        WireOpcode::CreateObject if len < 2 => Err(mismatch(">= 2")),
        WireOpcode::SetViewportState if len < 1 || (len - 1) % VIEWPORT_DWORDS != 0 => {
            Err(mismatch("1 + 6 * viewports"))
        }
        WireOpcode::SetFramebufferState => {
            let nr_cbufs = raw.word(0).unwrap_or(0);
            if len < 2 || nr_cbufs.checked_add(2) != Some(len) {
                Err(mismatch("2 + nr_cbufs"))
            } else {
                Ok(())
            }
        }
        WireOpcode::SetVertexBuffers if len % VERTEX_BUFFER_DWORDS != 0 => {
            Err(mismatch("3 * bindings"))
        }
        WireOpcode::ResourceInlineWrite if len < INLINE_WRITE_HEADER_DWORDS => {
            Err(mismatch(">= 11"))
        }
        _ => Ok(()),
    }
}

/// Interpret a located command.
pub fn decode_command(raw: &RawCommand<'_>) -> Result<WireCommand, DecodeError> {
    check_shape(raw)?;
    Ok(WireCommand::from_parts(raw.header.opcode, &raw.payload_words()))
}

pub fn decode_stream(buf: &[u8]) -> Result<Vec<WireCommand>, DecodeError> {
    CommandStreamIter::new(buf)
        .map(|raw| raw.and_then(|raw| decode_command(&raw)))
        .collect()
}

/// Count commands without interpreting payloads.
pub fn count_commands(buf: &[u8]) -> Result<usize, DecodeError> {
    let mut n = 0;
    for raw in CommandStreamIter::new(buf) {
        raw?;
        n += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::CommandWriter;

    #[test]
    fn rejects_unaligned_stream() {
        let err = count_commands(&[0, 0, 0]).unwrap_err();
        assert_eq!(err, DecodeError::NotDwordAligned { len: 3 });
    }

    #[test]
    fn rejects_truncated_payload() {
        // CLEAR header claiming 8 payload words, followed by only 2.
        let mut bytes = ((8u32 << 8) | 7).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let err = count_commands(&bytes).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 0,
                needed: 36,
                available: 12
            }
        );
    }

    #[test]
    fn fixed_shape_mismatch_is_reported() {
        let mut w = CommandWriter::new();
        w.raw(WireOpcode::Clear as u8, &[0; 3]).unwrap();
        let bytes = w.finish().to_bytes();
        let err = decode_stream(&bytes).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadSizeMismatch { opcode: 7, found: 3, .. }
        ));
    }

    #[test]
    fn framebuffer_count_must_match_length() {
        let mut w = CommandWriter::new();
        w.raw(WireOpcode::SetFramebufferState as u8, &[3, 0, 1]).unwrap();
        let bytes = w.finish().to_bytes();
        assert!(decode_stream(&bytes).is_err());
    }
}
