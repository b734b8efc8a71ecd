//! Structured view of wire commands.
//!
//! [`WireCommand`] is a closed tagged union over the command shapes the host
//! understands. Commands whose layout is not modelled here are carried through
//! as [`WireCommand::Generic`] (known opcode) or [`WireCommand::Unknown`].

use crate::header::{pack_f32, pack_f64, unpack_f32, unpack_f64};
use crate::opcode::{
    WireOpcode, CLEAR_PAYLOAD_DWORDS, DRAW_VBO_PAYLOAD_DWORDS, INLINE_WRITE_HEADER_DWORDS,
    VERTEX_BUFFER_DWORDS, VIEWPORT_DWORDS,
};

pub type WireHandle = u32;

/// Object kinds carried in the first payload word of CREATE/BIND/DESTROY_OBJECT.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Null = 0,
    Blend = 1,
    Rasterizer = 2,
    DepthStencilAlpha = 3,
    Shader = 4,
    VertexElements = 5,
    SamplerView = 6,
    SamplerState = 7,
    Surface = 8,
    Query = 9,
    StreamoutTarget = 10,
}

impl ObjectType {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Null),
            1 => Some(Self::Blend),
            2 => Some(Self::Rasterizer),
            3 => Some(Self::DepthStencilAlpha),
            4 => Some(Self::Shader),
            5 => Some(Self::VertexElements),
            6 => Some(Self::SamplerView),
            7 => Some(Self::SamplerState),
            8 => Some(Self::Surface),
            9 => Some(Self::Query),
            10 => Some(Self::StreamoutTarget),
            _ => None,
        }
    }
}

/// Buffer-mask bits for CLEAR.
pub mod clear_buffers {
    pub const DEPTH: u32 = 1 << 0;
    pub const STENCIL: u32 = 1 << 1;
    pub const COLOR0: u32 = 1 << 2;
    pub const DEPTHSTENCIL: u32 = DEPTH | STENCIL;
}

/// Flag bits for MEMORY_BARRIER.
pub mod barrier_flags {
    /// Make host writes to mapped memory visible to the device.
    pub const HOST_WRITES: u32 = 1 << 0;
    /// Make earlier command buffers' device writes visible.
    pub const DEVICE_WRITES: u32 = 1 << 1;
    pub const ALL: u32 = HOST_WRITES | DEVICE_WRITES;
}

/// RESOURCE_COPY_REGION form that pulls bytes from a mapped host region into
/// a resource: `[handle, dst_lo, dst_hi, src_lo, src_hi, size_lo, size_hi]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostCopy {
    pub handle: WireHandle,
    pub dst_offset: u64,
    pub src_address: u64,
    pub size: u64,
}

impl HostCopy {
    pub const DWORDS: usize = 7;

    pub fn to_words(self) -> [u32; Self::DWORDS] {
        let split = |v: u64| [v as u32, (v >> 32) as u32];
        let [dst_lo, dst_hi] = split(self.dst_offset);
        let [src_lo, src_hi] = split(self.src_address);
        let [size_lo, size_hi] = split(self.size);
        [self.handle, dst_lo, dst_hi, src_lo, src_hi, size_lo, size_hi]
    }

    pub fn from_words(words: &[u32]) -> Option<Self> {
        let w: &[u32; Self::DWORDS] = words.try_into().ok()?;
        let join = |lo: u32, hi: u32| u64::from(lo) | (u64::from(hi) << 32);
        Some(Self {
            handle: w[0],
            dst_offset: join(w[1], w[2]),
            src_address: join(w[3], w[4]),
            size: join(w[5], w[6]),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearParams {
    pub buffers: u32,
    pub color: [f32; 4],
    pub depth: f64,
    pub stencil: u32,
}

impl ClearParams {
    pub(crate) fn to_words(self) -> [u32; CLEAR_PAYLOAD_DWORDS as usize] {
        let [depth_lo, depth_hi] = pack_f64(self.depth);
        [
            self.buffers,
            pack_f32(self.color[0]),
            pack_f32(self.color[1]),
            pack_f32(self.color[2]),
            pack_f32(self.color[3]),
            depth_lo,
            depth_hi,
            self.stencil,
        ]
    }

    pub(crate) fn from_words(w: &[u32]) -> Self {
        Self {
            buffers: w[0],
            color: [
                unpack_f32(w[1]),
                unpack_f32(w[2]),
                unpack_f32(w[3]),
                unpack_f32(w[4]),
            ],
            depth: unpack_f64(w[5], w[6]),
            stencil: w[7],
        }
    }
}

/// DRAW_VBO parameters. `mode` is already in the wire primitive space
/// (see [`crate::translate::primitive_type`]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawInfo {
    pub start: u32,
    pub count: u32,
    pub mode: u32,
    pub indexed: bool,
    pub instance_count: u32,
    pub index_bias: i32,
    pub start_instance: u32,
    pub primitive_restart: bool,
    pub restart_index: u32,
    pub min_index: u32,
    pub max_index: u32,
    pub count_from_streamout: u32,
}

impl DrawInfo {
    pub(crate) fn to_words(self) -> [u32; DRAW_VBO_PAYLOAD_DWORDS as usize] {
        [
            self.start,
            self.count,
            self.mode,
            self.indexed as u32,
            self.instance_count,
            self.index_bias as u32,
            self.start_instance,
            self.primitive_restart as u32,
            self.restart_index,
            self.min_index,
            self.max_index,
            self.count_from_streamout,
        ]
    }

    pub(crate) fn from_words(w: &[u32]) -> Self {
        Self {
            start: w[0],
            count: w[1],
            mode: w[2],
            indexed: w[3] != 0,
            instance_count: w[4],
            index_bias: w[5] as i32,
            start_instance: w[6],
            primitive_restart: w[7] != 0,
            restart_index: w[8],
            min_index: w[9],
            max_index: w[10],
            count_from_streamout: w[11],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub scale: [f32; 3],
    pub translate: [f32; 3],
}

impl Viewport {
    pub(crate) fn to_words(self) -> [u32; VIEWPORT_DWORDS as usize] {
        [
            pack_f32(self.scale[0]),
            pack_f32(self.scale[1]),
            pack_f32(self.scale[2]),
            pack_f32(self.translate[0]),
            pack_f32(self.translate[1]),
            pack_f32(self.translate[2]),
        ]
    }

    pub(crate) fn from_words(w: &[u32]) -> Self {
        Self {
            scale: [unpack_f32(w[0]), unpack_f32(w[1]), unpack_f32(w[2])],
            translate: [unpack_f32(w[3]), unpack_f32(w[4]), unpack_f32(w[5])],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub stride: u32,
    pub offset: u32,
    pub handle: WireHandle,
}

impl VertexBufferBinding {
    pub(crate) fn to_words(self) -> [u32; VERTEX_BUFFER_DWORDS as usize] {
        [self.stride, self.offset, self.handle]
    }
}

/// Destination box of a RESOURCE_INLINE_WRITE.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InlineWriteTarget {
    pub handle: WireHandle,
    pub level: u32,
    pub usage: u32,
    pub stride: u32,
    pub layer_stride: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl InlineWriteTarget {
    /// A 1D byte range of a buffer resource.
    pub fn buffer_range(handle: WireHandle, offset: u32, len: u32) -> Self {
        Self {
            handle,
            x: offset,
            width: len,
            height: 1,
            depth: 1,
            ..Self::default()
        }
    }

    pub(crate) fn to_words(self) -> [u32; INLINE_WRITE_HEADER_DWORDS as usize] {
        [
            self.handle,
            self.level,
            self.usage,
            self.stride,
            self.layer_stride,
            self.x,
            self.y,
            self.z,
            self.width,
            self.height,
            self.depth,
        ]
    }

    pub(crate) fn from_words(w: &[u32]) -> Self {
        Self {
            handle: w[0],
            level: w[1],
            usage: w[2],
            stride: w[3],
            layer_stride: w[4],
            x: w[5],
            y: w[6],
            z: w[7],
            width: w[8],
            height: w[9],
            depth: w[10],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WireCommand {
    Nop,
    CreateObject {
        object_type: ObjectType,
        handle: WireHandle,
        params: Vec<u32>,
    },
    BindObject {
        object_type: ObjectType,
        handle: WireHandle,
    },
    DestroyObject {
        object_type: ObjectType,
        handle: WireHandle,
    },
    SetViewportState {
        start_slot: u32,
        viewports: Vec<Viewport>,
    },
    SetFramebufferState {
        zsurf: WireHandle,
        cbufs: Vec<WireHandle>,
    },
    SetVertexBuffers(Vec<VertexBufferBinding>),
    Clear(ClearParams),
    DrawVbo(DrawInfo),
    /// `data` is the dword-padded payload; the exact byte count is implied by
    /// the target box.
    ResourceInlineWrite {
        target: InlineWriteTarget,
        data: Vec<u8>,
    },
    MemoryBarrier {
        flags: u32,
    },
    /// A known opcode whose payload is not modelled structurally.
    Generic {
        opcode: WireOpcode,
        payload: Vec<u32>,
    },
    /// An opcode this build does not recognize; kept so streams round-trip.
    Unknown {
        opcode: u8,
        payload: Vec<u32>,
    },
}

impl WireCommand {
    pub fn opcode_u8(&self) -> u8 {
        match self {
            Self::Nop => WireOpcode::Nop as u8,
            Self::CreateObject { .. } => WireOpcode::CreateObject as u8,
            Self::BindObject { .. } => WireOpcode::BindObject as u8,
            Self::DestroyObject { .. } => WireOpcode::DestroyObject as u8,
            Self::SetViewportState { .. } => WireOpcode::SetViewportState as u8,
            Self::SetFramebufferState { .. } => WireOpcode::SetFramebufferState as u8,
            Self::SetVertexBuffers(_) => WireOpcode::SetVertexBuffers as u8,
            Self::Clear(_) => WireOpcode::Clear as u8,
            Self::DrawVbo(_) => WireOpcode::DrawVbo as u8,
            Self::ResourceInlineWrite { .. } => WireOpcode::ResourceInlineWrite as u8,
            Self::MemoryBarrier { .. } => WireOpcode::MemoryBarrier as u8,
            Self::Generic { opcode, .. } => *opcode as u8,
            Self::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Payload words this command occupies on the wire (header excluded).
    pub fn payload_dwords(&self) -> usize {
        match self {
            Self::Nop => 0,
            Self::CreateObject { params, .. } => 2 + params.len(),
            Self::BindObject { .. } | Self::DestroyObject { .. } => 2,
            Self::SetViewportState { viewports, .. } => {
                1 + viewports.len() * VIEWPORT_DWORDS as usize
            }
            Self::SetFramebufferState { cbufs, .. } => 2 + cbufs.len(),
            Self::SetVertexBuffers(bindings) => bindings.len() * VERTEX_BUFFER_DWORDS as usize,
            Self::Clear(_) => CLEAR_PAYLOAD_DWORDS as usize,
            Self::DrawVbo(_) => DRAW_VBO_PAYLOAD_DWORDS as usize,
            Self::ResourceInlineWrite { data, .. } => {
                INLINE_WRITE_HEADER_DWORDS as usize + crate::header::dwords_for_bytes(data.len())
            }
            Self::MemoryBarrier { .. } => 1,
            Self::Generic { payload, .. } | Self::Unknown { payload, .. } => payload.len(),
        }
    }

    /// Build a structured command from an opcode and its payload words.
    ///
    /// Shape mismatches for modelled commands are reported by
    /// [`crate::decode::decode_command`]; this function assumes the payload has
    /// already been length-checked.
    pub(crate) fn from_parts(opcode: u8, payload: &[u32]) -> Self {
        let Some(op) = WireOpcode::from_u8(opcode) else {
            return Self::Unknown {
                opcode,
                payload: payload.to_vec(),
            };
        };
        match op {
            WireOpcode::Nop => Self::Nop,
            WireOpcode::CreateObject => Self::CreateObject {
                object_type: ObjectType::from_u32(payload[0]).unwrap_or(ObjectType::Null),
                handle: payload[1],
                params: payload[2..].to_vec(),
            },
            WireOpcode::BindObject => Self::BindObject {
                object_type: ObjectType::from_u32(payload[0]).unwrap_or(ObjectType::Null),
                handle: payload[1],
            },
            WireOpcode::DestroyObject => Self::DestroyObject {
                object_type: ObjectType::from_u32(payload[0]).unwrap_or(ObjectType::Null),
                handle: payload[1],
            },
            WireOpcode::SetViewportState => Self::SetViewportState {
                start_slot: payload[0],
                viewports: payload[1..]
                    .chunks_exact(VIEWPORT_DWORDS as usize)
                    .map(Viewport::from_words)
                    .collect(),
            },
            WireOpcode::SetFramebufferState => Self::SetFramebufferState {
                zsurf: payload[1],
                cbufs: payload[2..].to_vec(),
            },
            WireOpcode::SetVertexBuffers => Self::SetVertexBuffers(
                payload
                    .chunks_exact(VERTEX_BUFFER_DWORDS as usize)
                    .map(|w| VertexBufferBinding {
                        stride: w[0],
                        offset: w[1],
                        handle: w[2],
                    })
                    .collect(),
            ),
            WireOpcode::Clear => Self::Clear(ClearParams::from_words(payload)),
            WireOpcode::DrawVbo => Self::DrawVbo(DrawInfo::from_words(payload)),
            WireOpcode::ResourceInlineWrite => {
                let header = INLINE_WRITE_HEADER_DWORDS as usize;
                let data = payload[header..]
                    .iter()
                    .flat_map(|w| w.to_le_bytes())
                    .collect();
                Self::ResourceInlineWrite {
                    target: InlineWriteTarget::from_words(&payload[..header]),
                    data,
                }
            }
            WireOpcode::MemoryBarrier => Self::MemoryBarrier { flags: payload[0] },
            other => Self::Generic {
                opcode: other,
                payload: payload.to_vec(),
            },
        }
    }
}
