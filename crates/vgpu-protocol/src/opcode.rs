//! Wire opcodes.
//!
//! Values are part of the host ABI and must never be renumbered. New opcodes are
//! appended; decoders skip anything they do not recognize using the header length.

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireOpcode {
    Nop = 0,
    CreateObject = 1,
    BindObject = 2,
    DestroyObject = 3,
    SetViewportState = 4,
    SetFramebufferState = 5,
    SetVertexBuffers = 6,
    Clear = 7,
    DrawVbo = 8,
    ResourceInlineWrite = 9,
    SetSamplerViews = 10,
    SetIndexBuffer = 11,
    SetConstantBuffer = 12,
    SetStencilRef = 13,
    SetBlendColor = 14,
    SetScissorState = 15,
    Blit = 16,
    ResourceCopyRegion = 17,
    BindSamplerStates = 18,
    BeginQuery = 19,
    EndQuery = 20,
    GetQueryResult = 21,
    SetPolygonStipple = 22,
    SetClipState = 23,
    SetSampleMask = 24,
    SetStreamoutTargets = 25,
    SetRenderCondition = 26,
    SetUniformBuffer = 27,
    SetSubCtx = 28,
    CreateSubCtx = 29,
    DestroySubCtx = 30,
    BindShader = 31,
    MemoryBarrier = 32,
}

impl WireOpcode {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Nop),
            1 => Some(Self::CreateObject),
            2 => Some(Self::BindObject),
            3 => Some(Self::DestroyObject),
            4 => Some(Self::SetViewportState),
            5 => Some(Self::SetFramebufferState),
            6 => Some(Self::SetVertexBuffers),
            7 => Some(Self::Clear),
            8 => Some(Self::DrawVbo),
            9 => Some(Self::ResourceInlineWrite),
            10 => Some(Self::SetSamplerViews),
            11 => Some(Self::SetIndexBuffer),
            12 => Some(Self::SetConstantBuffer),
            13 => Some(Self::SetStencilRef),
            14 => Some(Self::SetBlendColor),
            15 => Some(Self::SetScissorState),
            16 => Some(Self::Blit),
            17 => Some(Self::ResourceCopyRegion),
            18 => Some(Self::BindSamplerStates),
            19 => Some(Self::BeginQuery),
            20 => Some(Self::EndQuery),
            21 => Some(Self::GetQueryResult),
            22 => Some(Self::SetPolygonStipple),
            23 => Some(Self::SetClipState),
            24 => Some(Self::SetSampleMask),
            25 => Some(Self::SetStreamoutTargets),
            26 => Some(Self::SetRenderCondition),
            27 => Some(Self::SetUniformBuffer),
            28 => Some(Self::SetSubCtx),
            29 => Some(Self::CreateSubCtx),
            30 => Some(Self::DestroySubCtx),
            31 => Some(Self::BindShader),
            32 => Some(Self::MemoryBarrier),
            _ => None,
        }
    }

    /// Payload size in dwords for commands with a compile-time-known layout.
    ///
    /// Returns `None` for variable-length commands.
    pub const fn fixed_payload_dwords(self) -> Option<u32> {
        match self {
            Self::Nop => Some(0),
            Self::BindObject | Self::DestroyObject => Some(2),
            Self::Clear => Some(CLEAR_PAYLOAD_DWORDS),
            Self::DrawVbo => Some(DRAW_VBO_PAYLOAD_DWORDS),
            Self::SetIndexBuffer => Some(3),
            Self::SetStencilRef => Some(1),
            Self::SetBlendColor => Some(4),
            Self::SetSubCtx | Self::CreateSubCtx | Self::DestroySubCtx => Some(1),
            Self::MemoryBarrier => Some(1),
            _ => None,
        }
    }
}

/// CLEAR: buffer mask, 4 packed floats, packed double (2 words), stencil.
pub const CLEAR_PAYLOAD_DWORDS: u32 = 8;

/// DRAW_VBO: start, count, mode, indexed, instance_count, index_bias,
/// start_instance, primitive_restart, restart_index, min_index, max_index, cso.
pub const DRAW_VBO_PAYLOAD_DWORDS: u32 = 12;

/// RESOURCE_INLINE_WRITE words preceding the raw data.
pub const INLINE_WRITE_HEADER_DWORDS: u32 = 11;

/// Words per viewport in SET_VIEWPORT_STATE (3 scale + 3 translate floats).
pub const VIEWPORT_DWORDS: u32 = 6;

/// Words per binding in SET_VERTEX_BUFFERS (stride, offset, handle).
pub const VERTEX_BUFFER_DWORDS: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_roundtrip_through_from_u8() {
        for v in 0..=u8::MAX {
            if let Some(op) = WireOpcode::from_u8(v) {
                assert_eq!(op as u8, v);
            }
        }
        assert_eq!(WireOpcode::from_u8(33), None);
    }

    #[test]
    fn documented_opcodes_have_stable_values() {
        assert_eq!(WireOpcode::Nop as u8, 0);
        assert_eq!(WireOpcode::CreateObject as u8, 1);
        assert_eq!(WireOpcode::BindObject as u8, 2);
        assert_eq!(WireOpcode::DestroyObject as u8, 3);
        assert_eq!(WireOpcode::SetViewportState as u8, 4);
        assert_eq!(WireOpcode::SetFramebufferState as u8, 5);
        assert_eq!(WireOpcode::SetVertexBuffers as u8, 6);
        assert_eq!(WireOpcode::Clear as u8, 7);
        assert_eq!(WireOpcode::DrawVbo as u8, 8);
        assert_eq!(WireOpcode::ResourceInlineWrite as u8, 9);
    }
}
