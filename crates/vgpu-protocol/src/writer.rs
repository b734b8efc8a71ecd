//! Command stream builder.
//!
//! [`CommandWriter`] serializes commands into a caller-owned word buffer,
//! keeping every header's `length` in sync with the payload actually emitted.
//! It never allocates device memory; [`CommandWriter::finish`] hands back one
//! [`EncodedStream`] for the submission layer.

use crate::command::{
    ClearParams, DrawInfo, HostCopy, InlineWriteTarget, ObjectType, VertexBufferBinding,
    Viewport, WireCommand, WireHandle,
};
use crate::header::{dwords_for_bytes, pack_f32, CommandHeader, MAX_PAYLOAD_DWORDS};
use crate::opcode::WireOpcode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {dwords} dwords exceeds the 24-bit length field (opcode {opcode})")]
    PayloadTooLarge { opcode: u8, dwords: usize },
}

/// Finished command stream, ready to be handed to a device context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedStream {
    words: Vec<u32>,
    command_count: usize,
}

impl EncodedStream {
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn command_count(&self) -> usize {
        self.command_count
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Little-endian byte image of the stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }
}

#[derive(Debug, Default, Clone)]
pub struct CommandWriter {
    words: Vec<u32>,
    command_count: usize,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing allocation. The buffer is cleared first.
    pub fn with_buffer(mut words: Vec<u32>) -> Self {
        words.clear();
        Self {
            words,
            command_count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.words.clear();
        self.command_count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn command_count(&self) -> usize {
        self.command_count
    }

    pub fn as_words(&self) -> &[u32] {
        &self.words
    }

    pub fn finish(self) -> EncodedStream {
        EncodedStream {
            words: self.words,
            command_count: self.command_count,
        }
    }

    fn begin(&mut self, opcode: u8, payload_dwords: usize) -> Result<(), EncodeError> {
        let len = u32::try_from(payload_dwords)
            .ok()
            .filter(|&len| len <= MAX_PAYLOAD_DWORDS)
            .ok_or(EncodeError::PayloadTooLarge {
                opcode,
                dwords: payload_dwords,
            })?;
        // Validated above, so construction cannot fail.
        let hdr = CommandHeader { opcode, length: len };
        self.words.reserve(payload_dwords + 1);
        self.words.push(hdr.to_word());
        self.command_count += 1;
        Ok(())
    }

    /// Emit a fixed-shape command. Its payload is a handful of words, well
    /// inside the length field.
    fn fixed(&mut self, opcode: WireOpcode, payload: &[u32]) {
        debug_assert_eq!(opcode.fixed_payload_dwords(), Some(payload.len() as u32));
        let hdr = CommandHeader {
            opcode: opcode as u8,
            length: payload.len() as u32,
        };
        self.words.reserve(payload.len() + 1);
        self.words.push(hdr.to_word());
        self.words.extend_from_slice(payload);
        self.command_count += 1;
    }

    /// Emit a command with an arbitrary opcode and pre-packed payload.
    pub fn raw(&mut self, opcode: u8, payload: &[u32]) -> Result<(), EncodeError> {
        self.begin(opcode, payload.len())?;
        self.words.extend_from_slice(payload);
        Ok(())
    }

    pub fn nop(&mut self) {
        self.fixed(WireOpcode::Nop, &[]);
    }

    pub fn create_object(
        &mut self,
        object_type: ObjectType,
        handle: WireHandle,
        params: &[u32],
    ) -> Result<(), EncodeError> {
        self.begin(WireOpcode::CreateObject as u8, 2 + params.len())?;
        self.words.push(object_type as u32);
        self.words.push(handle);
        self.words.extend_from_slice(params);
        Ok(())
    }

    pub fn bind_object(&mut self, object_type: ObjectType, handle: WireHandle) {
        self.fixed(WireOpcode::BindObject, &[object_type as u32, handle]);
    }

    pub fn destroy_object(&mut self, object_type: ObjectType, handle: WireHandle) {
        self.fixed(WireOpcode::DestroyObject, &[object_type as u32, handle]);
    }

    pub fn set_viewport_state(
        &mut self,
        start_slot: u32,
        viewports: &[Viewport],
    ) -> Result<(), EncodeError> {
        self.begin(
            WireOpcode::SetViewportState as u8,
            1 + viewports.len() * crate::opcode::VIEWPORT_DWORDS as usize,
        )?;
        self.words.push(start_slot);
        for vp in viewports {
            self.words.extend_from_slice(&vp.to_words());
        }
        Ok(())
    }

    pub fn set_framebuffer_state(
        &mut self,
        zsurf: WireHandle,
        cbufs: &[WireHandle],
    ) -> Result<(), EncodeError> {
        self.begin(WireOpcode::SetFramebufferState as u8, 2 + cbufs.len())?;
        self.words.push(cbufs.len() as u32);
        self.words.push(zsurf);
        self.words.extend_from_slice(cbufs);
        Ok(())
    }

    pub fn set_vertex_buffers(&mut self, bindings: &[VertexBufferBinding]) -> Result<(), EncodeError> {
        self.begin(
            WireOpcode::SetVertexBuffers as u8,
            bindings.len() * crate::opcode::VERTEX_BUFFER_DWORDS as usize,
        )?;
        for b in bindings {
            self.words.extend_from_slice(&b.to_words());
        }
        Ok(())
    }

    pub fn clear(&mut self, params: ClearParams) {
        self.fixed(WireOpcode::Clear, &params.to_words());
    }

    /// Zero vertex/instance counts are encoded as-is; the protocol layer does
    /// not special-case empty draws.
    pub fn draw_vbo(&mut self, info: DrawInfo) {
        self.fixed(WireOpcode::DrawVbo, &info.to_words());
    }

    /// Appends `data` after the target box, zero-padded to a whole dword.
    pub fn resource_inline_write(
        &mut self,
        target: InlineWriteTarget,
        data: &[u8],
    ) -> Result<(), EncodeError> {
        let data_dwords = dwords_for_bytes(data.len());
        self.begin(
            WireOpcode::ResourceInlineWrite as u8,
            crate::opcode::INLINE_WRITE_HEADER_DWORDS as usize + data_dwords,
        )?;
        self.words.extend_from_slice(&target.to_words());
        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            self.words
                .push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        let rem = chunks.remainder();
        if !rem.is_empty() {
            let mut tail = [0u8; 4];
            tail[..rem.len()].copy_from_slice(rem);
            self.words.push(u32::from_le_bytes(tail));
        }
        Ok(())
    }

    pub fn set_index_buffer(&mut self, handle: WireHandle, index_size: u32, offset: u32) {
        self.fixed(WireOpcode::SetIndexBuffer, &[handle, index_size, offset]);
    }

    pub fn set_stencil_ref(&mut self, packed_refs: u32) {
        self.fixed(WireOpcode::SetStencilRef, &[packed_refs]);
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        self.fixed(WireOpcode::SetBlendColor, &color.map(pack_f32));
    }

    pub fn set_sub_ctx(&mut self, sub_ctx: u32) {
        self.fixed(WireOpcode::SetSubCtx, &[sub_ctx]);
    }

    pub fn create_sub_ctx(&mut self, sub_ctx: u32) {
        self.fixed(WireOpcode::CreateSubCtx, &[sub_ctx]);
    }

    pub fn destroy_sub_ctx(&mut self, sub_ctx: u32) {
        self.fixed(WireOpcode::DestroySubCtx, &[sub_ctx]);
    }

    pub fn memory_barrier(&mut self, flags: u32) {
        self.fixed(WireOpcode::MemoryBarrier, &[flags]);
    }

    /// RESOURCE_COPY_REGION from a mapped host region.
    pub fn copy_from_host(&mut self, copy: HostCopy) {
        self.words.push(
            CommandHeader {
                opcode: WireOpcode::ResourceCopyRegion as u8,
                length: HostCopy::DWORDS as u32,
            }
            .to_word(),
        );
        self.command_count += 1;
        self.words.extend_from_slice(&copy.to_words());
    }

    /// Encode a structured command.
    pub fn command(&mut self, cmd: &WireCommand) -> Result<(), EncodeError> {
        match cmd {
            WireCommand::Nop => self.nop(),
            WireCommand::CreateObject {
                object_type,
                handle,
                params,
            } => self.create_object(*object_type, *handle, params)?,
            WireCommand::BindObject {
                object_type,
                handle,
            } => self.bind_object(*object_type, *handle),
            WireCommand::DestroyObject {
                object_type,
                handle,
            } => self.destroy_object(*object_type, *handle),
            WireCommand::SetViewportState {
                start_slot,
                viewports,
            } => self.set_viewport_state(*start_slot, viewports)?,
            WireCommand::SetFramebufferState { zsurf, cbufs } => {
                self.set_framebuffer_state(*zsurf, cbufs)?
            }
            WireCommand::SetVertexBuffers(bindings) => self.set_vertex_buffers(bindings)?,
            WireCommand::Clear(params) => self.clear(*params),
            WireCommand::DrawVbo(info) => self.draw_vbo(*info),
            WireCommand::ResourceInlineWrite { target, data } => {
                self.resource_inline_write(*target, data)?
            }
            WireCommand::MemoryBarrier { flags } => self.memory_barrier(*flags),
            WireCommand::Generic { opcode, payload } => self.raw(*opcode as u8, payload)?,
            WireCommand::Unknown { opcode, payload } => self.raw(*opcode, payload)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{CLEAR_PAYLOAD_DWORDS, DRAW_VBO_PAYLOAD_DWORDS};

    #[test]
    fn clear_is_nine_dwords_total() {
        let mut w = CommandWriter::new();
        w.clear(ClearParams {
            buffers: crate::command::clear_buffers::COLOR0,
            color: [0.25, 0.5, 0.75, 1.0],
            depth: 1.0,
            stencil: 0,
        });
        let words = w.as_words();
        assert_eq!(words.len(), 9);
        let hdr = CommandHeader::from_word(words[0]);
        assert_eq!(hdr.opcode, WireOpcode::Clear as u8);
        assert_eq!(hdr.length, CLEAR_PAYLOAD_DWORDS);
        assert_eq!(words[2], 0.5f32.to_bits());
    }

    #[test]
    fn copy_from_host_splits_64_bit_fields() {
        let mut w = CommandWriter::new();
        let copy = HostCopy {
            handle: 9,
            dst_offset: 0x1_0000_0010,
            src_address: 0x8000_0000,
            size: 64 * 1024,
        };
        w.copy_from_host(copy);
        let words = w.as_words();
        let hdr = CommandHeader::from_word(words[0]);
        assert_eq!(hdr.opcode, WireOpcode::ResourceCopyRegion as u8);
        assert_eq!(hdr.length, 7);
        assert_eq!(&words[1..4], &[9, 0x10, 1]);
        assert_eq!(HostCopy::from_words(&words[1..]), Some(copy));
    }

    #[test]
    fn inline_write_pads_trailing_bytes() {
        let mut w = CommandWriter::new();
        w.resource_inline_write(InlineWriteTarget::buffer_range(5, 0, 5), &[1, 2, 3, 4, 5])
            .unwrap();
        let words = w.as_words();
        let hdr = CommandHeader::from_word(words[0]);
        assert_eq!(hdr.length, 11 + 2);
        assert_eq!(words.len(), 1 + 13);
        assert_eq!(words[12], u32::from_le_bytes([1, 2, 3, 4]));
        assert_eq!(words[13], 5);
    }

    #[test]
    fn empty_inline_write_has_only_the_box() {
        let mut w = CommandWriter::new();
        w.resource_inline_write(InlineWriteTarget::buffer_range(1, 0, 0), &[])
            .unwrap();
        assert_eq!(CommandHeader::from_word(w.as_words()[0]).length, 11);
    }

    #[test]
    fn draw_vbo_with_zero_vertices_keeps_fixed_length() {
        let mut w = CommandWriter::new();
        w.draw_vbo(DrawInfo {
            count: 0,
            ..DrawInfo::default()
        });
        let hdr = CommandHeader::from_word(w.as_words()[0]);
        assert_eq!(hdr.length, DRAW_VBO_PAYLOAD_DWORDS);
        assert_eq!(w.as_words().len(), 1 + DRAW_VBO_PAYLOAD_DWORDS as usize);
    }

    #[test]
    fn finish_tracks_command_count_and_bytes() {
        let mut w = CommandWriter::new();
        w.nop();
        w.bind_object(ObjectType::Blend, 3);
        w.set_framebuffer_state(9, &[1, 2]).unwrap();
        let stream = w.finish();
        assert_eq!(stream.command_count(), 3);
        assert_eq!(stream.len_bytes(), 4 * (1 + 3 + 5));
        assert_eq!(&stream.to_bytes()[..4], &0u32.to_le_bytes());
    }

    #[test]
    fn fixed_commands_match_the_opcode_table() {
        let mut w = CommandWriter::new();
        w.nop();
        w.bind_object(ObjectType::Blend, 1);
        w.destroy_object(ObjectType::Blend, 1);
        w.clear(ClearParams {
            buffers: crate::command::clear_buffers::COLOR0,
            color: [0.0; 4],
            depth: 1.0,
            stencil: 0,
        });
        w.draw_vbo(DrawInfo::default());
        w.set_index_buffer(4, 2, 0);
        w.set_stencil_ref(0x0101);
        w.set_blend_color([1.0, 0.5, 0.25, 0.0]);
        w.create_sub_ctx(2);
        w.set_sub_ctx(2);
        w.destroy_sub_ctx(2);
        w.memory_barrier(1);

        let words = w.as_words();
        let mut pos = 0;
        let mut seen = 0;
        while pos < words.len() {
            let hdr = CommandHeader::from_word(words[pos]);
            let opcode = WireOpcode::from_u8(hdr.opcode).unwrap();
            assert_eq!(opcode.fixed_payload_dwords(), Some(hdr.length), "{opcode:?}");
            pos += 1 + hdr.length as usize;
            seen += 1;
        }
        assert_eq!(pos, words.len());
        assert_eq!(seen, w.command_count());
    }
}
