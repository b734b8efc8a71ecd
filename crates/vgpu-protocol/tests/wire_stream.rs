use pretty_assertions::assert_eq;
use proptest::prelude::*;
use vgpu_protocol::translate::{self, wire_prim};
use vgpu_protocol::{
    clear_buffers, count_commands, decode_stream, ClearParams, CommandHeader, CommandStreamIter,
    CommandWriter, DrawInfo, InlineWriteTarget, ObjectType, VertexBufferBinding, Viewport,
    WireCommand, WireOpcode, DRAW_VBO_PAYLOAD_DWORDS,
};

#[test]
fn writer_emits_self_describing_headers() {
    let mut w = CommandWriter::new();
    w.create_object(ObjectType::Surface, 4, &[67, 0, 0]).unwrap();
    w.set_framebuffer_state(0, &[4]).unwrap();
    w.set_viewport_state(
        0,
        &[Viewport {
            scale: [320.0, -240.0, 0.5],
            translate: [320.0, 240.0, 0.5],
        }],
    )
    .unwrap();
    w.set_vertex_buffers(&[VertexBufferBinding {
        stride: 16,
        offset: 0,
        handle: 7,
    }])
    .unwrap();
    w.draw_vbo(DrawInfo {
        count: 3,
        mode: translate::primitive_type(3),
        instance_count: 1,
        ..DrawInfo::default()
    });
    w.resource_inline_write(InlineWriteTarget::buffer_range(7, 0, 6), &[9; 6])
        .unwrap();
    let bytes = w.finish().to_bytes();

    let mut opcodes = Vec::new();
    let mut cursor = 0usize;
    for raw in CommandStreamIter::new(&bytes) {
        let raw = raw.expect("stream must walk");
        assert_eq!(raw.offset, cursor);
        assert_eq!(raw.payload_bytes().len(), raw.header.length as usize * 4);
        cursor += raw.header.total_bytes();
        opcodes.push(raw.opcode().unwrap());
    }
    assert_eq!(cursor, bytes.len());
    assert_eq!(
        opcodes,
        vec![
            WireOpcode::CreateObject,
            WireOpcode::SetFramebufferState,
            WireOpcode::SetViewportState,
            WireOpcode::SetVertexBuffers,
            WireOpcode::DrawVbo,
            WireOpcode::ResourceInlineWrite,
        ]
    );
}

#[test]
fn structured_commands_survive_encode_and_decode() {
    let cmds = vec![
        WireCommand::Nop,
        WireCommand::BindObject {
            object_type: ObjectType::Rasterizer,
            handle: 2,
        },
        WireCommand::SetFramebufferState {
            zsurf: 11,
            cbufs: vec![12, 13],
        },
        WireCommand::DrawVbo(DrawInfo {
            start: 6,
            count: 36,
            mode: wire_prim::TRIANGLES,
            indexed: true,
            instance_count: 2,
            index_bias: -4,
            max_index: 35,
            ..DrawInfo::default()
        }),
        WireCommand::MemoryBarrier { flags: 1 },
        WireCommand::Generic {
            opcode: WireOpcode::BeginQuery,
            payload: vec![5],
        },
    ];

    let mut w = CommandWriter::new();
    for cmd in &cmds {
        w.command(cmd).unwrap();
    }
    let decoded = decode_stream(&w.finish().to_bytes()).unwrap();
    assert_eq!(decoded, cmds);
}

#[test]
fn draw_with_zero_vertices_is_well_formed() {
    let mut w = CommandWriter::new();
    w.draw_vbo(DrawInfo {
        count: 0,
        instance_count: 1,
        ..DrawInfo::default()
    });
    let bytes = w.finish().to_bytes();

    let raw = CommandStreamIter::new(&bytes).next().unwrap().unwrap();
    assert_eq!(raw.header.opcode, WireOpcode::DrawVbo as u8);
    assert_eq!(raw.header.length, DRAW_VBO_PAYLOAD_DWORDS);

    let decoded = decode_stream(&bytes).unwrap();
    let WireCommand::DrawVbo(info) = &decoded[0] else {
        panic!("expected DRAW_VBO, got {decoded:?}");
    };
    assert_eq!(info.count, 0);
}

#[test]
fn unknown_opcodes_are_skipped_by_length() {
    let mut w = CommandWriter::new();
    w.nop();
    w.raw(0xF0, &[1, 2, 3, 4]).unwrap();
    w.set_stencil_ref(0x0101);
    let bytes = w.finish().to_bytes();

    assert_eq!(count_commands(&bytes).unwrap(), 3);
    let decoded = decode_stream(&bytes).unwrap();
    assert_eq!(
        decoded[1],
        WireCommand::Unknown {
            opcode: 0xF0,
            payload: vec![1, 2, 3, 4]
        }
    );
    assert_eq!(
        decoded[2],
        WireCommand::Generic {
            opcode: WireOpcode::SetStencilRef,
            payload: vec![0x0101]
        }
    );
}

#[test]
fn header_length_excludes_header_word() {
    let mut w = CommandWriter::new();
    w.nop();
    let words = w.finish();
    assert_eq!(words.words(), &[CommandHeader::new(0, 0).unwrap().to_word()]);
}

proptest! {
    #[test]
    fn clear_packing_is_bit_exact(
        r in any::<u32>(),
        g in any::<u32>(),
        b in any::<u32>(),
        a in any::<u32>(),
        depth in any::<u64>(),
        stencil in any::<u32>(),
    ) {
        let params = ClearParams {
            buffers: clear_buffers::COLOR0 | clear_buffers::DEPTHSTENCIL,
            color: [f32::from_bits(r), f32::from_bits(g), f32::from_bits(b), f32::from_bits(a)],
            depth: f64::from_bits(depth),
            stencil,
        };
        let mut w = CommandWriter::new();
        w.clear(params);
        let bytes = w.finish().to_bytes();
        prop_assert_eq!(bytes.len(), 9 * 4);

        let decoded = decode_stream(&bytes).unwrap();
        let WireCommand::Clear(out) = decoded[0] else {
            panic!("expected CLEAR");
        };
        prop_assert_eq!(out.buffers, params.buffers);
        prop_assert_eq!(out.color.map(f32::to_bits), [r, g, b, a]);
        prop_assert_eq!(out.depth.to_bits(), depth);
        prop_assert_eq!(out.stencil, stencil);
    }
}
