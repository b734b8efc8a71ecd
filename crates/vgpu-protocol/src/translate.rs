//! Enum translation from bridging-layer numeric values to wire values.
//!
//! Unmapped inputs fall back to a safe default (triangles, blend factor one,
//! BGRA8) instead of failing, so older guests keep rendering when they pass a
//! value this table does not know about. Use the `try_*` variants to detect the
//! fallback.

/// Wire primitive topologies.
pub mod wire_prim {
    pub const POINTS: u32 = 0;
    pub const LINES: u32 = 1;
    pub const LINE_LOOP: u32 = 2;
    pub const LINE_STRIP: u32 = 3;
    pub const TRIANGLES: u32 = 4;
    pub const TRIANGLE_STRIP: u32 = 5;
    pub const TRIANGLE_FAN: u32 = 6;
}

/// Wire blend factors.
pub mod wire_blend {
    pub const ONE: u32 = 0x01;
    pub const SRC_COLOR: u32 = 0x02;
    pub const SRC_ALPHA: u32 = 0x03;
    pub const DST_ALPHA: u32 = 0x04;
    pub const DST_COLOR: u32 = 0x05;
    pub const SRC_ALPHA_SATURATE: u32 = 0x06;
    pub const CONST_COLOR: u32 = 0x07;
    pub const CONST_ALPHA: u32 = 0x08;
    pub const ZERO: u32 = 0x11;
    pub const INV_SRC_COLOR: u32 = 0x12;
    pub const INV_SRC_ALPHA: u32 = 0x13;
    pub const INV_DST_ALPHA: u32 = 0x14;
    pub const INV_DST_COLOR: u32 = 0x15;
    pub const INV_CONST_COLOR: u32 = 0x17;
    pub const INV_CONST_ALPHA: u32 = 0x18;
}

/// Wire pixel formats.
pub mod wire_format {
    pub const B8G8R8A8_UNORM: u32 = 1;
    pub const B8G8R8X8_UNORM: u32 = 2;
    pub const B5G6R5_UNORM: u32 = 7;
    pub const Z16_UNORM: u32 = 16;
    pub const Z32_FLOAT: u32 = 18;
    pub const Z24_UNORM_S8_UINT: u32 = 19;
    pub const R32_FLOAT: u32 = 28;
    pub const R32G32B32A32_FLOAT: u32 = 31;
    pub const R8_UNORM: u32 = 64;
    pub const R8G8_UNORM: u32 = 65;
    pub const R8G8B8A8_UNORM: u32 = 67;
    pub const R16G16B16A16_FLOAT: u32 = 94;
    pub const B8G8R8A8_SRGB: u32 = 100;
    pub const R8G8B8A8_SRGB: u32 = 104;
}

pub const DEFAULT_PRIMITIVE: u32 = wire_prim::TRIANGLES;
pub const DEFAULT_BLEND_FACTOR: u32 = wire_blend::ONE;
pub const DEFAULT_FORMAT: u32 = wire_format::B8G8R8A8_UNORM;

// (api value, wire value)
const PRIMITIVE_TABLE: &[(u32, u32)] = &[
    (0, wire_prim::POINTS),
    (1, wire_prim::LINES),
    (2, wire_prim::LINE_STRIP),
    (3, wire_prim::TRIANGLES),
    (4, wire_prim::TRIANGLE_STRIP),
];

const BLEND_FACTOR_TABLE: &[(u32, u32)] = &[
    (0, wire_blend::ZERO),
    (1, wire_blend::ONE),
    (2, wire_blend::SRC_COLOR),
    (3, wire_blend::INV_SRC_COLOR),
    (4, wire_blend::SRC_ALPHA),
    (5, wire_blend::INV_SRC_ALPHA),
    (6, wire_blend::DST_COLOR),
    (7, wire_blend::INV_DST_COLOR),
    (8, wire_blend::DST_ALPHA),
    (9, wire_blend::INV_DST_ALPHA),
    (10, wire_blend::SRC_ALPHA_SATURATE),
    (11, wire_blend::CONST_COLOR),
    (12, wire_blend::INV_CONST_COLOR),
    (13, wire_blend::CONST_ALPHA),
    (14, wire_blend::INV_CONST_ALPHA),
];

const FORMAT_TABLE: &[(u32, u32)] = &[
    (10, wire_format::R8_UNORM),
    (30, wire_format::R8G8_UNORM),
    (40, wire_format::B5G6R5_UNORM),
    (55, wire_format::R32_FLOAT),
    (70, wire_format::R8G8B8A8_UNORM),
    (71, wire_format::R8G8B8A8_SRGB),
    (80, wire_format::B8G8R8A8_UNORM),
    (81, wire_format::B8G8R8A8_SRGB),
    (115, wire_format::R16G16B16A16_FLOAT),
    (125, wire_format::R32G32B32A32_FLOAT),
    (250, wire_format::Z16_UNORM),
    (252, wire_format::Z32_FLOAT),
    (255, wire_format::Z24_UNORM_S8_UINT),
];

fn lookup(table: &[(u32, u32)], api: u32) -> Option<u32> {
    table
        .iter()
        .find_map(|&(from, to)| (from == api).then_some(to))
}

pub fn try_primitive_type(api: u32) -> Option<u32> {
    lookup(PRIMITIVE_TABLE, api)
}

pub fn primitive_type(api: u32) -> u32 {
    try_primitive_type(api).unwrap_or(DEFAULT_PRIMITIVE)
}

pub fn try_blend_factor(api: u32) -> Option<u32> {
    lookup(BLEND_FACTOR_TABLE, api)
}

pub fn blend_factor(api: u32) -> u32 {
    try_blend_factor(api).unwrap_or(DEFAULT_BLEND_FACTOR)
}

pub fn try_pixel_format(api: u32) -> Option<u32> {
    lookup(FORMAT_TABLE, api)
}

pub fn pixel_format(api: u32) -> u32 {
    try_pixel_format(api).unwrap_or(DEFAULT_FORMAT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values_translate() {
        assert_eq!(primitive_type(3), wire_prim::TRIANGLES);
        assert_eq!(primitive_type(4), wire_prim::TRIANGLE_STRIP);
        assert_eq!(blend_factor(0), wire_blend::ZERO);
        assert_eq!(blend_factor(5), wire_blend::INV_SRC_ALPHA);
        assert_eq!(pixel_format(70), wire_format::R8G8B8A8_UNORM);
        assert_eq!(pixel_format(252), wire_format::Z32_FLOAT);
    }

    #[test]
    fn unmapped_values_fall_back() {
        assert_eq!(try_primitive_type(99), None);
        assert_eq!(primitive_type(99), wire_prim::TRIANGLES);
        assert_eq!(blend_factor(u32::MAX), wire_blend::ONE);
        assert_eq!(pixel_format(1), wire_format::B8G8R8A8_UNORM);
    }

    #[test]
    fn tables_have_unique_keys() {
        for table in [PRIMITIVE_TABLE, BLEND_FACTOR_TABLE, FORMAT_TABLE] {
            for (i, (a, _)) in table.iter().enumerate() {
                assert!(table[i + 1..].iter().all(|(b, _)| a != b), "duplicate key {a}");
            }
        }
    }
}
