//! RGB colors used by drawing backends

use std::fmt;

use hwtopo_core::ObjectType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);
    pub const WHITE: Color = Color::new(0xff, 0xff, 0xff);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Box color of an object type, white for processing units, caches and
    /// anything without a dedicated color
    pub fn for_type(object_type: ObjectType) -> Color {
        match object_type {
            ObjectType::Package => Color::new(0xde, 0xde, 0xde),
            ObjectType::Core => Color::new(0xbe, 0xbe, 0xbe),
            ObjectType::NumaNode => Color::new(0xd2, 0xe7, 0xa4),
            ObjectType::Die | ObjectType::Group => Color::new(0xe6, 0xe6, 0xe6),
            ObjectType::MemCache => Color::new(0xf2, 0xe8, 0xe8),
            ObjectType::PciDevice => Color::new(0xd4, 0xd4, 0xd4),
            ObjectType::OsDevice => Color::new(0xde, 0xde, 0xde),
            _ => Color::WHITE,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}
