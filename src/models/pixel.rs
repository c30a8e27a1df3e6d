use serde::{Deserialize, Serialize};

/// Canonical decoded pixel data: tightly packed RGBA8, row-major.
///
/// Every decoder normalizes to this layout so fingerprinting sees identical
/// bytes for identical visual content regardless of the source format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 4);
        Self {
            width,
            height,
            data,
        }
    }

    /// Integer luma (BT.601 weights) of the pixel at (x, y).
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let (r, g, b) = (
            self.data[i] as u32,
            self.data[i + 1] as u32,
            self.data[i + 2] as u32,
        );
        ((299 * r + 587 * g + 114 * b) / 1000) as u8
    }
}
