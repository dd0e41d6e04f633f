use crate::store::StoreType;
use snafu::{Snafu, ensure};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)))]
pub enum TextureError {
    #[snafu(display("Texture {name:?} has a zero sized dimension"))]
    ZeroSized { name: String },
    #[snafu(display("Texture {name:?} expected {expected} bytes of RGBA8 data, got {actual}"))]
    DataLength {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Decoded RGBA8 texture data.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub const BYTES_PER_PIXEL: u32 = 4;

    pub fn new(name: impl Into<String>, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            pixels,
        }
    }

    pub fn solid(name: impl Into<String>, rgba: [u8; 4]) -> Self {
        Self::new(name, 1, 1, rgba.to_vec())
    }

    pub fn byte_len(&self) -> u64 {
        self.width as u64 * self.height as u64 * Self::BYTES_PER_PIXEL as u64
    }

    pub fn validate(&self) -> Result<(), TextureError> {
        ensure!(
            self.width > 0 && self.height > 0,
            ZeroSizedErr { name: &self.name }
        );
        ensure!(
            self.pixels.len() as u64 == self.byte_len(),
            DataLengthErr {
                name: &self.name,
                expected: self.byte_len() as usize,
                actual: self.pixels.len()
            }
        );
        Ok(())
    }

    /// Whether any texel is not fully opaque.
    pub fn has_translucent_texels(&self) -> bool {
        self.pixels
            .chunks_exact(Self::BYTES_PER_PIXEL as usize)
            .any(|px| px[3] < u8::MAX)
    }
}

impl StoreType for TextureData {
    const KIND: &'static str = "Texture";

    fn name(&self) -> &str {
        &self.name
    }
}
