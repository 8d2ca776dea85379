//! RGBA8 raster images captured from rendering backends

use std::io::Cursor;
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, ImageFormat, Rgba, RgbaImage};

use crate::error::{Error, Result};

/// Fully opaque white, the colour of an empty page.
pub const OPAQUE_WHITE: [u8; 4] = [255, 255, 255, 255];

/// An immutable RGBA8 raster image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    inner: RgbaImage,
}

impl RasterImage {
    /// Wrap a raw RGBA8 buffer laid out row by row
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let len = pixels.len();
        RgbaImage::from_raw(width, height, pixels)
            .map(|inner| Self { inner })
            .ok_or(Error::BufferSize { width, height, len })
    }

    /// Build an image by evaluating `f` at every pixel position
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 4]) -> Self {
        Self {
            inner: RgbaImage::from_fn(width, height, |x, y| Rgba(f(x, y))),
        }
    }

    /// A single-colour image
    pub fn filled(width: u32, height: u32, color: [u8; 4]) -> Self {
        Self::from_fn(width, height, |_, _| color)
    }

    /// Decode a PNG (any colour type) into RGBA8
    pub fn from_png(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
        Ok(Self {
            inner: decoded.to_rgba8(),
        })
    }

    /// Encode as an RGBA8 PNG
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        PngEncoder::new(Cursor::new(&mut buffer)).write_image(
            self.inner.as_raw(),
            self.width(),
            self.height(),
            ColorType::Rgba8,
        )?;
        Ok(buffer)
    }

    /// Write the image to `path` as PNG
    pub fn save_png(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_png()?)?;
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    /// Number of pixels (width * height)
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Raw RGBA8 bytes, row-major
    pub fn as_raw(&self) -> &[u8] {
        self.inner.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.inner.get_pixel(x, y).0
    }

    /// True when every pixel is opaque white.
    ///
    /// Backends produce this when a render threw or had not painted yet, so
    /// a blank frame must never be scored as a valid capture.
    pub fn is_blank(&self) -> bool {
        self.inner.pixels().all(|p| p.0 == OPAQUE_WHITE)
    }
}
