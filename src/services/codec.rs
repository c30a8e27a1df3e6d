//! Decode and encode capabilities.
//!
//! The engine only ever sees these traits; `ImageCodec` is the bundled
//! adapter for common raster formats. True layered-format decoding (PSD
//! composites and friends) is an external collaborator implementing
//! [`LayerDecoder`] out of tree.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};

use crate::models::artifact::OutputFormat;
use crate::models::options::ConversionOptions;
use crate::models::pixel::PixelBuffer;

/// Typed per-call encode parameters (never an untyped option bag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSpec {
    pub format: OutputFormat,
    pub quality: u8,
    /// Downscale outputs that exceed this bound, preserving aspect ratio.
    pub max_dimensions: Option<(u32, u32)>,
    /// Reserved for encoders that embed their own metadata; re-encoding from
    /// canonical pixels already drops anything carried by the source.
    pub strip_metadata: bool,
}

impl From<&ConversionOptions> for EncodeSpec {
    fn from(opts: &ConversionOptions) -> Self {
        Self {
            format: opts.format,
            quality: opts.quality,
            max_dimensions: opts.max_dimensions(),
            strip_metadata: opts.strip_metadata,
        }
    }
}

/// Decodes one source asset into canonical RGBA pixel data.
#[async_trait]
pub trait LayerDecoder: Send + Sync {
    async fn decode(&self, bytes: &[u8], item_name: &str) -> Result<PixelBuffer, DecodeError>;
}

/// Encodes canonical pixel data into a compressed raster payload.
#[async_trait]
pub trait RasterEncoder: Send + Sync {
    async fn encode(&self, pixels: &PixelBuffer, spec: &EncodeSpec) -> Result<Vec<u8>, EncodeError>;
}

/// `image`-crate-backed codec for PNG, JPEG and WebP sources and outputs.
#[derive(Debug, Default)]
pub struct ImageCodec;

impl ImageCodec {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LayerDecoder for ImageCodec {
    async fn decode(&self, bytes: &[u8], item_name: &str) -> Result<PixelBuffer, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Corrupt {
                item: item_name.to_string(),
                detail: "empty payload".to_string(),
            });
        }

        let decoded = image::load_from_memory(bytes).map_err(|e| match e {
            image::ImageError::Unsupported(u) => DecodeError::UnsupportedFormat {
                item: item_name.to_string(),
                detail: u.to_string(),
            },
            other => DecodeError::Corrupt {
                item: item_name.to_string(),
                detail: other.to_string(),
            },
        })?;

        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(PixelBuffer::new(width, height, rgba.into_raw()))
    }
}

#[async_trait]
impl RasterEncoder for ImageCodec {
    async fn encode(&self, pixels: &PixelBuffer, spec: &EncodeSpec) -> Result<Vec<u8>, EncodeError> {
        let rgba = RgbaImage::from_raw(pixels.width, pixels.height, pixels.data.clone())
            .ok_or_else(|| EncodeError::InvalidPixels {
                detail: format!(
                    "buffer length {} does not match {}x{}",
                    pixels.data.len(),
                    pixels.width,
                    pixels.height
                ),
            })?;

        let mut img = DynamicImage::ImageRgba8(rgba);
        if let Some((max_w, max_h)) = spec.max_dimensions {
            if img.width() > max_w || img.height() > max_h {
                tracing::debug!(
                    from_width = img.width(),
                    from_height = img.height(),
                    max_w,
                    max_h,
                    "downscaling before encode"
                );
                img = img.resize(max_w, max_h, FilterType::Lanczos3);
            }
        }

        let mut out = Vec::new();
        match spec.format {
            OutputFormat::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = img.to_rgb8();
                JpegEncoder::new_with_quality(&mut out, spec.quality)
                    .write_image(
                        rgb.as_raw(),
                        rgb.width(),
                        rgb.height(),
                        ExtendedColorType::Rgb8,
                    )
                    .map_err(|e| EncodeError::Encoder {
                        format: spec.format,
                        detail: e.to_string(),
                    })?;
            }
            OutputFormat::Png => {
                let rgba = img.to_rgba8();
                PngEncoder::new(&mut out)
                    .write_image(
                        rgba.as_raw(),
                        rgba.width(),
                        rgba.height(),
                        ExtendedColorType::Rgba8,
                    )
                    .map_err(|e| EncodeError::Encoder {
                        format: spec.format,
                        detail: e.to_string(),
                    })?;
            }
            OutputFormat::WebP => {
                let rgba = img.to_rgba8();
                WebPEncoder::new_lossless(&mut out)
                    .write_image(
                        rgba.as_raw(),
                        rgba.width(),
                        rgba.height(),
                        ExtendedColorType::Rgba8,
                    )
                    .map_err(|e| EncodeError::Encoder {
                        format: spec.format,
                        detail: e.to_string(),
                    })?;
            }
        }
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported source format for {item}: {detail}")]
    UnsupportedFormat { item: String, detail: String },

    #[error("corrupt asset {item}: {detail}")]
    Corrupt { item: String, detail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid pixel buffer: {detail}")]
    InvalidPixels { detail: String },

    #[error("{format} encoder failed: {detail}")]
    Encoder { format: OutputFormat, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_fixture(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, image::Rgba(rgba));
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .unwrap();
        out
    }

    #[tokio::test]
    async fn decodes_png_to_canonical_rgba() {
        let codec = ImageCodec::new();
        let bytes = png_fixture(4, 3, [10, 20, 30, 255]);
        let pixels = codec.decode(&bytes, "fixture.png").await.unwrap();
        assert_eq!((pixels.width, pixels.height), (4, 3));
        assert_eq!(&pixels.data[..4], &[10, 20, 30, 255]);
    }

    #[tokio::test]
    async fn rejects_garbage_bytes() {
        let codec = ImageCodec::new();
        let err = codec.decode(b"definitely not an image", "junk.bin").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn encodes_each_output_format() {
        let codec = ImageCodec::new();
        let bytes = png_fixture(8, 8, [200, 50, 25, 255]);
        let pixels = codec.decode(&bytes, "fixture.png").await.unwrap();

        for format in [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::WebP] {
            let spec = EncodeSpec {
                format,
                quality: 80,
                max_dimensions: None,
                strip_metadata: true,
            };
            let out = codec.encode(&pixels, &spec).await.unwrap();
            assert!(!out.is_empty(), "{format} output empty");
        }
    }

    #[tokio::test]
    async fn downscales_past_resolution_cap() {
        let codec = ImageCodec::new();
        let bytes = png_fixture(64, 32, [1, 2, 3, 255]);
        let pixels = codec.decode(&bytes, "wide.png").await.unwrap();

        let spec = EncodeSpec {
            format: OutputFormat::Png,
            quality: 80,
            max_dimensions: Some((16, 16)),
            strip_metadata: true,
        };
        let out = codec.encode(&pixels, &spec).await.unwrap();
        let reloaded = image::load_from_memory(&out).unwrap();
        // Aspect ratio preserved inside the 16x16 bound.
        assert_eq!((reloaded.width(), reloaded.height()), (16, 8));
    }
}
