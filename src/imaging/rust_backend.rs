//! Pure Rust image processing backend.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Probe | `ImageReader::into_decoder` + `dimensions` / `exif_metadata` |
//! | Decode (JPEG, PNG, TIFF, WebP) | `DynamicImage::from_decoder` |
//! | Orientation | custom [`exif`](super::exif) parser → `Orientation::from_exif` |
//! | Encode → JPEG | `jpeg_encoder::Encoder` with quality, baseline or progressive |
//! | Encode → PNG | `image::codecs::png::PngEncoder` |
//! | Encode → WebP | `image::codecs::webp::WebPEncoder` (lossless) |
//! | EXIF embedding | custom APP1 insertion ([`exif::embed_in_jpeg`]) |
//!
//! Encoding goes through an in-memory buffer that can be bounded. When the
//! encoder outgrows the bound the save fails with
//! [`SaveError::BufferExhausted`] and nothing is written to disk.

use super::backend::{BackendError, DecodedImage, ImageBackend, ImageProbe, SaveError};
use super::exif;
use super::params::SaveParams;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::metadata::Orientation;
use image::{ColorType, DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::{self, BufReader, Write};
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Pure Rust backend using the `image` crate.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_error(path: &Path, e: impl std::fmt::Display) -> BackendError {
    BackendError::Decode {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Open `path` and sniff its format from the content.
fn open_reader(path: &Path) -> Result<(ImageReader<BufReader<File>>, ImageFormat), BackendError> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    let format = reader
        .format()
        .ok_or_else(|| BackendError::UnsupportedFormat(path.display().to_string()))?;
    Ok((reader, format))
}

/// EXIF block of a decoder. Unreadable metadata is treated as absent.
fn read_exif(decoder: &mut impl ImageDecoder, path: &Path) -> Option<Vec<u8>> {
    decoder.exif_metadata().unwrap_or_else(|e| {
        debug!(source = %path.display(), error = %e, "ignoring unreadable EXIF block");
        None
    })
}

fn orientation_of(exif_block: Option<&[u8]>) -> Orientation {
    exif_block
        .and_then(|block| exif::orientation(block).ok().flatten())
        .and_then(|v| u8::try_from(v).ok())
        .and_then(Orientation::from_exif)
        .unwrap_or(Orientation::NoTransforms)
}

/// Output format from the extension of the destination path.
fn output_format(path: &Path) -> Result<ImageFormat, BackendError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
        "png" => Ok(ImageFormat::Png),
        "webp" => Ok(ImageFormat::WebP),
        other => Err(BackendError::UnsupportedFormat(format!(
            "output extension {other:?}"
        ))),
    }
}

/// In-memory encode target with an optional size bound.
struct BoundedBuffer {
    bytes: Vec<u8>,
    limit: Option<usize>,
    exhausted: bool,
}

impl BoundedBuffer {
    fn new(limit: Option<usize>) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            exhausted: false,
        }
    }
}

impl Write for BoundedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limit) = self.limit
            && self.bytes.len() + buf.len() > limit
        {
            self.exhausted = true;
            return Err(io::Error::other("encode buffer exhausted"));
        }
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn encode_jpeg(image: &DynamicImage, params: &SaveParams, out: &mut BoundedBuffer) -> Result<(), String> {
    let (Ok(width), Ok(height)) = (u16::try_from(image.width()), u16::try_from(image.height())) else {
        return Err(format!(
            "{}x{} exceeds the JPEG dimension limit",
            image.width(),
            image.height()
        ));
    };
    let quality = u8::try_from(params.quality.value()).unwrap_or(100);
    let mut encoder = jpeg_encoder::Encoder::new(out, quality);
    encoder.set_progressive(params.progressive);
    let result = match image {
        DynamicImage::ImageLuma8(gray) => encoder.encode(gray.as_raw(), width, height, jpeg_encoder::ColorType::Luma),
        DynamicImage::ImageRgb8(rgb) => encoder.encode(rgb.as_raw(), width, height, jpeg_encoder::ColorType::Rgb),
        // JPEG has no alpha and no 16-bit samples
        other => encoder.encode(other.to_rgb8().as_raw(), width, height, jpeg_encoder::ColorType::Rgb),
    };
    result.map_err(|e| e.to_string())
}

fn encode(
    image: &DynamicImage,
    format: ImageFormat,
    params: &SaveParams,
    out: &mut BoundedBuffer,
) -> Result<(), String> {
    match format {
        ImageFormat::Png => image.write_with_encoder(PngEncoder::new(out)).map_err(|e| e.to_string()),
        ImageFormat::WebP => {
            let encoder = WebPEncoder::new_lossless(out);
            let result = match image.color() {
                ColorType::Rgb8 | ColorType::Rgba8 => image.write_with_encoder(encoder),
                _ => DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder),
            };
            result.map_err(|e| e.to_string())
        }
        _ => encode_jpeg(image, params, out),
    }
}

impl ImageBackend for RustBackend {
    fn probe(&self, path: &Path) -> Result<ImageProbe, BackendError> {
        let (reader, format) = open_reader(path)?;
        let mut decoder = reader.into_decoder().map_err(|e| decode_error(path, e))?;
        let (width, height) = decoder.dimensions();
        let exif = read_exif(&mut decoder, path);
        Ok(ImageProbe {
            format,
            width,
            height,
            exif,
        })
    }

    fn decode(&self, path: &Path) -> Result<DecodedImage, BackendError> {
        let (reader, format) = open_reader(path)?;
        let mut decoder = reader.into_decoder().map_err(|e| decode_error(path, e))?;
        let exif = read_exif(&mut decoder, path);
        let icc_len = decoder
            .icc_profile()
            .ok()
            .flatten()
            .map_or(0, |icc| icc.len());
        let pixels = DynamicImage::from_decoder(decoder).map_err(|e| decode_error(path, e))?;
        Ok(DecodedImage {
            pixels,
            format,
            orientation: orientation_of(exif.as_deref()),
            exif,
            icc_len,
        })
    }

    fn save(&self, image: &DynamicImage, params: &SaveParams) -> Result<(), SaveError> {
        let format = output_format(&params.output)?;
        let mut buffer = BoundedBuffer::new(params.buffer_limit);
        let result = encode(image, format, params, &mut buffer);
        if buffer.exhausted {
            return Err(SaveError::BufferExhausted {
                limit: params.buffer_limit.unwrap_or_default(),
            });
        }
        result.map_err(BackendError::Encode)?;

        let mut bytes = buffer.bytes;
        if let Some(block) = &params.exif {
            if format == ImageFormat::Jpeg {
                bytes = exif::embed_in_jpeg(&bytes, block)
                    .map_err(|e| SaveError::Metadata(e.to_string()))?;
            } else {
                debug!(output = %params.output.display(), "metadata is only embedded in JPEG output");
            }
        }
        std::fs::write(&params.output, bytes).map_err(BackendError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::exif::tests::tiff_with_orientation;
    use crate::imaging::params::Quality;
    use crate::test_helpers::create_test_jpeg;

    // =========================================================================
    // probe / decode
    // =========================================================================

    #[test]
    fn probe_synthetic_jpeg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("test.jpg");
        create_test_jpeg(&path, 200, 150);

        let probe = RustBackend::new().probe(&path).unwrap();
        assert_eq!(probe.format, ImageFormat::Jpeg);
        assert_eq!((probe.width, probe.height), (200, 150));
        assert_eq!(probe.exif, None);
    }

    #[test]
    fn probe_nonexistent_file_errors() {
        let result = RustBackend::new().probe(Path::new("/nonexistent/image.jpg"));
        assert!(matches!(result, Err(BackendError::Io(_))));
    }

    #[test]
    fn probe_garbage_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not an image").unwrap();
        assert!(RustBackend::new().probe(&path).is_err());
    }

    #[test]
    fn decode_synthetic_jpeg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("test.jpg");
        create_test_jpeg(&path, 64, 48);

        let decoded = RustBackend::new().decode(&path).unwrap();
        assert_eq!((decoded.pixels.width(), decoded.pixels.height()), (64, 48));
        assert_eq!(decoded.orientation, Orientation::NoTransforms);
    }

    // =========================================================================
    // save
    // =========================================================================

    #[test]
    fn save_jpeg_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("out.jpg");
        let image = DynamicImage::new_rgb8(120, 80);

        RustBackend::new()
            .save(&image, &SaveParams::new(&out, Quality::new(80)))
            .unwrap();
        assert_eq!(image::image_dimensions(&out).unwrap(), (120, 80));
    }

    /// Start-of-frame marker of an encoded JPEG: 0xC0 baseline, 0xC2 progressive.
    fn frame_marker(bytes: &[u8]) -> Option<u8> {
        bytes
            .windows(2)
            .find(|w| w[0] == 0xFF && matches!(w[1], 0xC0 | 0xC1 | 0xC2))
            .map(|w| w[1])
    }

    #[test]
    fn save_jpeg_progressive_and_baseline() {
        let tmp = tempfile::TempDir::new().unwrap();
        let image = DynamicImage::new_rgb8(48, 32);
        for (name, progressive, marker) in [("p.jpg", true, 0xC2), ("b.jpg", false, 0xC0)] {
            let out = tmp.path().join(name);
            let params = SaveParams::new(&out, Quality::new(80)).with_progressive(progressive);
            RustBackend::new().save(&image, &params).unwrap();

            let bytes = std::fs::read(&out).unwrap();
            assert_eq!(frame_marker(&bytes), Some(marker), "{name}");
            assert_eq!(image::image_dimensions(&out).unwrap(), (48, 32));
        }
    }

    #[test]
    fn progressive_jpeg_respects_buffer_bound() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("small.jpg");
        let params = SaveParams::new(&out, Quality::default())
            .with_progressive(true)
            .with_buffer_limit(Some(64));

        let result = RustBackend::new().save(&DynamicImage::new_rgb8(64, 64), &params);
        assert!(matches!(result, Err(SaveError::BufferExhausted { limit: 64 })));
        assert!(!out.exists());
    }

    #[test]
    fn save_png_and_webp() {
        let tmp = tempfile::TempDir::new().unwrap();
        let image = DynamicImage::new_rgba8(30, 20);
        for name in ["out.png", "out.webp"] {
            let out = tmp.path().join(name);
            RustBackend::new()
                .save(&image, &SaveParams::new(&out, Quality::default()))
                .unwrap();
            assert_eq!(image::image_dimensions(&out).unwrap(), (30, 20));
        }
    }

    #[test]
    fn save_rgba_to_jpeg_drops_alpha() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("alpha.jpg");
        RustBackend::new()
            .save(
                &DynamicImage::new_rgba8(16, 16),
                &SaveParams::new(&out, Quality::default()),
            )
            .unwrap();
        assert!(out.exists());
    }

    #[test]
    fn save_unsupported_extension_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("out.bmp");
        let result =
            RustBackend::new().save(&DynamicImage::new_rgb8(4, 4), &SaveParams::new(&out, Quality::default()));
        assert!(matches!(
            result,
            Err(SaveError::Backend(BackendError::UnsupportedFormat(_)))
        ));
    }

    #[test]
    fn tiny_buffer_is_exhausted_and_nothing_written() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("small.jpg");
        let params = SaveParams::new(&out, Quality::default()).with_buffer_limit(Some(64));

        let result = RustBackend::new().save(&DynamicImage::new_rgb8(64, 64), &params);
        assert!(matches!(result, Err(SaveError::BufferExhausted { limit: 64 })));
        assert!(!out.exists());
    }

    #[test]
    fn exif_is_embedded_in_jpeg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("exif.jpg");
        let params = SaveParams::new(&out, Quality::default())
            .with_exif(Some(tiff_with_orientation(false, 6)));

        RustBackend::new()
            .save(&DynamicImage::new_rgb8(32, 16), &params)
            .unwrap();

        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..4], &[0xFF, 0xD8, 0xFF, 0xE1]);
        assert!(image::image_dimensions(&out).is_ok());
    }

    #[test]
    fn written_orientation_is_applied_on_decode() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("rotated.jpg");
        let params = SaveParams::new(&path, Quality::default())
            .with_exif(Some(tiff_with_orientation(true, 6)));
        RustBackend::new()
            .save(&DynamicImage::new_rgb8(32, 16), &params)
            .unwrap();

        let decoded = RustBackend::new().decode(&path).unwrap();
        assert_eq!(decoded.orientation, Orientation::Rotate90);
        assert!(decoded.exif.is_some());
    }

    #[test]
    fn malformed_exif_is_metadata_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("bad.jpg");
        let params =
            SaveParams::new(&out, Quality::default()).with_exif(Some(b"not a tiff block".to_vec()));

        let result = RustBackend::new().save(&DynamicImage::new_rgb8(8, 8), &params);
        assert!(matches!(result, Err(SaveError::Metadata(_))));
        assert!(!out.exists());
    }
}
