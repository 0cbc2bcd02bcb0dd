//! Single-shot raster conversion
//!
//! Decodes with the `image` crate, resamples with `fast_image_resize` and
//! encodes WebP through libwebp directly; JPEG, PNG and AVIF go through the
//! `image` encoders. Runs on the blocking pool since none of it yields.

use crate::backend::{Converter, ProgressFn};
use crate::catalog::QualityParams;
use crate::error::{ConvertError, Result};
use crate::job::SourceFile;
use crate::progress::{Progress, ProgressStep};
use crate::resolution::target_dimensions;
use crate::validation::ResolvedSettings;
use async_trait::async_trait;
use bytes::Bytes;
use fast_image_resize as fr;
use fr::images::Image as FrImage;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, RgbaImage};
use tracing::debug;

/// AVIF encoder speed, 1 (slowest) to 10 (fastest)
const AVIF_SPEED: u8 = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageConverter;

impl ImageConverter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Converter for ImageConverter {
    async fn convert(
        &self,
        input: &SourceFile,
        settings: &ResolvedSettings,
        on_progress: ProgressFn,
    ) -> Result<Bytes> {
        let data = input.data.clone();
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || convert_image(&data, &settings, &on_progress))
            .await
            .map_err(|e| ConvertError::Encode(format!("image task aborted: {}", e)))?
    }
}

/// Decode, resample to the target bound and re-encode one image
pub fn convert_image(data: &[u8], settings: &ResolvedSettings, on_progress: &ProgressFn) -> Result<Bytes> {
    on_progress(Progress::step(ProgressStep::Loading));
    let decoded = image::load_from_memory(data)
        .map_err(|e| ConvertError::Decode(format!("Failed to load image: {}", e)))?;

    on_progress(Progress::step(ProgressStep::Processing));
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let (target_w, target_h) = target_dimensions(width, height, settings.bound);
    let rgba = if (target_w, target_h) == (width, height) {
        rgba
    } else {
        debug!(width, height, target_w, target_h, "Resampling image");
        resize_rgba(rgba, target_w, target_h)?
    };

    on_progress(Progress::step(ProgressStep::Encoding));
    let encoded = encode(rgba, settings)?;

    on_progress(Progress::step(ProgressStep::Done));
    Ok(Bytes::from(encoded))
}

fn resize_rgba(src: RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
    let (src_w, src_h) = src.dimensions();
    let src_image = FrImage::from_vec_u8(src_w, src_h, src.into_raw(), fr::PixelType::U8x4)
        .map_err(|e| ConvertError::Encode(format!("Failed to create source image: {:?}", e)))?;
    let mut dst_image = FrImage::new(width, height, src_image.pixel_type());

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, None)
        .map_err(|e| ConvertError::Encode(format!("Resize failed: {:?}", e)))?;

    RgbaImage::from_raw(width, height, dst_image.buffer().to_vec())
        .ok_or_else(|| ConvertError::Encode("Failed to create image from resized data".to_string()))
}

fn encode(rgba: RgbaImage, settings: &ResolvedSettings) -> Result<Vec<u8>> {
    let (width, height) = rgba.dimensions();
    let mut out = Vec::new();

    match (settings.format_key(), &settings.quality) {
        ("webp", QualityParams::Lossy { quality, lossless }) => {
            let encoder = webp::Encoder::from_rgba(rgba.as_raw(), width, height);
            let memory = if *lossless {
                encoder.encode_lossless()
            } else {
                encoder.encode(*quality as f32)
            };
            out.extend_from_slice(&memory);
        }
        ("jpg" | "jpeg", QualityParams::Lossy { quality, .. }) => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();
            DynamicImage::ImageRgb8(rgb)
                .write_with_encoder(JpegEncoder::new_with_quality(&mut out, (*quality).clamp(1, 100)))
                .map_err(|e| ConvertError::Encode(format!("Failed to encode JPEG: {}", e)))?;
        }
        ("png", QualityParams::Compression { level }) => {
            let compression = match level {
                0..=2 => CompressionType::Fast,
                3..=6 => CompressionType::Default,
                _ => CompressionType::Best,
            };
            DynamicImage::ImageRgba8(rgba)
                .write_with_encoder(PngEncoder::new_with_quality(&mut out, compression, FilterType::Adaptive))
                .map_err(|e| ConvertError::Encode(format!("Failed to encode PNG: {}", e)))?;
        }
        ("avif", QualityParams::Lossy { quality, .. }) => {
            DynamicImage::ImageRgba8(rgba)
                .write_with_encoder(AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, (*quality).clamp(1, 100)))
                .map_err(|e| ConvertError::Encode(format!("Failed to encode AVIF: {}", e)))?;
        }
        (format, _) => {
            return Err(ConvertError::UnsupportedFormat(format!(
                "no raster encoder for '{}' with quality '{}'",
                format, settings.settings.quality
            )));
        }
    }

    if out.is_empty() {
        return Err(ConvertError::Encode("encoder produced an empty output".to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ConversionSettings};
    use crate::classify::MediaCategory;
    use crate::validation::validate_settings;
    use image::ImageFormat;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn resolved(format: &str, quality: &str, resolution: &str) -> ResolvedSettings {
        validate_settings(
            &Catalog::builtin(),
            MediaCategory::Image,
            &ConversionSettings::new(format, quality, resolution),
        )
        .unwrap()
    }

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<ProgressStep>>>) {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&steps);
        let on_progress: ProgressFn = Arc::new(move |p: Progress| sink.lock().unwrap().push(p.step));
        (on_progress, steps)
    }

    #[test]
    fn test_resize_to_bound_keeps_aspect() {
        let mut settings = resolved("png", "standard", "original");
        settings.bound = Some(crate::resolution::Bound::new(40, 40));
        let (on_progress, steps) = recorder();

        let out = convert_image(&sample_png(100, 50), &settings, &on_progress).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
        assert_eq!(
            *steps.lock().unwrap(),
            vec![ProgressStep::Loading, ProgressStep::Processing, ProgressStep::Encoding, ProgressStep::Done]
        );
    }

    #[test]
    fn test_webp_output() {
        let (on_progress, _) = recorder();
        let out = convert_image(&sample_png(32, 32), &resolved("webp", "standard", "original"), &on_progress).unwrap();
        assert_eq!(&out[0..4], b"RIFF");
        assert_eq!(&out[8..12], b"WEBP");
    }

    #[test]
    fn test_jpeg_drops_alpha() {
        let (on_progress, _) = recorder();
        let out = convert_image(&sample_png(16, 16), &resolved("jpg", "high", "original"), &on_progress).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let (on_progress, steps) = recorder();
        let err = convert_image(b"not an image", &resolved("webp", "standard", "original"), &on_progress).unwrap_err();
        assert!(matches!(err, ConvertError::Decode(_)));
        assert_eq!(*steps.lock().unwrap(), vec![ProgressStep::Loading]);
    }

    #[tokio::test]
    async fn test_converter_runs_off_the_runtime() {
        let (on_progress, _) = recorder();
        let source = SourceFile::new("photo.png", "image/png", sample_png(8, 8));
        let out = ImageConverter::new()
            .convert(&source, &resolved("png", "compressed", "original"), on_progress)
            .await
            .unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }
}
