//! Conversion preset catalog
//!
//! Pure data: per category, the output formats a user may pick, the quality
//! presets of each format and the resolution bounds it offers. The queue only
//! ever reads a catalog; overrides are loaded from JSON with the same shape as
//! [`Catalog::builtin`].

use crate::classify::MediaCategory;
use crate::error::{ConvertError, Result};
use crate::resolution::Bound;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// User-facing conversion choice, resolved against the catalog when a job starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSettings {
    pub output_format: String,
    pub quality: String,
    #[serde(default = "original_resolution")]
    pub resolution: String,
}

fn original_resolution() -> String {
    ORIGINAL.to_string()
}

/// Resolution key that never alters dimensions
pub const ORIGINAL: &str = "original";

impl ConversionSettings {
    pub fn new(output_format: &str, quality: &str, resolution: &str) -> Self {
        Self {
            output_format: output_format.to_string(),
            quality: quality.to_string(),
            resolution: resolution.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub video: BTreeMap<String, FormatOption>,
    #[serde(default)]
    pub image: BTreeMap<String, FormatOption>,
    #[serde(default)]
    pub audio: BTreeMap<String, FormatOption>,
    #[serde(default)]
    pub defaults: BTreeMap<MediaCategory, ConversionSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatOption {
    pub label: String,
    pub description: String,
    /// Extension of produced files, without the dot
    pub extension: String,
    pub mime: String,
    /// Muxer-level engine arguments appended after the quality arguments
    #[serde(default)]
    pub output_args: Vec<String>,
    /// Frame sides must be even, as with 4:2:0 chroma subsampling
    #[serde(default)]
    pub even_dimensions: bool,
    pub qualities: BTreeMap<String, QualityOption>,
    #[serde(default)]
    pub resolutions: BTreeMap<String, ResolutionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityOption {
    pub label: String,
    pub description: String,
    pub params: QualityParams,
}

/// Engine-specific parameters of a quality preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityParams {
    /// Frame engine arguments, plus an optional filter chained after scaling
    Engine {
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        filter: Option<String>,
    },
    /// Lossy raster quality on a 0-100 scale
    Lossy {
        quality: u8,
        #[serde(default)]
        lossless: bool,
    },
    /// Lossless raster compression effort, 0 (none) to 9 (max)
    Compression { level: u8 },
    /// Audio bitrate such as `192k`
    Bitrate { bitrate: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOption {
    pub label: String,
    /// `None` keeps the source dimensions
    #[serde(default)]
    pub bound: Option<Bound>,
}

impl Catalog {
    pub fn formats(&self, category: MediaCategory) -> Option<&BTreeMap<String, FormatOption>> {
        match category {
            MediaCategory::Video => Some(&self.video),
            MediaCategory::Image => Some(&self.image),
            MediaCategory::Audio => Some(&self.audio),
            MediaCategory::Unknown => None,
        }
    }

    pub fn format(&self, category: MediaCategory, key: &str) -> Option<&FormatOption> {
        self.formats(category)?.get(key)
    }

    pub fn default_settings(&self, category: MediaCategory) -> Option<ConversionSettings> {
        self.defaults.get(&category).cloned()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let catalog: Catalog = serde_json::from_str(json)
            .map_err(|e| ConvertError::Catalog(e.to_string()))?;
        catalog.check()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Reject catalogs whose defaults point at presets that do not exist
    fn check(&self) -> Result<()> {
        for (category, settings) in &self.defaults {
            let format = self.format(*category, &settings.output_format).ok_or_else(|| {
                ConvertError::Catalog(format!(
                    "default format '{}' missing for {}",
                    settings.output_format, category
                ))
            })?;
            if !format.qualities.contains_key(&settings.quality) {
                return Err(ConvertError::Catalog(format!(
                    "default quality '{}' missing for {} {}",
                    settings.quality, category, settings.output_format
                )));
            }
        }
        Ok(())
    }

    /// Presets shipped with the converter
    pub fn builtin() -> Self {
        let mut video = BTreeMap::new();
        video.insert(
            "webp".to_string(),
            FormatOption {
                label: "Animated WebP".to_string(),
                description: "Efficient animated image".to_string(),
                extension: "webp".to_string(),
                mime: "image/webp".to_string(),
                output_args: strings(&["-loop", "0", "-f", "webp"]),
                even_dimensions: false,
                qualities: qualities(vec![
                    ("maximum", "Maximum", "Largest file, best picture", engine(&["-q:v", "1"], None)),
                    ("high", "High", "Balanced quality", engine(&["-q:v", "10"], None)),
                    ("standard", "Standard", "Moderate size and quality", engine(&["-q:v", "25"], None)),
                    ("compressed", "Compressed", "Small file", engine(&["-q:v", "40"], None)),
                ]),
                resolutions: video_resolutions(),
            },
        );
        video.insert(
            "gif".to_string(),
            FormatOption {
                label: "Animated GIF".to_string(),
                description: "Widely compatible animation".to_string(),
                extension: "gif".to_string(),
                mime: "image/gif".to_string(),
                output_args: strings(&["-loop", "0", "-f", "gif"]),
                even_dimensions: false,
                qualities: qualities(vec![
                    (
                        "high",
                        "High",
                        "Optimized 256 color palette",
                        engine(&[], Some("split[a][b];[a]palettegen[p];[b][p]paletteuse")),
                    ),
                    ("standard", "Standard", "Default quality", engine(&[], None)),
                    ("compressed", "Compressed", "Half size frames", engine(&[], Some("scale=iw/2:ih/2"))),
                ]),
                resolutions: video_resolutions(),
            },
        );
        video.insert(
            "mp4".to_string(),
            FormatOption {
                label: "MP4 video".to_string(),
                description: "General purpose video".to_string(),
                extension: "mp4".to_string(),
                mime: "video/mp4".to_string(),
                output_args: strings(&["-pix_fmt", "yuv420p", "-movflags", "+faststart", "-f", "mp4"]),
                even_dimensions: true,
                qualities: qualities(vec![
                    ("high", "High", "H.264 high quality", engine(&["-c:v", "libx264", "-crf", "18"], None)),
                    ("standard", "Standard", "H.264 standard", engine(&["-c:v", "libx264", "-crf", "23"], None)),
                    ("compressed", "Compressed", "H.264 compressed", engine(&["-c:v", "libx264", "-crf", "28"], None)),
                ]),
                resolutions: video_resolutions(),
            },
        );

        let mut image = BTreeMap::new();
        image.insert(
            "webp".to_string(),
            FormatOption {
                label: "WebP".to_string(),
                description: "Efficient image format".to_string(),
                extension: "webp".to_string(),
                mime: "image/webp".to_string(),
                output_args: Vec::new(),
                even_dimensions: false,
                qualities: qualities(vec![
                    ("lossless", "Lossless", "Identical to the source", QualityParams::Lossy { quality: 100, lossless: true }),
                    ("maximum", "Maximum", "Nearly lossless", lossy(95)),
                    ("high", "High", "High quality, moderate compression", lossy(85)),
                    ("standard", "Standard", "Balanced quality and size", lossy(75)),
                    ("compressed", "Compressed", "Small file", lossy(60)),
                ]),
                resolutions: image_resolutions(),
            },
        );
        image.insert(
            "png".to_string(),
            FormatOption {
                label: "PNG".to_string(),
                description: "Lossless image with transparency".to_string(),
                extension: "png".to_string(),
                mime: "image/png".to_string(),
                output_args: Vec::new(),
                even_dimensions: false,
                qualities: qualities(vec![
                    ("maximum", "Maximum", "No compression", QualityParams::Compression { level: 0 }),
                    ("high", "High", "Light compression", QualityParams::Compression { level: 3 }),
                    ("standard", "Standard", "Default compression", QualityParams::Compression { level: 6 }),
                    ("compressed", "Compressed", "Maximum compression", QualityParams::Compression { level: 9 }),
                ]),
                resolutions: image_resolutions(),
            },
        );
        image.insert(
            "jpg".to_string(),
            FormatOption {
                label: "JPG/JPEG".to_string(),
                description: "General purpose image".to_string(),
                extension: "jpg".to_string(),
                mime: "image/jpeg".to_string(),
                output_args: Vec::new(),
                even_dimensions: false,
                qualities: qualities(vec![
                    ("maximum", "Maximum", "Nearly lossless", lossy(95)),
                    ("high", "High", "High quality", lossy(85)),
                    ("standard", "Standard", "Web standard quality", lossy(75)),
                    ("compressed", "Compressed", "Small file", lossy(60)),
                ]),
                resolutions: image_resolutions(),
            },
        );
        image.insert(
            "avif".to_string(),
            FormatOption {
                label: "AVIF".to_string(),
                description: "Next generation image format".to_string(),
                extension: "avif".to_string(),
                mime: "image/avif".to_string(),
                output_args: Vec::new(),
                even_dimensions: false,
                qualities: qualities(vec![
                    ("maximum", "Maximum", "About 30% smaller than WebP", lossy(95)),
                    ("high", "High", "Excellent compression", lossy(85)),
                    ("standard", "Standard", "Balanced quality", lossy(75)),
                ]),
                resolutions: image_resolutions(),
            },
        );

        let mut audio = BTreeMap::new();
        audio.insert(
            "mp3".to_string(),
            FormatOption {
                label: "MP3".to_string(),
                description: "General purpose audio".to_string(),
                extension: "mp3".to_string(),
                mime: "audio/mpeg".to_string(),
                output_args: strings(&["-vn", "-c:a", "libmp3lame", "-f", "mp3"]),
                even_dimensions: false,
                qualities: qualities(vec![
                    ("high", "320kbps", "CD quality", bitrate("320k")),
                    ("standard", "192kbps", "Standard quality", bitrate("192k")),
                    ("compressed", "128kbps", "Compressed quality", bitrate("128k")),
                ]),
                resolutions: BTreeMap::new(),
            },
        );
        audio.insert(
            "wav".to_string(),
            FormatOption {
                label: "WAV".to_string(),
                description: "Uncompressed PCM audio".to_string(),
                extension: "wav".to_string(),
                mime: "audio/wav".to_string(),
                output_args: strings(&["-vn", "-c:a", "pcm_s16le", "-f", "wav"]),
                even_dimensions: false,
                qualities: qualities(vec![("standard", "PCM 16-bit", "Lossless", engine(&[], None))]),
                resolutions: BTreeMap::new(),
            },
        );

        let mut defaults = BTreeMap::new();
        defaults.insert(MediaCategory::Video, ConversionSettings::new("webp", "standard", ORIGINAL));
        defaults.insert(MediaCategory::Image, ConversionSettings::new("webp", "standard", ORIGINAL));
        defaults.insert(MediaCategory::Audio, ConversionSettings::new("mp3", "standard", ORIGINAL));

        Self { video, image, audio, defaults }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn engine(args: &[&str], filter: Option<&str>) -> QualityParams {
    QualityParams::Engine {
        args: strings(args),
        filter: filter.map(str::to_string),
    }
}

fn lossy(quality: u8) -> QualityParams {
    QualityParams::Lossy { quality, lossless: false }
}

fn bitrate(bitrate: &str) -> QualityParams {
    QualityParams::Bitrate { bitrate: bitrate.to_string() }
}

fn qualities(entries: Vec<(&str, &str, &str, QualityParams)>) -> BTreeMap<String, QualityOption> {
    entries
        .into_iter()
        .map(|(key, label, description, params)| {
            (
                key.to_string(),
                QualityOption {
                    label: label.to_string(),
                    description: description.to_string(),
                    params,
                },
            )
        })
        .collect()
}

fn resolutions(entries: &[(&str, &str, Option<Bound>)]) -> BTreeMap<String, ResolutionOption> {
    entries
        .iter()
        .map(|(key, label, bound)| {
            (
                key.to_string(),
                ResolutionOption {
                    label: label.to_string(),
                    bound: *bound,
                },
            )
        })
        .collect()
}

fn video_resolutions() -> BTreeMap<String, ResolutionOption> {
    resolutions(&[
        (ORIGINAL, "Original size", None),
        ("1080p", "1080p", Some(Bound::new(1920, 1080))),
        ("720p", "720p", Some(Bound::new(1280, 720))),
        ("480p", "480p", Some(Bound::new(854, 480))),
        ("360p", "360p", Some(Bound::new(640, 360))),
    ])
}

fn image_resolutions() -> BTreeMap<String, ResolutionOption> {
    resolutions(&[
        (ORIGINAL, "Original size", None),
        ("4k", "4K (3840x2160)", Some(Bound::new(3840, 2160))),
        ("2k", "2K (2560x1440)", Some(Bound::new(2560, 1440))),
        ("1080p", "1080p (1920x1080)", Some(Bound::new(1920, 1080))),
        ("720p", "720p (1280x720)", Some(Bound::new(1280, 720))),
        ("480p", "480p (854x480)", Some(Bound::new(854, 480))),
    ])
}
