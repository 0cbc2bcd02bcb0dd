//! Media category detection from a declared kind and a file name

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse media kind that selects the conversion backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Video,
    Image,
    Audio,
    Unknown,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Video => "video",
            MediaCategory::Image => "image",
            MediaCategory::Audio => "audio",
            MediaCategory::Unknown => "unknown",
        }
    }

    /// Extensions accepted for the category when the declared kind is silent
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            MediaCategory::Video => VIDEO_EXTENSIONS,
            MediaCategory::Image => IMAGE_EXTENSIONS,
            MediaCategory::Audio => AUDIO_EXTENSIONS,
            MediaCategory::Unknown => &[],
        }
    }

    fn kind_prefix(&self) -> Option<&'static str> {
        match self {
            MediaCategory::Video => Some("video/"),
            MediaCategory::Image => Some("image/"),
            MediaCategory::Audio => Some("audio/"),
            MediaCategory::Unknown => None,
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "flv", "wmv", "m4v", "3gp"];
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff", "svg", "ico", "avif",
];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "aac", "flac", "m4a", "wma", "opus"];

const ORDER: [MediaCategory; 3] = [MediaCategory::Video, MediaCategory::Image, MediaCategory::Audio];

/// Classify a file by its declared kind, falling back to its extension.
///
/// The kind prefix is checked against every category before any extension is
/// looked at; within each pass categories are tried as video, image, audio.
pub fn classify(declared_kind: &str, name: &str) -> MediaCategory {
    let kind = declared_kind.trim().to_ascii_lowercase();

    let by_kind = ORDER.into_iter().find(|category| {
        category
            .kind_prefix()
            .map(|prefix| kind.starts_with(prefix))
            .unwrap_or(false)
    });
    if let Some(category) = by_kind {
        return category;
    }

    let Some(extension) = extension_of(name) else {
        return MediaCategory::Unknown;
    };
    ORDER
        .into_iter()
        .find(|category| category.extensions().contains(&extension.as_str()))
        .unwrap_or(MediaCategory::Unknown)
}

/// Lower-cased extension after the last dot, without the dot
pub fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
