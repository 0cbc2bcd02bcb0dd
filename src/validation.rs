//! Settings validation against the preset catalog

use crate::catalog::{Catalog, ConversionSettings, FormatOption, QualityParams, ORIGINAL};
use crate::classify::MediaCategory;
use crate::error::{ConvertError, Result};
use crate::resolution::Bound;

/// Settings snapshot resolved to concrete engine parameters
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub category: MediaCategory,
    pub settings: ConversionSettings,
    pub format: FormatOption,
    pub quality: QualityParams,
    pub bound: Option<Bound>,
}

impl ResolvedSettings {
    pub fn format_key(&self) -> &str {
        &self.settings.output_format
    }
}

/// Check that `settings` names a known format for `category` and a known
/// quality (and resolution) for that format.
pub fn validate_settings(
    catalog: &Catalog,
    category: MediaCategory,
    settings: &ConversionSettings,
) -> Result<ResolvedSettings> {
    let formats = catalog.formats(category).ok_or_else(|| {
        ConvertError::UnsupportedFormat(format!("no conversion available for {} files", category))
    })?;

    let format = formats.get(&settings.output_format).ok_or_else(|| {
        ConvertError::Validation(format!(
            "unsupported output format '{}' for {} files",
            settings.output_format, category
        ))
    })?;

    let quality = format.qualities.get(&settings.quality).ok_or_else(|| {
        ConvertError::Validation(format!(
            "unsupported quality '{}' for {}",
            settings.quality, settings.output_format
        ))
    })?;

    let bound = match format.resolutions.get(&settings.resolution) {
        Some(option) => option.bound,
        None if settings.resolution == ORIGINAL => None,
        None => {
            return Err(ConvertError::Validation(format!(
                "unsupported resolution '{}' for {}",
                settings.resolution, settings.output_format
            )))
        }
    };

    Ok(ResolvedSettings {
        category,
        settings: settings.clone(),
        format: format.clone(),
        quality: quality.params.clone(),
        bound,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_settings_resolve() {
        let catalog = Catalog::builtin();
        let resolved = validate_settings(
            &catalog,
            MediaCategory::Image,
            &ConversionSettings::new("jpg", "high", "720p"),
        )
        .unwrap();

        assert_eq!(resolved.quality, QualityParams::Lossy { quality: 85, lossless: false });
        assert_eq!(resolved.bound, Some(Bound::new(1280, 720)));
        assert_eq!(resolved.format.extension, "jpg");
        assert_eq!(resolved.format_key(), "jpg");
    }

    #[test]
    fn test_format_must_belong_to_category() {
        let catalog = Catalog::builtin();
        let err = validate_settings(
            &catalog,
            MediaCategory::Video,
            &ConversionSettings::new("png", "standard", ORIGINAL),
        )
        .unwrap_err();
        assert!(matches!(err, ConvertError::Validation(_)));
    }

    #[test]
    fn test_quality_must_belong_to_format() {
        let catalog = Catalog::builtin();
        // lossless only exists for image webp
        let err = validate_settings(
            &catalog,
            MediaCategory::Image,
            &ConversionSettings::new("jpg", "lossless", ORIGINAL),
        )
        .unwrap_err();
        assert!(err.to_string().contains("lossless"));
    }

    #[test]
    fn test_unknown_resolution_rejected() {
        let catalog = Catalog::builtin();
        assert!(validate_settings(
            &catalog,
            MediaCategory::Video,
            &ConversionSettings::new("webp", "high", "8k"),
        )
        .is_err());
    }

    #[test]
    fn test_original_allowed_without_resolution_table() {
        let catalog = Catalog::builtin();
        let resolved = validate_settings(
            &catalog,
            MediaCategory::Audio,
            &ConversionSettings::new("mp3", "standard", ORIGINAL),
        )
        .unwrap();
        assert_eq!(resolved.bound, None);
    }

    #[test]
    fn test_unknown_category_is_unsupported() {
        let catalog = Catalog::builtin();
        let err = validate_settings(
            &catalog,
            MediaCategory::Unknown,
            &ConversionSettings::new("webp", "standard", ORIGINAL),
        )
        .unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFormat(_)));
    }
}
