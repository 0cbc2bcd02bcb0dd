//! Uniform conversion contract over the frame engine and the raster resampler

use crate::audio::AudioConverter;
use crate::classify::MediaCategory;
use crate::engine::SharedEngine;
use crate::error::{ConvertError, Result};
use crate::image::ImageConverter;
use crate::job::SourceFile;
use crate::progress::Progress;
use crate::validation::ResolvedSettings;
use crate::video::VideoConverter;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Receives progress while a conversion runs; may fire zero or more times
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `input` with already validated settings, returning the output bytes.
    ///
    /// Every failure comes back as a [`ConvertError`]; implementations clean up
    /// whatever they staged before returning.
    async fn convert(
        &self,
        input: &SourceFile,
        settings: &ResolvedSettings,
        on_progress: ProgressFn,
    ) -> Result<Bytes>;
}

/// Converter per media category
#[derive(Clone, Default)]
pub struct Backends {
    converters: BTreeMap<MediaCategory, Arc<dyn Converter>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame engine for video and audio, in-process resampler for images
    pub fn standard(engine: Arc<SharedEngine>) -> Self {
        Self::new()
            .with(MediaCategory::Video, VideoConverter::new(Arc::clone(&engine)))
            .with(MediaCategory::Image, ImageConverter::new())
            .with(MediaCategory::Audio, AudioConverter::new(engine))
    }

    pub fn with(mut self, category: MediaCategory, converter: impl Converter + 'static) -> Self {
        self.converters.insert(category, Arc::new(converter));
        self
    }

    pub fn with_shared(mut self, category: MediaCategory, converter: Arc<dyn Converter>) -> Self {
        self.converters.insert(category, converter);
        self
    }

    pub fn for_category(&self, category: MediaCategory) -> Result<Arc<dyn Converter>> {
        self.converters.get(&category).cloned().ok_or_else(|| {
            ConvertError::UnsupportedFormat(format!("no converter registered for {} files", category))
        })
    }
}
