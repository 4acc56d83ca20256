//! Generation requests and render options.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use super::types::{RequestId, ResponseMode};
use crate::error::{Error, Result};

/// How the source image is framed before animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessMode {
    /// Crop to the detected face (default)
    #[default]
    Crop,
    /// Resize the whole image
    Resize,
    /// Keep the full frame
    Full,
    /// Crop with extended margins
    ExtCrop,
    /// Full frame with extended margins
    ExtFull,
}

impl PreprocessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreprocessMode::Crop => "crop",
            PreprocessMode::Resize => "resize",
            PreprocessMode::Full => "full",
            PreprocessMode::ExtCrop => "extcrop",
            PreprocessMode::ExtFull => "extfull",
        }
    }
}

/// Rendering options forwarded to the compute stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Source image framing mode
    #[serde(default)]
    pub preprocess: PreprocessMode,

    /// Suppress head motion
    #[serde(default)]
    pub still_mode: bool,

    /// Run the face enhancer over rendered frames
    #[serde(default)]
    pub use_enhancer: bool,

    /// Run the background enhancer over rendered frames
    #[serde(default)]
    pub background_enhancer: bool,

    /// Render batch size; forwarded to the render stage, not scheduled here
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Model resolution (256 or 512)
    #[serde(default = "default_size")]
    pub size: u32,

    /// Reference pose style index
    #[serde(default)]
    pub pose_style: u32,

    /// Expression intensity factor
    #[serde(default = "default_expression_scale")]
    pub expression_scale: f32,
}

fn default_batch_size() -> u32 {
    2
}

fn default_size() -> u32 {
    256
}

fn default_expression_scale() -> f32 {
    1.0
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            preprocess: PreprocessMode::default(),
            still_mode: false,
            use_enhancer: false,
            background_enhancer: false,
            batch_size: default_batch_size(),
            size: default_size(),
            pose_style: 0,
            expression_scale: default_expression_scale(),
        }
    }
}

impl RenderOptions {
    /// Whether the optional enhancing stage runs at all.
    pub fn wants_enhancement(&self) -> bool {
        self.use_enhancer || self.background_enhancer
    }

    /// Check every recognized field against its accepted range.
    ///
    /// Out-of-range values are hard errors, not clamps: the request never
    /// reaches admission.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.batch_size) {
            return Err(Error::Validation(format!(
                "batch_size must be in [1, 10], got {}",
                self.batch_size
            )));
        }
        if self.size != 256 && self.size != 512 {
            return Err(Error::Validation(format!(
                "size must be 256 or 512, got {}",
                self.size
            )));
        }
        if self.pose_style > 46 {
            return Err(Error::Validation(format!(
                "pose_style must be in [0, 46], got {}",
                self.pose_style
            )));
        }
        if !(self.expression_scale > 0.0 && self.expression_scale <= 3.0) {
            return Err(Error::Validation(format!(
                "expression_scale must be in (0, 3.0], got {}",
                self.expression_scale
            )));
        }
        Ok(())
    }
}

/// One client-submitted unit of work.
///
/// Immutable once constructed; exactly one request maps to exactly one job.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: RequestId,
    pub image: Vec<u8>,
    pub audio: Vec<u8>,
    pub options: RenderOptions,
    pub response_mode: ResponseMode,
    pub received_at: Instant,
}

impl GenerationRequest {
    pub fn new(image: Vec<u8>, audio: Vec<u8>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            image,
            audio,
            options: RenderOptions::default(),
            response_mode: ResponseMode::default(),
            received_at: Instant::now(),
        }
    }

    /// Use a client-supplied request id instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    /// Validate payload shape and option ranges.
    ///
    /// Runs before admission; a failure here never occupies a queue slot.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.is_empty() {
            return Err(Error::Validation("request_id must not be empty".into()));
        }
        if self.image.is_empty() {
            return Err(Error::Validation("image payload is empty".into()));
        }
        if self.audio.is_empty() {
            return Err(Error::Validation("audio payload is empty".into()));
        }
        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options: RenderOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.preprocess, PreprocessMode::Crop);
        assert_eq!(options.batch_size, 2);
        assert_eq!(options.size, 256);
        assert_eq!(options.expression_scale, 1.0);
        assert!(!options.wants_enhancement());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_preprocess_mode_wire_names() {
        let mode: PreprocessMode = serde_json::from_str("\"extcrop\"").unwrap();
        assert_eq!(mode, PreprocessMode::ExtCrop);
        assert_eq!(PreprocessMode::ExtFull.as_str(), "extfull");
    }

    #[test]
    fn test_out_of_range_options_fail_validation() {
        let mut options = RenderOptions::default();
        options.expression_scale = 5.0;
        assert!(options.validate().is_err());

        let mut options = RenderOptions::default();
        options.expression_scale = 0.0;
        assert!(options.validate().is_err());

        let mut options = RenderOptions::default();
        options.expression_scale = f32::NAN;
        assert!(options.validate().is_err());

        let mut options = RenderOptions::default();
        options.batch_size = 11;
        assert!(options.validate().is_err());

        let mut options = RenderOptions::default();
        options.size = 384;
        assert!(options.validate().is_err());

        let mut options = RenderOptions::default();
        options.pose_style = 47;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_request_validation() {
        let request = GenerationRequest::new(vec![1], vec![2]);
        assert!(request.validate().is_ok());

        let request = GenerationRequest::new(Vec::new(), vec![2]);
        assert!(matches!(request.validate(), Err(Error::Validation(_))));
    }
}
