//! Transcode seam
//!
//! The image transform/resize step is an external collaborator; the engine
//! consumes it as an opaque operation on the cache-write path. A transcode
//! failure is never fatal: the raw downloaded bytes are cached instead.

use bytes::Bytes;
use thiserror::Error;

use crate::net::QualityLevel;
use crate::store::ImageVariant;

#[derive(Debug, Error)]
#[error("transcode failed: {0}")]
pub struct TranscodeError(pub String);

/// Transcoded bytes plus any dimensions the transcoder learned
#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub bytes: Bytes,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Host-supplied transform/resize step, applied before persistence
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        bytes: Bytes,
        variant: ImageVariant,
        quality: QualityLevel,
    ) -> Result<TranscodeOutput, TranscodeError>;
}

/// Identity transcoder: caches bytes exactly as downloaded
pub struct PassthroughTranscoder;

impl Transcoder for PassthroughTranscoder {
    fn transcode(
        &self,
        bytes: Bytes,
        _variant: ImageVariant,
        _quality: QualityLevel,
    ) -> Result<TranscodeOutput, TranscodeError> {
        Ok(TranscodeOutput {
            bytes,
            width: None,
            height: None,
        })
    }
}
