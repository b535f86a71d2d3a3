//! Error taxonomy for the acquisition and perception boundaries.
//!
//! Backends use `anyhow` internally and convert at the trait boundary. None of
//! these errors propagate past the component that observes them: capture errors
//! become a `ConnectionState`, perception errors drop one camera's contribution
//! for one cycle.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a `Connector` or `FrameReader`.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The source could not be opened (transient; retried with backoff).
    #[error("connection failed: {0}")]
    Connection(String),
    /// A frame arrived but could not be decoded (transient, per frame).
    #[error("frame decode failed: {0}")]
    Decode(String),
    /// No frame arrived within the per-attempt timeout.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    /// The stream or file ended.
    #[error("stream ended")]
    EndOfStream,
    /// The strategy needs a backend that is not compiled in or does not apply
    /// to this source kind.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl CaptureError {
    pub fn connection(err: anyhow::Error) -> Self {
        Self::Connection(format!("{:#}", err))
    }

    pub fn decode(err: anyhow::Error) -> Self {
        Self::Decode(format!("{:#}", err))
    }

    /// Whether the failure should count toward the consecutive-failure threshold
    /// without tearing the connection down immediately.
    pub fn is_per_frame(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Timeout(_))
    }
}

/// Failure reported by a detection or tracking collaborator.
#[derive(Debug, Error)]
pub enum PerceptionError {
    #[error("detection unavailable: {0}")]
    DetectionUnavailable(String),
    #[error("tracking unavailable: {0}")]
    TrackingUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_and_timeout_are_per_frame() {
        assert!(CaptureError::Decode("bad jpeg".into()).is_per_frame());
        assert!(CaptureError::Timeout(Duration::from_millis(5)).is_per_frame());
        assert!(!CaptureError::EndOfStream.is_per_frame());
        assert!(!CaptureError::Connection("refused".into()).is_per_frame());
    }

    #[test]
    fn connection_error_keeps_context_chain() {
        let err = anyhow::anyhow!("refused").context("open rtsp://cam");
        let capture = CaptureError::connection(err);
        assert_eq!(
            capture.to_string(),
            "connection failed: open rtsp://cam: refused"
        );
    }
}
