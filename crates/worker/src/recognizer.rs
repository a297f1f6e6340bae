//! The inference adapter seam.

use std::sync::Arc;

use crate::validate::ValidImage;

/// Output of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub latex: String,
    pub confidence: f64,
}

/// Inference adapter error.
///
/// The split matters for retry semantics: deterministic failures become
/// failed results (no redelivery), transient ones propagate to the broker's
/// bounded-retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognizeError {
    /// Deterministic: this input will never recognize (e.g. no formula).
    #[error("unrecognizable input: {0}")]
    Unrecognizable(String),

    /// Transient: the inference backend is unreachable or overloaded.
    #[error("inference backend unavailable: {0}")]
    Backend(String),
}

impl RecognizeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RecognizeError::Backend(_))
    }
}

/// Opaque image-to-LaTeX inference function.
///
/// Constructed once per worker process and passed by handle into the receive
/// loop; implementations must be stateless from the caller's point of view.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image: &ValidImage) -> Result<Recognition, RecognizeError>;
}

impl<R> Recognizer for Arc<R>
where
    R: Recognizer + ?Sized,
{
    fn recognize(&self, image: &ValidImage) -> Result<Recognition, RecognizeError> {
        (**self).recognize(image)
    }
}
