//! Inference workers: turn dispatch messages into result messages.
//!
//! Each worker runs a blocking receive-process-publish loop on its own OS
//! thread. The result is always published **before** the dispatch message is
//! acknowledged, so a crash between inference and ack can only cause
//! redelivery (duplicate work), never a lost result.

pub mod handle;
pub mod recognizer;
pub mod validate;
pub mod worker;

pub use handle::WorkerHandle;
pub use recognizer::{Recognition, RecognizeError, Recognizer};
pub use validate::{decode_payload, ValidImage};
pub use worker::{RecognitionWorker, WorkerConfig, WorkerPool};
