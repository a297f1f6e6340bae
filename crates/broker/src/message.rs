//! Wire envelopes for dispatch and results.
//!
//! Field names are the wire contract (JSON encoding). Schemas are strict:
//! unknown fields are rejected before a payload enters the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use texflow_core::{DomainError, ModelId, TaskId, UserId, WorkerId};

/// Task → worker envelope: instructs one worker to process one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchMessage {
    pub task_id: TaskId,
    pub user_id: UserId,
    /// Base64-encoded image payload.
    pub image_data: String,
    pub filename: String,
    pub model_id: ModelId,
    pub timestamp: DateTime<Utc>,
}

impl DispatchMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Dimensions/format of a decoded payload, echoed back on the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Worker → processor envelope: one worker's outcome for one task.
///
/// Immutable once published; correlation is by `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultMessage {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock seconds the worker spent on this task.
    pub processing_time: f64,
    pub success: bool,
    pub latex_code: Option<String>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
    pub image_info: Option<ImageInfo>,
}

impl ResultMessage {
    /// Successful recognition outcome.
    pub fn success(
        task_id: TaskId,
        user_id: UserId,
        worker_id: WorkerId,
        latex_code: String,
        confidence: f64,
        processing_time: f64,
        image_info: ImageInfo,
    ) -> Self {
        Self {
            task_id,
            user_id,
            worker_id,
            timestamp: Utc::now(),
            processing_time,
            success: true,
            latex_code: Some(latex_code),
            confidence: Some(confidence),
            error: None,
            image_info: Some(image_info),
        }
    }

    /// Failed outcome (validation failure, unrecognizable input, adapter error).
    pub fn failure(
        task_id: TaskId,
        user_id: UserId,
        worker_id: WorkerId,
        error: String,
        processing_time: f64,
        image_info: Option<ImageInfo>,
    ) -> Self {
        Self {
            task_id,
            user_id,
            worker_id,
            timestamp: Utc::now(),
            processing_time,
            success: false,
            latex_code: None,
            confidence: None,
            error: Some(error),
            image_info,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Boundary check beyond what serde enforces: a success carries LaTeX,
    /// a failure carries an error reason.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.success && self.latex_code.is_none() {
            return Err(DomainError::validation(
                "success result without latex_code",
            ));
        }
        if !self.success && self.error.is_none() {
            return Err(DomainError::validation("failed result without error"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch() -> DispatchMessage {
        DispatchMessage {
            task_id: TaskId::new(),
            user_id: UserId::new(),
            image_data: "aGVsbG8=".to_string(),
            filename: "formula.png".to_string(),
            model_id: ModelId::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn dispatch_round_trips_with_wire_field_names() {
        let msg = dispatch();
        let bytes = msg.to_bytes().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for field in ["task_id", "user_id", "image_data", "filename", "model_id", "timestamp"] {
            assert!(value.get(field).is_some(), "missing wire field {field}");
        }

        assert_eq!(DispatchMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let msg = dispatch();
        let mut value = serde_json::to_value(&msg).unwrap();
        value["surprise"] = serde_json::json!(true);
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(DispatchMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn result_constructors_satisfy_validation() {
        let ok = ResultMessage::success(
            TaskId::new(),
            UserId::new(),
            WorkerId::new("worker-1"),
            "x^2".to_string(),
            0.97,
            1.25,
            ImageInfo {
                width: 640,
                height: 480,
                format: "png".to_string(),
            },
        );
        ok.validate().unwrap();
        assert!(ok.success);
        assert_eq!(ok.latex_code.as_deref(), Some("x^2"));
        assert!(ok.error.is_none());

        let failed = ResultMessage::failure(
            TaskId::new(),
            UserId::new(),
            WorkerId::new("worker-1"),
            "unrecognizable image".to_string(),
            0.5,
            None,
        );
        failed.validate().unwrap();
        assert!(!failed.success);
        assert!(failed.latex_code.is_none());
    }

    #[test]
    fn inconsistent_results_fail_validation() {
        let mut msg = ResultMessage::failure(
            TaskId::new(),
            UserId::new(),
            WorkerId::new("worker-1"),
            "boom".to_string(),
            0.0,
            None,
        );
        msg.success = true; // success without latex_code
        assert!(msg.validate().is_err());

        msg.success = false;
        msg.error = None; // failure without a reason
        assert!(msg.validate().is_err());
    }
}
