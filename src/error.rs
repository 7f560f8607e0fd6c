use serde::Serialize;
use std::time::Duration;

use crate::frame::FrameError;
use crate::vlm::VlmError;
use crate::world_model::WorldModelError;

/// Errors that end a scenario run at a particular step.
///
/// Each variant maps to one failure class of the step pipeline
/// (clip generation, frame decoding, VLM decision). A run that hits any of
/// these stops with a `Failed` status and keeps the steps completed so far.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// The world model did not finish the clip within the polling bound
    #[error("world model clip not ready after {waited_ms} ms")]
    AdapterTimeout { waited_ms: u64 },

    /// The world model reported a failure or could not be reached
    #[error("world model error: {message}")]
    Adapter { message: String },

    /// The clip could not be decoded into a frame
    #[error("frame decode error: {message}")]
    Decode { message: String },

    /// The VLM did not answer within the decision timeout
    #[error("VLM decision timed out after {waited_ms} ms")]
    BackendTimeout { waited_ms: u64 },

    /// The VLM call failed
    #[error("VLM backend error: {message}")]
    Backend { message: String },

    /// The whole-scenario wall clock ran out
    #[error("scenario timed out after {waited_ms} ms")]
    ScenarioTimeout { waited_ms: u64 },
}

impl StepError {
    pub fn adapter_timeout(waited: Duration) -> Self {
        StepError::AdapterTimeout {
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn backend_timeout(waited: Duration) -> Self {
        StepError::BackendTimeout {
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn scenario_timeout(waited: Duration) -> Self {
        StepError::ScenarioTimeout {
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Whether this error came from a timeout rather than a reported failure
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StepError::AdapterTimeout { .. }
                | StepError::BackendTimeout { .. }
                | StepError::ScenarioTimeout { .. }
        )
    }
}

impl From<WorldModelError> for StepError {
    fn from(err: WorldModelError) -> Self {
        StepError::Adapter {
            message: err.to_string(),
        }
    }
}

impl From<FrameError> for StepError {
    fn from(err: FrameError) -> Self {
        StepError::Decode {
            message: err.to_string(),
        }
    }
}

impl From<VlmError> for StepError {
    fn from(err: VlmError) -> Self {
        match err {
            VlmError::Timeout(waited) => StepError::backend_timeout(waited),
            other => StepError::Backend {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlm_timeout_maps_to_backend_timeout() {
        let err: StepError = VlmError::Timeout(Duration::from_millis(1500)).into();
        assert_eq!(err, StepError::BackendTimeout { waited_ms: 1500 });
        assert!(err.is_timeout());
    }

    #[test]
    fn test_world_model_error_maps_to_adapter() {
        let err: StepError = WorldModelError::Rejected("quota exceeded".to_string()).into();
        assert!(matches!(err, StepError::Adapter { ref message } if message.contains("quota exceeded")));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = StepError::adapter_timeout(Duration::from_secs(2));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "adapter_timeout");
        assert_eq!(json["waited_ms"], 2000);
    }
}
