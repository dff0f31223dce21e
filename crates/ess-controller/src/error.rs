//! Error types for the ESS controller.

use crate::response::ResponseCode;

/// A command that could not be executed; carries the code sent back to the
/// client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{msg}")]
pub struct CommandError {
    pub msg: String,
    pub response_code: ResponseCode,
}

impl CommandError {
    pub fn new(response_code: ResponseCode, msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            response_code,
        }
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::new(ResponseCode::InvalidConfiguration, msg)
    }
}

/// Infrastructure failures of the controller itself.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("simulation_mode={0} not in valid simulation modes (0, 1)")]
    InvalidSimulationMode(i64),

    #[error("device {name}: {message}")]
    Device { name: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server is not bound; call bind() first")]
    NotBound,
}

impl ControllerError {
    pub fn device(name: impl Into<String>, message: impl Into<String>) -> Self {
        ControllerError::Device {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
