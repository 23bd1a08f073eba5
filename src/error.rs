//! Error types.

use crate::core::handle::AddressableHandle;
use std::time::Duration;
use thiserror::Error;

/// Failure of a dispatched command or directive.
///
/// Every variant reaches the original caller; nothing is retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("module '{module}' not found at {destination}")]
    ModuleNotFound {
        module: String,
        destination: AddressableHandle,
    },

    #[error("command '{command}' not found in module '{module}'")]
    CommandNotFound { module: String, command: String },

    #[error("destination {destination} unavailable: {reason}")]
    DestinationUnavailable {
        destination: AddressableHandle,
        reason: String,
    },

    #[error("{module}.{command} failed: {message}")]
    HandlerExecution {
        module: String,
        command: String,
        message: String,
    },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid event name '{0}', expected '<module>.<event>'")]
    InvalidEventName(String),
}

impl DispatchError {
    pub(crate) fn unavailable(destination: AddressableHandle, reason: impl Into<String>) -> Self {
        DispatchError::DestinationUnavailable {
            destination,
            reason: reason.into(),
        }
    }

    /// Outcome of a module that failed to run `module.command`.
    pub(crate) fn from_module(module: &str, command: &str, err: ModuleError) -> Self {
        match err {
            ModuleError::UnknownCommand(_) => DispatchError::CommandNotFound {
                module: module.to_string(),
                command: command.to_string(),
            },
            ModuleError::Failed(err) => DispatchError::HandlerExecution {
                module: module.to_string(),
                command: command.to_string(),
                message: format!("{:#}", err),
            },
        }
    }
}

/// Error returned by a module's command implementation.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
