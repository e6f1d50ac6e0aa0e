//! Connection Waiter 에러 타입: 호출자가 종류별로 재시도 여부와
//! 메시지를 결정할 수 있도록 구분합니다.

use std::path::PathBuf;
use std::time::Duration;

use super::state_machine::{TransitionError, WaitState};

/// Every way a wait for a launched server can fail.
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("Failed to start the Jupyter server: {0}")]
    SpawnFailed(String),

    #[error("Jupyter server did not announce itself within {timeout:?}")]
    LaunchTimeout { timeout: Duration },

    #[error("Jupyter server exited before it was ready (exit code: {})", fmt_exit_code(.exit_code))]
    ProcessCrashed {
        exit_code: Option<i32>,
        /// Last line the process printed, if any.
        last_output: Option<String>,
    },

    #[error("No running server advertises '{}' ({advertised} listed) after: {announcement}", .directory.display())]
    NoMatchingServer {
        directory: PathBuf,
        /// The listening line that triggered the lookup.
        announcement: String,
        advertised: usize,
    },

    #[error("Waiting for the Jupyter server was cancelled")]
    Cancelled,

    #[error("Failed to list running servers: {0}")]
    EnumerationFailed(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

impl LaunchError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::LaunchTimeout { .. } => "LAUNCH_TIMEOUT",
            Self::ProcessCrashed { .. } => "PROCESS_CRASHED",
            Self::NoMatchingServer { .. } => "NO_MATCHING_SERVER",
            Self::Cancelled => "CANCELLED",
            Self::EnumerationFailed(_) => "ENUMERATION_FAILED",
            Self::InvalidTransition(_) => "INTERNAL_ERROR",
        }
    }

    /// Timeouts and crashes may succeed on a second launch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LaunchTimeout { .. } | Self::ProcessCrashed { .. })
    }

    /// Terminal wait state this error settles in. `None` for errors raised
    /// outside the wait itself.
    pub fn settled_state(&self) -> Option<WaitState> {
        match self {
            Self::LaunchTimeout { .. } => Some(WaitState::TimedOut),
            Self::ProcessCrashed { .. } => Some(WaitState::Crashed),
            Self::Cancelled => Some(WaitState::Cancelled),
            Self::NoMatchingServer { .. } | Self::EnumerationFailed(_) => Some(WaitState::Unresolved),
            Self::SpawnFailed(_) | Self::InvalidTransition(_) => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessCrashed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
            "retryable": self.is_retryable(),
        });
        if let Self::ProcessCrashed { exit_code, .. } = self {
            value["exit_code"] = serde_json::json!(exit_code);
        }
        value
    }
}
