//! Supervisor 에러 타입.

use super::process::ProcessError;
use super::state_machine::TransitionError;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// Missing or non-executable binary. Treated as fatal by the task pipeline.
    #[error("failed to spawn backend '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Spawned, but the OS gave no pid to track it by.
    #[error("backend '{0}' has no pid after spawn")]
    NoPid(String),

    #[error("backend is already running (pid {0}); stop it first")]
    AlreadyRunning(u32),

    #[error(transparent)]
    Signal(#[from] ProcessError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("supervisor state lock poisoned")]
    LockPoisoned,
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SpawnFailed { .. } | Self::NoPid(_) => "SPAWN_FAILED",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::Signal(_) => "SIGNAL_FAILED",
            Self::Transition(_) => "INVALID_TRANSITION",
            Self::LockPoisoned => "INTERNAL_ERROR",
        }
    }
}
