use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process {pid} not found")]
    NotFound { pid: u32 },
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// Ask a process to exit (`force = false`) or kill it outright (크로스 플랫폼).
///
/// On unix the graceful path is SIGTERM and the forced path SIGKILL. Windows has no
/// graceful equivalent for a console child, so both paths use `TerminateProcess`.
pub fn terminate(pid: u32, force: bool) -> Result<(), ProcessError> {
    let signal_name = if force { "KILL" } else { "TERM" };
    tracing::info!("Sending {} to backend (pid: {})", signal_name, pid);

    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(ProcessError::NotFound { pid });
            }

            let exit_code = if force { 1 } else { 0 };
            let result = TerminateProcess(handle, exit_code);
            CloseHandle(handle);

            if result == 0 {
                return Err(ProcessError::TerminationFailed {
                    pid,
                    reason: "TerminateProcess failed".to_string(),
                });
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Err(ProcessError::NotFound { pid }),
            Err(e) => {
                return Err(ProcessError::TerminationFailed {
                    pid,
                    reason: format!("Failed to send signal: {}", e),
                })
            }
        }
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_terminate_unknown_pid_is_not_found() {
        // pid_max 는 보통 4194304 이하
        let result = terminate(99_999_999, false);
        assert!(matches!(result, Err(ProcessError::NotFound { .. })));
    }

    #[test]
    fn test_terminate_live_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        terminate(child.id(), false).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
