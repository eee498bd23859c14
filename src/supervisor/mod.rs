//! Backend process supervisor.
//!
//! Owns at most one backend child. `start` spawns it with inherited stdio and
//! registers an exit observer; `stop` signals the child and returns only after
//! the observer has seen the process go away, so a following `start` never races
//! a still-exiting instance.

pub mod error;
pub mod process;
pub mod state_machine;

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::backend::{build_args, BackendConfig, Mode};
use crate::utils::{current_timestamp, inherited_command};
pub use error::SupervisorError;
use process::ProcessError;
pub use state_machine::State;
use state_machine::StateMachine;

/// How a `stop()` call completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was tracked; no signal was sent.
    AlreadyStopped,
    /// Exited after the termination signal.
    Stopped,
    /// Did not exit within the stop timeout and was force-killed.
    Killed,
}

/// Serializable snapshot for logs and the dev server status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub state: State,
    pub pid: Option<u32>,
    pub program: Option<String>,
    pub started_at: Option<u64>,
    pub last_exit: Option<String>,
}

struct Tracked {
    pid: u32,
    program: String,
    started_at: u64,
    running_rx: watch::Receiver<bool>,
    signal_tx: mpsc::UnboundedSender<SignalRequest>,
}

/// Handed to the exit observer, which owns the `Child` and so is the only one
/// that knows the pid has not been reaped yet.
struct SignalRequest {
    force: bool,
    reply: oneshot::Sender<Result<(), ProcessError>>,
}

#[derive(Default)]
struct Slot {
    machine: StateMachine,
    current: Option<Tracked>,
    last_exit: Option<String>,
}

pub struct BackendSupervisor {
    slot: Arc<Mutex<Slot>>,
    /// start/stop 직렬화. The slot itself is also touched by the exit observer,
    /// which must never wait on this lock.
    lifecycle: tokio::sync::Mutex<()>,
    stop_timeout: Option<Duration>,
}

impl Default for BackendSupervisor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BackendSupervisor {
    /// `stop_timeout = None` keeps the unbounded wait: a child that ignores
    /// SIGTERM blocks `stop()` forever.
    pub fn new(stop_timeout: Option<Duration>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            lifecycle: tokio::sync::Mutex::new(()),
            stop_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slot>, SupervisorError> {
        lock_slot(&self.slot)
    }

    /// Spawn `program` with `args` in `working_dir`. Only valid from Stopped.
    pub async fn start(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<u32, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;

        let program_name = program.display().to_string();
        let (mut child, pid, running_tx, mut signal_rx) = {
            let mut slot = self.lock()?;
            if let Some(tracked) = slot.current.as_ref() {
                return Err(SupervisorError::AlreadyRunning(tracked.pid));
            }

            let child = inherited_command(program, args, Some(working_dir))
                .spawn()
                .map_err(|source| SupervisorError::SpawnFailed {
                    program: program_name.clone(),
                    source,
                })?;

            let pid = child_pid(child.id(), &program_name)?;
            let (running_tx, running_rx) = watch::channel(true);
            let (signal_tx, signal_rx) = mpsc::unbounded_channel();

            slot.machine.transition(State::Running)?;
            slot.current = Some(Tracked {
                pid,
                program: program_name.clone(),
                started_at: current_timestamp(),
                running_rx,
                signal_tx,
            });
            (child, pid, running_tx, signal_rx)
        };

        tracing::info!("Backend '{}' started with PID {} (args: {:?})", program_name, pid, args);

        // ── exit observer ────────────────────────────────────
        let observed = self.slot.clone();
        tokio::spawn(async move {
            let exit_msg = loop {
                tokio::select! {
                    biased;
                    status = child.wait() => break match status {
                        Ok(status) => format!("exited with {}", status),
                        Err(e) => format!("wait failed: {}", e),
                    },
                    Some(req) = signal_rx.recv() => {
                        // 아직 reap 전이면 id() 가 Some — pid 재사용 걱정 없음
                        let result = match child.id() {
                            Some(pid) => process::terminate(pid, req.force),
                            None => Ok(()),
                        };
                        let _ = req.reply.send(result);
                    }
                }
            };
            tracing::info!("Backend (pid {}) {}", pid, exit_msg);

            match lock_slot(&observed) {
                Ok(mut slot) => {
                    if slot.current.as_ref().map(|t| t.pid) == Some(pid) {
                        slot.current = None;
                        slot.last_exit = Some(exit_msg);
                        if let Err(e) = slot.machine.transition(State::Stopped) {
                            tracing::warn!("Backend exit bookkeeping: {}", e);
                        }
                    }
                }
                Err(e) => tracing::error!("Backend exit observer: {}", e),
            }
            // 슬롯 정리 후에 알림 — stop() 이 돌아올 때 이미 Stopped
            let _ = running_tx.send(false);
        });

        Ok(pid)
    }

    /// Build the argument vector for `mode` and start `cfg.binary_path`.
    pub async fn launch(&self, mode: Mode, cfg: &BackendConfig) -> Result<u32, SupervisorError> {
        let args = build_args(mode, cfg);
        self.start(&cfg.binary_path, &args, &cfg.working_dir).await
    }

    /// Idempotent stop. Returns after the tracked process has actually exited.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;

        let (pid, mut running_rx, signal_tx) = {
            let slot = self.lock()?;
            match slot.current.as_ref() {
                Some(tracked) => (
                    tracked.pid,
                    tracked.running_rx.clone(),
                    tracked.signal_tx.clone(),
                ),
                None => {
                    tracing::debug!("Backend not running, nothing to stop");
                    return Ok(StopOutcome::AlreadyStopped);
                }
            }
        };

        if *running_rx.borrow() {
            request_signal(&signal_tx, false).await?;
        }
        self.mark_stopping(pid)?;

        let outcome = match self.stop_timeout {
            None => {
                wait_until_exited(&mut running_rx).await;
                StopOutcome::Stopped
            }
            Some(limit) => {
                match tokio::time::timeout(limit, wait_until_exited(&mut running_rx)).await {
                    Ok(()) => StopOutcome::Stopped,
                    Err(_) => {
                        tracing::warn!(
                            "Backend (pid {}) still alive after {:?}, killing",
                            pid,
                            limit
                        );
                        request_signal(&signal_tx, true).await?;
                        wait_until_exited(&mut running_rx).await;
                        StopOutcome::Killed
                    }
                }
            }
        };

        tracing::info!("Backend (pid {}) stopped ({:?})", pid, outcome);
        Ok(outcome)
    }

    fn mark_stopping(&self, pid: u32) -> Result<(), SupervisorError> {
        let mut slot = self.lock()?;
        // observer 가 이미 정리했다면 상태는 Stopped
        if slot.current.as_ref().map(|t| t.pid) == Some(pid) {
            slot.machine.transition(State::Stopping)?;
        }
        Ok(())
    }

    /// Wait for the current backend to exit on its own, without signalling it.
    pub async fn wait_for_exit(&self) -> Result<(), SupervisorError> {
        let rx = self.lock()?.current.as_ref().map(|t| t.running_rx.clone());
        if let Some(mut rx) = rx {
            wait_until_exited(&mut rx).await;
        }
        Ok(())
    }

    pub fn state(&self) -> State {
        self.lock().map(|s| s.machine.state).unwrap_or(State::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.state() != State::Stopped
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().ok().and_then(|s| s.current.as_ref().map(|t| t.pid))
    }

    pub fn status(&self) -> BackendStatus {
        match self.lock() {
            Ok(slot) => BackendStatus {
                state: slot.machine.state,
                pid: slot.current.as_ref().map(|t| t.pid),
                program: slot.current.as_ref().map(|t| t.program.clone()),
                started_at: slot.current.as_ref().map(|t| t.started_at),
                last_exit: slot.last_exit.clone(),
            },
            Err(_) => BackendStatus {
                state: State::Stopped,
                pid: None,
                program: None,
                started_at: None,
                last_exit: None,
            },
        }
    }
}

fn lock_slot(slot: &Mutex<Slot>) -> Result<MutexGuard<'_, Slot>, SupervisorError> {
    slot.lock().map_err(|e| {
        tracing::error!("Supervisor lock poisoned: {}", e);
        SupervisorError::LockPoisoned
    })
}

fn child_pid(id: Option<u32>, program: &str) -> Result<u32, SupervisorError> {
    match id {
        Some(pid) if pid != 0 => Ok(pid),
        // pid 0 으로 kill 하면 devserve 자신의 프로세스 그룹이 맞는다
        _ => Err(SupervisorError::NoPid(program.to_string())),
    }
}

/// Ask the exit observer to signal the child. A closed channel means the
/// observer has already seen the exit, which is what the caller wanted.
async fn request_signal(
    signal_tx: &mpsc::UnboundedSender<SignalRequest>,
    force: bool,
) -> Result<(), SupervisorError> {
    let (reply, reply_rx) = oneshot::channel();
    if signal_tx.send(SignalRequest { force, reply }).is_err() {
        return Ok(());
    }
    match reply_rx.await {
        // 시그널 직전에 스스로 종료됨 — observer 를 기다리기만 하면 된다
        Ok(Ok(())) | Ok(Err(ProcessError::NotFound { .. })) | Err(_) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
    }
}

async fn wait_until_exited(rx: &mut watch::Receiver<bool>) {
    while *rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
