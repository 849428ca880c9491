use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::mem;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bias_link::{
    BiasCommand, BiasLink, BiasReply, Polarity, ResultCode, CODE_BAD_REPLY, CODE_LINK_ERROR,
    CODE_TIMEOUT,
};
use crate::error::ErrorKind;
use crate::lock;

/// Bound applied to status and voltage queries when the caller has none.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_micros(100_000);

#[derive(Debug, Clone)]
pub struct BiasSettings {
    /// Bound for setpoint, polarity and enable commands.
    pub command_timeout: Duration,
}

impl Default for BiasSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasStatus {
    pub enabled: bool,
    pub is_negative: bool,
}

/// Applied output voltage as measured by the supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasVoltage {
    pub millivolts: i32,
}

impl BiasVoltage {
    pub fn volts(&self) -> f64 {
        f64::from(self.millivolts) / 1000.0
    }
}

/// Last values the hardware acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BiasState {
    pub setpoint_mv: Option<i32>,
    pub polarity: Option<Polarity>,
    pub enabled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BiasError {
    #[error("Bias I/O is not started, cannot {operation}")]
    IoNotStarted { operation: &'static str },

    #[error("Bias {operation} failed with code {code}")]
    DeviceFault {
        operation: &'static str,
        code: ResultCode,
    },

    #[error("Bias {operation} timed out (code {code})")]
    Timeout {
        operation: &'static str,
        code: ResultCode,
    },

    #[error("Bias I/O is starting or stopping")]
    InTransition,

    #[error("Bias link was lost after its I/O worker exited abnormally")]
    LinkLost,

    #[error("Failed to spawn bias I/O worker: {0}")]
    Spawn(#[source] io::Error),
}

impl BiasError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BiasError::IoNotStarted { .. } | BiasError::InTransition => ErrorKind::InvalidState,
            BiasError::DeviceFault { .. } => ErrorKind::DeviceFault,
            BiasError::Timeout { .. } => ErrorKind::Timeout,
            BiasError::LinkLost | BiasError::Spawn(_) => ErrorKind::IoFailure,
        }
    }

    /// Classify a nonzero hardware code.
    pub fn from_code(operation: &'static str, code: ResultCode) -> Self {
        if code == CODE_TIMEOUT {
            BiasError::Timeout { operation, code }
        } else {
            BiasError::DeviceFault { operation, code }
        }
    }

    pub fn code(&self) -> Option<ResultCode> {
        match self {
            BiasError::DeviceFault { code, .. } | BiasError::Timeout { code, .. } => Some(*code),
            _ => None,
        }
    }
}

struct Request {
    command: BiasCommand,
    /// The caller stops waiting at this instant.
    deadline: Instant,
    reply: Sender<Result<BiasReply, ResultCode>>,
}

enum IoState<L> {
    Parked(L),
    /// The worker is opening the link; nothing may be queued yet.
    Starting,
    Running {
        requests: Sender<Request>,
        worker: JoinHandle<Option<L>>,
    },
    /// The worker is draining its queue and closing the link.
    Stopping,
    Lost,
}

/// Serialized access to the bias supply.
///
/// A dedicated I/O thread owns the link and executes one request at a time.
/// Callers hand it a request with a private reply channel and wait no longer
/// than the request's timeout, so an unresponsive supply cannot stall them.
/// A request still queued when its caller gave up is never sent to the
/// hardware.
///
/// The `io` lock is only held for state swaps. Opening the link and joining
/// the worker happen outside it, so queries issued during `start_io` or
/// `stop_io` fail fast with `IoNotStarted` instead of waiting.
pub struct BiasController<L: BiasLink> {
    settings: BiasSettings,
    io: Mutex<IoState<L>>,
    commanded: Mutex<BiasState>,
}

impl<L: BiasLink> BiasController<L> {
    pub fn new(link: L, settings: BiasSettings) -> Self {
        Self {
            settings,
            io: Mutex::new(IoState::Parked(link)),
            commanded: Mutex::new(BiasState::default()),
        }
    }

    pub fn settings(&self) -> &BiasSettings {
        &self.settings
    }

    pub fn is_io_started(&self) -> bool {
        matches!(*lock(&self.io), IoState::Running { .. })
    }

    /// Open the link on a fresh I/O thread. Does nothing if already running.
    pub fn start_io(&self) -> Result<(), BiasError> {
        let link = {
            let mut io = lock(&self.io);
            match mem::replace(&mut *io, IoState::Starting) {
                IoState::Parked(link) => link,
                other => {
                    let outcome = match other {
                        IoState::Running { .. } => Ok(()),
                        IoState::Lost => Err(BiasError::LinkLost),
                        _ => Err(BiasError::InTransition),
                    };
                    *io = other;
                    return outcome;
                }
            }
        };

        let (handoff_tx, handoff_rx) = crossbeam_channel::bounded(1);
        let (requests_tx, requests_rx) = crossbeam_channel::unbounded();
        let (opened_tx, opened_rx) = crossbeam_channel::bounded(1);
        // Cannot fail: the receiver is alive and the slot is empty.
        let _ = handoff_tx.send(link);

        let spawned = {
            let handoff_rx = handoff_rx.clone();
            thread::Builder::new()
                .name("bias-io".to_string())
                .spawn(move || run_worker(&handoff_rx, &requests_rx, &opened_tx))
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                *lock(&self.io) = handoff_rx
                    .try_recv()
                    .map_or(IoState::Lost, IoState::Parked);
                log::error!("Cannot spawn bias I/O worker: {}", e);
                return Err(BiasError::Spawn(e));
            }
        };

        let (state, outcome) = match opened_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Bias I/O started");
                (
                    IoState::Running {
                        requests: requests_tx,
                        worker,
                    },
                    Ok(()),
                )
            }
            Ok(Err(code)) => {
                log::error!("Bias link failed to open with code {}", code);
                (reap(worker), Err(BiasError::from_code("start_io", code)))
            }
            Err(_) => (reap(worker), Err(BiasError::LinkLost)),
        };
        *lock(&self.io) = state;
        outcome
    }

    /// Close the link and join the I/O thread. The link is kept so a later
    /// `start_io` can reopen it. Does nothing unless running.
    pub fn stop_io(&self) {
        let (requests, worker) = {
            let mut io = lock(&self.io);
            match mem::replace(&mut *io, IoState::Stopping) {
                IoState::Running { requests, worker } => (requests, worker),
                other => {
                    *io = other;
                    return;
                }
            }
        };

        log::info!("Stopping bias I/O");
        drop(requests);
        let state = reap(worker);
        *lock(&self.io) = state;
    }

    pub fn set_voltage(&self, millivolts: i32) -> Result<(), BiasError> {
        log::info!("Setting bias setpoint to {} mV", millivolts);
        self.command(BiasCommand::SetVoltage(millivolts))?;
        lock(&self.commanded).setpoint_mv = Some(millivolts);
        Ok(())
    }

    pub fn set_polarity(&self, polarity: Polarity) -> Result<(), BiasError> {
        log::info!("Setting bias polarity to {:?}", polarity);
        self.command(BiasCommand::SetPolarity(polarity))?;
        lock(&self.commanded).polarity = Some(polarity);
        Ok(())
    }

    pub fn hv_on(&self) -> Result<(), BiasError> {
        log::info!("Enabling bias output");
        self.command(BiasCommand::HvOn)?;
        lock(&self.commanded).enabled = true;
        Ok(())
    }

    pub fn hv_off(&self) -> Result<(), BiasError> {
        log::info!("Disabling bias output");
        self.command(BiasCommand::HvOff)?;
        lock(&self.commanded).enabled = false;
        Ok(())
    }

    pub fn get_status(&self, timeout: Duration) -> Result<BiasStatus, BiasError> {
        match self.request(BiasCommand::QueryStatus, timeout)? {
            BiasReply::Status {
                enabled,
                is_negative,
            } => Ok(BiasStatus {
                enabled,
                is_negative,
            }),
            other => Err(unexpected(BiasCommand::QueryStatus, other)),
        }
    }

    pub fn get_voltage(&self, timeout: Duration) -> Result<BiasVoltage, BiasError> {
        match self.request(BiasCommand::QueryVoltage, timeout)? {
            BiasReply::Voltage { millivolts } => Ok(BiasVoltage { millivolts }),
            other => Err(unexpected(BiasCommand::QueryVoltage, other)),
        }
    }

    pub fn commanded_state(&self) -> BiasState {
        *lock(&self.commanded)
    }

    fn command(&self, command: BiasCommand) -> Result<(), BiasError> {
        match self.request(command, self.settings.command_timeout)? {
            BiasReply::Ack => Ok(()),
            other => Err(unexpected(command, other)),
        }
    }

    fn request(&self, command: BiasCommand, timeout: Duration) -> Result<BiasReply, BiasError> {
        let operation = command.name();
        let requests = match &*lock(&self.io) {
            IoState::Running { requests, .. } => requests.clone(),
            _ => return Err(BiasError::IoNotStarted { operation }),
        };

        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        requests
            .send(Request {
                command,
                deadline,
                reply: reply_tx,
            })
            .map_err(|_| BiasError::IoNotStarted { operation })?;
        drop(requests);

        match reply_rx.recv_deadline(deadline) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(code)) => {
                log::warn!("Bias {} returned code {}", operation, code);
                Err(BiasError::from_code(operation, code))
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Bias {} timed out after {:?}", operation, timeout);
                Err(BiasError::Timeout {
                    operation,
                    code: CODE_TIMEOUT,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(BiasError::DeviceFault {
                operation,
                code: CODE_LINK_ERROR,
            }),
        }
    }
}

impl<L: BiasLink> Drop for BiasController<L> {
    fn drop(&mut self) {
        self.stop_io();
    }
}

fn unexpected(command: BiasCommand, reply: BiasReply) -> BiasError {
    log::warn!("Bias {} got unexpected reply {:?}", command.name(), reply);
    BiasError::DeviceFault {
        operation: command.name(),
        code: CODE_BAD_REPLY,
    }
}

fn reap<L>(worker: JoinHandle<Option<L>>) -> IoState<L> {
    match worker.join() {
        Ok(Some(link)) => IoState::Parked(link),
        Ok(None) => IoState::Lost,
        Err(_) => {
            log::error!("Bias I/O worker panicked");
            IoState::Lost
        }
    }
}

fn run_worker<L: BiasLink>(
    handoff: &Receiver<L>,
    requests: &Receiver<Request>,
    opened: &Sender<Result<(), ResultCode>>,
) -> Option<L> {
    let mut link = handoff.recv().ok()?;
    let span = tracing::debug_span!("bias_io");
    let _entered = span.enter();

    if let Err(code) = link.open() {
        let _ = opened.send(Err(code));
        return Some(link);
    }
    let _ = opened.send(Ok(()));

    // Ends once every request sender is gone.
    for request in requests.iter() {
        let now = Instant::now();
        let result = if now < request.deadline {
            link.transact(&request.command, request.deadline - now)
        } else {
            log::debug!("Dropping expired bias {}", request.command.name());
            Err(CODE_TIMEOUT)
        };
        // The caller may have stopped waiting.
        let _ = request.reply.send(result);
    }

    link.close();
    Some(link)
}
