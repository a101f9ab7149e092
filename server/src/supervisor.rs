//! Parent side of the engine process: spawn, handshake, and ownership of the
//! child's kill responsibility.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ServerEnvironment, ServerLaunchArgs};
use crate::error::{ConfigError, LaunchError};
use crate::handshake::{HandshakeMessage, Settlement};
use crate::lifecycle::{attach_lifecycle_cleanup, default_terminator, fire_once, CleanupGuard, ProcessState, TerminationCause, Terminator};

/// Something observed on a spawned engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    /// A line received on the IPC channel.
    Message(String),
    /// The IPC channel closed.
    Disconnect,
    Exit(Option<i32>),
    /// The process has exited and its channel is closed.
    Close(Option<i32>),
    Error(String),
}

/// The launch outcome an event stands for, if it ends the race.
pub fn launch_outcome(event: &ChildEvent) -> Result<u16, LaunchError> {
    match event {
        ChildEvent::Message(payload) => HandshakeMessage::parse(payload).map(HandshakeMessage::port),
        ChildEvent::Disconnect => Err(LaunchError::ProcessDisconnected),
        ChildEvent::Exit(code) => Err(LaunchError::ProcessExited { code: *code }),
        ChildEvent::Close(code) => Err(LaunchError::ProcessClosed { code: *code }),
        ChildEvent::Error(detail) => Err(LaunchError::ProcessSpawnError { detail: detail.clone() }),
    }
}

struct ProcessInner {
    pid: u32,
    state: watch::Receiver<ProcessState>,
    terminator: Terminator,
    fired: Arc<AtomicBool>,
    cleanup: Mutex<Option<CleanupGuard>>,
}

/// Shared handle to a spawned engine process. The launcher that spawned it is
/// its only owner; when the last clone goes away the process is terminated.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<ProcessInner>,
}

impl ProcessHandle {
    pub fn new(pid: u32, state: watch::Receiver<ProcessState>, terminator: Terminator) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                pid,
                state,
                terminator,
                fired: Arc::new(AtomicBool::new(false)),
                cleanup: Mutex::new(None),
            }),
        }
    }

    pub fn pid(&self) -> u32 { self.inner.pid }

    pub fn state(&self) -> ProcessState { self.inner.state.borrow().clone() }

    pub fn has_exited(&self) -> bool { self.state().is_exited() }

    /// Resolves once the process is known to have exited, or once nothing
    /// reports on it any more.
    pub async fn wait_for_exit(&self) -> ProcessState {
        let mut state = self.inner.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            if current.is_exited() {
                return current;
            }
            if state.changed().await.is_err() {
                return state.borrow().clone();
            }
        }
    }

    /// Kill the process now. Idempotent: a process that is already gone, or
    /// was already terminated through this handle, is not an error. A process
    /// seen to exit is never signalled.
    pub fn terminate(&self) -> io::Result<()> {
        fire_once(self.inner.pid, &self.inner.state, &self.inner.terminator, &self.inner.fired, TerminationCause::Requested)
    }

    /// Install lifecycle cleanup for this process, replacing any earlier one.
    pub fn install_cleanup(&self, on_terminate: Terminator) {
        let guard = attach_lifecycle_cleanup(self.inner.pid, self.inner.state.clone(), on_terminate, self.inner.fired.clone());
        let previous = self.inner.cleanup.lock().unwrap_or_else(|e| e.into_inner()).replace(guard);
        if let Some(previous) = previous {
            previous.disarm();
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .field("terminated", &self.inner.fired.load(Ordering::SeqCst))
            .finish()
    }
}

/// A successful handshake.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub port: u16,
    pub process: ProcessHandle,
}

/// Launch attempt in flight. Resolves exactly once.
#[derive(Debug)]
pub struct PendingLaunch {
    rx: oneshot::Receiver<Result<HandshakeResult, LaunchError>>,
}

impl PendingLaunch {
    fn settled(outcome: Result<HandshakeResult, LaunchError>) -> Self {
        let (settlement, rx) = Settlement::channel();
        settlement.settle(outcome);
        Self { rx }
    }
}

impl Future for PendingLaunch {
    type Output = Result<HandshakeResult, LaunchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(LaunchError::ProcessDisconnected)))
    }
}

/// Spawn an engine process and race its handshake against its failure modes.
///
/// Configuration problems are returned before anything is spawned. Everything
/// after that, including a spawn failure, settles the returned future. Cleanup
/// is wired before the handshake runs, whatever its outcome.
pub fn launch(args: &ServerLaunchArgs) -> Result<PendingLaunch, ConfigError> {
    let env = ServerEnvironment::from_args(args)?;
    let mut command = Command::new(&args.script_path);
    command
        .args(&args.args)
        .envs(env.vars().iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(script = %args.script_path.display(), error = %e, "failed to spawn engine process");
            let detail = format!("{}: {}", args.script_path.display(), e);
            return Ok(PendingLaunch::settled(Err(LaunchError::ProcessSpawnError { detail })));
        }
    };
    let Some(pid) = child.id() else {
        let detail = "engine process exited before its pid was known".to_string();
        return Ok(PendingLaunch::settled(Err(LaunchError::ProcessSpawnError { detail })));
    };
    info!(pid, script = %args.script_path.display(), "spawned engine process");

    let (state_tx, state_rx) = watch::channel(ProcessState::Running);
    let process = ProcessHandle::new(pid, state_rx, default_terminator());
    process.install_cleanup(default_terminator());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump_child_events(child, events_tx));
    Ok(drive_launch(events_rx, state_tx, process))
}

/// Settle a launch from a stream of child events. The first event that ends
/// the race wins; every event keeps updating the process state so cleanup sees
/// exits that happen long after the handshake.
pub fn drive_launch(
    mut events: mpsc::UnboundedReceiver<ChildEvent>,
    state: watch::Sender<ProcessState>,
    process: ProcessHandle,
) -> PendingLaunch {
    let (settlement, rx) = Settlement::channel();
    tokio::spawn(async move {
        let pid = process.pid();
        let mut process = Some(process);
        while let Some(event) = events.recv().await {
            debug!(pid, ?event, "engine process event");
            record_state(&state, &event);
            let Some(process) = process.take() else { continue };
            match launch_outcome(&event) {
                Ok(port) => {
                    info!(pid, port, "engine process ready");
                    settlement.settle(Ok(HandshakeResult { port, process }));
                }
                Err(err) => fail_launch(&settlement, process, err),
            }
        }
        if let Some(process) = process.take() {
            fail_launch(&settlement, process, LaunchError::ProcessDisconnected);
        }
    });
    PendingLaunch { rx }
}

fn fail_launch(settlement: &Settlement<Result<HandshakeResult, LaunchError>>, process: ProcessHandle, err: LaunchError) {
    warn!(pid = process.pid(), error = %err, "engine launch failed");
    if let Err(e) = process.terminate() {
        error!(pid = process.pid(), error = %e, "failed to terminate engine process");
    }
    settlement.settle(Err(err));
}

fn record_state(state: &watch::Sender<ProcessState>, event: &ChildEvent) {
    state.send_if_modified(|current| match event {
        ChildEvent::Exit(code) | ChildEvent::Close(code) if !current.is_exited() => {
            *current = ProcessState::Exited(*code);
            true
        }
        ChildEvent::Error(detail) if *current == ProcessState::Running => {
            *current = ProcessState::Faulted(detail.clone());
            true
        }
        _ => false,
    });
}

/// Turn a tokio child into the event stream the launcher races on: stdout
/// lines are channel messages, stdout EOF is a disconnect, reaping is an exit,
/// and both together are a close.
async fn pump_child_events(mut child: Child, events: mpsc::UnboundedSender<ChildEvent>) {
    // Held until the child is gone; EOF on its stdin tells it the launcher died.
    let _stdin = child.stdin.take();
    let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());
    let mut channel_open = lines.is_some();
    if !channel_open {
        let _ = events.send(ChildEvent::Disconnect);
    }
    let mut exit: Option<Option<i32>> = None;
    loop {
        tokio::select! {
            line = next_line(&mut lines), if channel_open => match line {
                Ok(Some(line)) => { let _ = events.send(ChildEvent::Message(line)); }
                Ok(None) => {
                    channel_open = false;
                    let _ = events.send(ChildEvent::Disconnect);
                }
                Err(e) => {
                    channel_open = false;
                    let _ = events.send(ChildEvent::Error(e.to_string()));
                }
            },
            status = child.wait(), if exit.is_none() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        let _ = events.send(ChildEvent::Error(e.to_string()));
                        None
                    }
                };
                exit = Some(code);
                let _ = events.send(ChildEvent::Exit(code));
            }
        }
        if let (false, Some(code)) = (channel_open, exit) {
            let _ = events.send(ChildEvent::Close(code));
            break;
        }
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}
