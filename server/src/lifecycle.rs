//! Keeps an engine process in lockstep with its launcher: whatever ends the
//! child's usefulness (its own exit, a channel fault, a signal to the launcher,
//! or the launcher dropping its last handle) runs the terminator exactly once.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Kills a process by id.
pub type Terminator = Arc<dyn Fn(u32) -> io::Result<()> + Send + Sync>;

pub fn default_terminator() -> Terminator { Arc::new(kill_process) }

/// Liveness of a spawned process as seen by its launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(Option<i32>),
    /// The channel reported a failure; the process may still be alive.
    Faulted(String),
}

impl ProcessState {
    pub fn is_exited(&self) -> bool { matches!(self, Self::Exited(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    ChildExited(Option<i32>),
    ChannelFault(String),
    Signal(&'static str),
    Requested,
    HandleDropped,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChildExited(code) => write!(f, "child exited (code: {:?})", code),
            Self::ChannelFault(detail) => write!(f, "channel fault: {}", detail),
            Self::Signal(name) => write!(f, "launcher received {}", name),
            Self::Requested => f.write_str("termination requested"),
            Self::HandleDropped => f.write_str("last process handle dropped"),
        }
    }
}

/// Sends SIGTERM to `pid`. A process that no longer exists counts as killed.
#[cfg(unix)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    let pid = match i32::try_from(pid) {
        Ok(p) if p > 0 => p,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("refusing to signal pid {}", pid))),
    };
    // SAFETY: kill(2) has no memory-safety preconditions; pid is a positive id.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) { Ok(()) } else { Err(err) }
}

#[cfg(windows)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    use windows_sys::Win32::Foundation::{CloseHandle, ERROR_INVALID_PARAMETER};
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    if pid == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to terminate pid 0"));
    }
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            let err = io::Error::last_os_error();
            // OpenProcess reports an unknown pid as an invalid parameter.
            return if err.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32) { Ok(()) } else { Err(err) };
        }
        let ok = TerminateProcess(handle, 1);
        let err = io::Error::last_os_error();
        CloseHandle(handle);
        if ok != 0 { Ok(()) } else { Err(err) }
    }
}

/// Running cleanup registration. Dropping it runs the terminator unless some
/// trigger already did.
pub struct CleanupGuard {
    pid: u32,
    state: watch::Receiver<ProcessState>,
    on_terminate: Terminator,
    fired: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl CleanupGuard {
    pub fn has_fired(&self) -> bool { self.fired.load(Ordering::SeqCst) }

    /// Stop listening without terminating.
    pub fn disarm(mut self) {
        if let Some(task) = self.task.take() { task.abort(); }
        self.fired = Arc::new(AtomicBool::new(true));
    }
}

impl fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupGuard").field("pid", &self.pid).field("fired", &self.has_fired()).finish()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() { task.abort(); }
        if let Err(e) = fire_once(self.pid, &self.state, &self.on_terminate, &self.fired, TerminationCause::HandleDropped) {
            error!(pid = self.pid, error = %e, "failed to terminate engine process");
        }
    }
}

/// Runs `on_terminate` once. Returns the terminator's error and re-arms on
/// failure so a later trigger can try again.
///
/// A process already seen to exit has been reaped and its pid may belong to
/// someone else by now, so it is never signalled.
pub(crate) fn fire_once(
    pid: u32,
    state: &watch::Receiver<ProcessState>,
    on_terminate: &Terminator,
    fired: &AtomicBool,
    cause: TerminationCause,
) -> io::Result<()> {
    if fired.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    if let ProcessState::Exited(code) = &*state.borrow() {
        debug!(pid, ?code, %cause, "engine process already exited");
        return Ok(());
    }
    info!(pid, %cause, "terminating engine process");
    let result = on_terminate(pid);
    if result.is_err() {
        fired.store(false, Ordering::SeqCst);
    }
    result
}

/// Registers `on_terminate` against child exit, channel faults, SIGINT,
/// SIGUSR1 and SIGUSR2, and against the returned guard being dropped.
/// `fired` is shared with anything else that may terminate the same process.
pub fn attach_lifecycle_cleanup(
    pid: u32,
    state: watch::Receiver<ProcessState>,
    on_terminate: Terminator,
    fired: Arc<AtomicBool>,
) -> CleanupGuard {
    let task = {
        let on_terminate = on_terminate.clone();
        let fired = fired.clone();
        let mut state = state.clone();
        tokio::spawn(async move {
            let cause = wait_for_termination(&mut state).await;
            if let Err(e) = fire_once(pid, &state, &on_terminate, &fired, cause) {
                error!(pid, error = %e, "failed to terminate engine process");
            }
        })
    };
    CleanupGuard { pid, state, on_terminate, fired, task: Some(task) }
}

async fn wait_for_termination(state: &mut watch::Receiver<ProcessState>) -> TerminationCause {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        tokio::select! {
            cause = child_terminated(state) => cause,
            _ = recv_signal(SignalKind::interrupt(), "SIGINT") => TerminationCause::Signal("SIGINT"),
            _ = recv_signal(SignalKind::user_defined1(), "SIGUSR1") => TerminationCause::Signal("SIGUSR1"),
            _ = recv_signal(SignalKind::user_defined2(), "SIGUSR2") => TerminationCause::Signal("SIGUSR2"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            cause = child_terminated(state) => cause,
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => TerminationCause::Signal("ctrl-c"),
                Err(_) => std::future::pending().await,
            },
        }
    }
}

async fn child_terminated(state: &mut watch::Receiver<ProcessState>) -> TerminationCause {
    loop {
        let cause = match &*state.borrow_and_update() {
            ProcessState::Exited(code) => Some(TerminationCause::ChildExited(*code)),
            ProcessState::Faulted(detail) => Some(TerminationCause::ChannelFault(detail.clone())),
            ProcessState::Running => None,
        };
        if let Some(cause) = cause {
            return cause;
        }
        if state.changed().await.is_err() {
            // Nobody reports on this process any more; only signals or drop remain.
            return std::future::pending().await;
        }
    }
}

#[cfg(unix)]
async fn recv_signal(kind: tokio::signal::unix::SignalKind, name: &'static str) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut signal) => {
            if signal.recv().await.is_some() {
                return;
            }
        }
        Err(e) => warn!(signal = name, error = %e, "cannot listen for signal"),
    }
    std::future::pending::<()>().await
}
