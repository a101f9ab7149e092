//! The one-message readiness handshake and the once-only result cell the
//! launcher settles with it.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::LaunchError;

/// The child's single message to its parent. On the wire it is the bound port
/// as a decimal string, one line, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    Port(u16),
}

impl HandshakeMessage {
    pub fn parse(payload: &str) -> Result<Self, LaunchError> {
        let trimmed = payload.trim();
        match trimmed.parse::<i64>() {
            Ok(port) if port > 0 => u16::try_from(port)
                .map(Self::Port)
                .map_err(|_| LaunchError::InvalidPort { payload: trimmed.to_string() }),
            _ => Err(LaunchError::InvalidPort { payload: trimmed.to_string() }),
        }
    }

    pub fn port(self) -> u16 {
        match self {
            Self::Port(port) => port,
        }
    }
}

impl fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => write!(f, "{}", port),
        }
    }
}

/// Single-assignment result cell. The first `settle` delivers its value; every
/// later call is a no-op that returns `false`.
#[derive(Debug)]
pub struct Settlement<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Settlement<T> {
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Mutex::new(Some(tx)) }, rx)
    }

    pub fn settle(&self, value: T) -> bool {
        let taken = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match taken {
            Some(tx) => {
                // A dropped receiver still counts as settled.
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}
