//! Cross-thread session signals.
//!
//! Worker threads never return errors to the coordinator. They record a `Fault`
//! here and raise the cancel flag; the coordinator polls. The first fault of a
//! session wins and stays set until `clear` runs during stop.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRole {
    Encode,
    Preview,
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueRole::Encode => f.write_str("encode"),
            QueueRole::Preview => f.write_str("preview"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    GrabTimeout,
    DeviceError,
    QueueOverflow { role: QueueRole },
    EncoderFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Fault {
    #[serde(flatten)]
    pub kind: FaultKind,
    /// Slot of the camera the fault belongs to, if any.
    pub camera: Option<usize>,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, camera: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            kind,
            camera,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FaultKind::GrabTimeout => "grab timeout".to_string(),
            FaultKind::DeviceError => "device error".to_string(),
            FaultKind::QueueOverflow { role } => format!("{role} queue overflow"),
            FaultKind::EncoderFailure => "encoder failure".to_string(),
        };
        match self.camera {
            Some(slot) => write!(f, "{kind} on camera {slot}: {}", self.message),
            None => write!(f, "{kind}: {}", self.message),
        }
    }
}

/// Cancellation plus sticky fault, shared by every thread of a session.
#[derive(Debug, Default)]
pub struct SessionSignals {
    cancel: AtomicBool,
    faulted: AtomicBool,
    fault: Mutex<Option<Fault>>,
}

impl SessionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Record `fault` unless one is already set, then cancel. Returns whether it was recorded.
    pub fn raise(&self, fault: Fault) -> bool {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        let first = slot.is_none();
        if first {
            log::error!("Session: {}", fault);
            *slot = Some(fault);
            self.faulted.store(true, Ordering::SeqCst);
        } else {
            log::debug!("Session: suppressed follow-up fault: {}", fault);
        }
        drop(slot);
        self.cancel();
        first
    }

    pub fn has_fault(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reset the cancel flag for the next run. The fault stays.
    pub fn rearm(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Clear both the fault and the cancel flag.
    pub fn clear(&self) -> Option<Fault> {
        let taken = self
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.faulted.store(false, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);
        taken
    }
}
