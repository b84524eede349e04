//! Termination trigger
//!
//! Routes the process interrupt (Ctrl+C / SIGINT) into the cancellation of the
//! registered session. The OS handler is installed once per process; sessions
//! come and go through [`TerminationTrigger::register`].

use super::session::SessionHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Trigger errors
#[derive(Error, Debug)]
pub enum SignalError {
    /// The interrupt handler could not be installed
    #[error("cannot install interrupt handler: {0}")]
    Install(#[from] ctrlc::Error),
}

type Slot = Arc<Mutex<Option<SessionHandle>>>;

static INSTALLED: Mutex<Option<TerminationTrigger>> = Mutex::new(None);

/// Fires at most once and cancels the registered session
#[derive(Clone, Debug)]
pub struct TerminationTrigger {
    slot: Slot,
    fired: Arc<AtomicBool>,
}

impl TerminationTrigger {
    /// Trigger bound to the process interrupt
    pub fn install() -> Result<Self, SignalError> {
        let mut installed = INSTALLED.lock();
        if let Some(trigger) = installed.as_ref() {
            return Ok(trigger.clone());
        }

        let trigger = Self::manual();
        let handler = trigger.clone();
        ctrlc::set_handler(move || handler.fire())?;
        tracing::debug!("interrupt handler installed");
        *installed = Some(trigger.clone());
        Ok(trigger)
    }

    /// Trigger without an OS handler; fired through [`TerminationTrigger::fire`]
    pub fn manual() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the registered session. Later calls do nothing.
    ///
    /// Firing with no session registered cancels the next one on registration.
    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("interrupt received, stopping");
        let handle = self.slot.lock().clone();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Check if the trigger has fired
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Attach a session until the returned guard is dropped
    #[must_use = "the session is deregistered when the registration is dropped"]
    pub fn register(&self, handle: SessionHandle) -> Registration {
        *self.slot.lock() = Some(handle.clone());
        if self.fired() {
            handle.cancel();
        }
        Registration {
            slot: self.slot.clone(),
        }
    }
}

/// Registration of a session with a [`TerminationTrigger`]
#[derive(Debug)]
pub struct Registration {
    slot: Slot,
}

impl Registration {
    /// Detach the session
    pub fn deregister(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}
