//! Monitor session management
//!
//! A [`MonitorSession`] owns one monitoring link for its whole lifetime.
//! Closure reported by the link, an explicit quit and the termination trigger
//! all end in the same teardown, which runs at most once under the session
//! lock: close the link, record the outcome, wake every waiter.

use super::format::format_line;
use super::frame::MonitorFrameEvent;
use super::state_machine::{
    InvalidTransition, MonitorState, MonitorStateMachine, StateTransition,
};
use super::transport::{
    CloseEvent, CloseInitiator, DefaultLinkFactory, LinkError, LinkFactory, LinkListener,
    MonitorLink,
};
use crate::config::Configuration;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound of one wait in [`MonitorSession::run`] before link liveness is re-checked
pub const WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The link could not be constructed
    #[error("link construction failed: {0}")]
    Link(#[from] LinkError),

    /// Operation not allowed in the current state
    #[error(transparent)]
    State(#[from] InvalidTransition),

    /// `run` without a successful `start`
    #[error("session not started")]
    NotStarted,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The link was closed
    Closed {
        /// Who closed it
        initiator: CloseInitiator,
        /// Reason given
        reason: String,
    },
    /// Stopped by the termination trigger
    Cancelled,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { initiator, reason } => write!(f, "closed by {initiator} ({reason})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<&CloseEvent> for SessionOutcome {
    fn from(event: &CloseEvent) -> Self {
        Self::Closed {
            initiator: event.initiator,
            reason: event.reason.clone(),
        }
    }
}

/// Frame counters of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Frames written to the sink
    pub frames_formatted: u64,
    /// Frames dropped because they could not be formatted
    pub frames_dropped: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frame(s) shown, {} dropped",
            self.frames_formatted, self.frames_dropped
        )
    }
}

/// Destination of formatted frame lines
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink: Send + Sync {
    /// Write one line
    fn write_line(&self, line: &str);
}

/// Writes frame lines to stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl FrameSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }
}

struct Inner {
    machine: MonitorStateMachine,
    link: Option<Box<dyn MonitorLink>>,
    outcome: Option<SessionOutcome>,
    // Close requested before the link was open
    pending: Option<SessionOutcome>,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
    teardowns: AtomicUsize,
    formatted: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn close(&self, outcome: SessionOutcome) {
        let mut inner = self.inner.lock();
        self.teardown(&mut inner, outcome);
    }

    /// The only teardown path; the caller holds the session lock.
    fn teardown(&self, inner: &mut Inner, outcome: SessionOutcome) {
        match inner.machine.state() {
            MonitorState::Open => {}
            MonitorState::Idle | MonitorState::Starting => {
                inner.pending.get_or_insert(outcome);
                return;
            }
            MonitorState::Closing | MonitorState::Closed => return,
        }

        let reason = outcome.to_string();
        let open_for = inner.machine.time_in_state().unwrap_or_default();
        advance(inner, MonitorState::Closing, &reason);
        if let Some(mut link) = inner.link.take() {
            link.close();
        }
        inner.outcome = Some(outcome);
        advance(inner, MonitorState::Closed, &reason);
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_all();
        tracing::info!("session {reason} after {:.1}s", open_for.as_secs_f64());
        tracing::debug!("session states: {}", state_path(inner.machine.history()));
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            frames_formatted: self.formatted.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

fn state_path(history: &[StateTransition]) -> String {
    let mut path = history.first().map(|t| t.from.to_string()).unwrap_or_default();
    for transition in history {
        path.push_str(" -> ");
        path.push_str(&transition.to.to_string());
    }
    path
}

fn advance(inner: &mut Inner, state: MonitorState, reason: &str) {
    if let Err(e) = inner.machine.transition(state, Some(reason)) {
        tracing::warn!("{e}");
    }
}

/// Cloneable handle to a session's shared state.
///
/// Lets listeners and the termination trigger request teardown without
/// access to the link.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    machine: MonitorStateMachine::new(),
                    link: None,
                    outcome: None,
                    pending: None,
                }),
                changed: Condvar::new(),
                teardowns: AtomicUsize::new(0),
                formatted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Close the session on request of this side
    pub fn quit(&self) {
        self.shared.close(SessionOutcome::Closed {
            initiator: CloseInitiator::Client,
            reason: "user request".to_string(),
        });
    }

    /// Close the session as cancelled
    pub fn cancel(&self) {
        self.shared.close(SessionOutcome::Cancelled);
    }

    /// Current state
    pub fn state(&self) -> MonitorState {
        self.shared.inner.lock().machine.state()
    }

    /// Outcome, once closed
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.shared.inner.lock().outcome.clone()
    }

    /// Number of teardowns executed (0 or 1)
    pub fn teardown_count(&self) -> usize {
        self.shared.teardowns.load(Ordering::SeqCst)
    }

    /// Frame counters
    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("teardowns", &self.teardown_count())
            .finish()
    }
}

struct FrameListener {
    shared: Arc<Shared>,
    sink: Arc<dyn FrameSink>,
    compact: bool,
}

impl LinkListener for FrameListener {
    fn frame_received(&self, event: &MonitorFrameEvent) {
        match format_line(event, self.compact) {
            Ok(line) => {
                self.sink.write_line(&line);
                self.shared.formatted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("{}: dropping frame seq {}: {e}", event.source, event.frame.sequence);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn link_closed(&self, event: &CloseEvent) {
        tracing::debug!("link closed by {}: {}", event.initiator, event.reason);
        self.shared.close(SessionOutcome::from(event));
    }
}

/// One monitoring session
pub struct MonitorSession {
    config: Configuration,
    factory: Arc<dyn LinkFactory>,
    sink: Arc<dyn FrameSink>,
    handle: SessionHandle,
}

impl MonitorSession {
    /// Session writing to stdout over the link built from `config`
    pub fn new(config: Configuration) -> Self {
        Self::with_factory(config, Arc::new(DefaultLinkFactory), Arc::new(StdoutSink))
    }

    /// Session with a custom link factory and line sink
    pub fn with_factory(
        config: Configuration,
        factory: Arc<dyn LinkFactory>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            config,
            factory,
            sink,
            handle: SessionHandle::new(),
        }
    }

    /// Session configuration
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Handle for listeners and the termination trigger
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Current state
    pub fn state(&self) -> MonitorState {
        self.handle.state()
    }

    /// Construct the link and start receiving frames.
    ///
    /// Raw frame decoding is enabled and the frame listener registered before
    /// this returns. On failure the session is closed and the link error
    /// returned. A session closed before it was started never opens a link.
    pub fn start(&self) -> Result<(), SessionError> {
        let shared = &self.handle.shared;
        {
            let mut inner = shared.inner.lock();
            inner.machine.transition(MonitorState::Starting, Some("start"))?;
            if let Some(outcome) = inner.pending.take() {
                advance(&mut inner, MonitorState::Closed, &outcome.to_string());
                inner.outcome = Some(outcome);
                shared.changed.notify_all();
                return Ok(());
            }
        }
        tracing::debug!("starting session: {}", self.config);

        // The factory may block for the protocol timeout; the lock is not held
        let result = self.factory.open(&self.config);

        let mut inner = shared.inner.lock();
        match result {
            Err(e) => {
                tracing::error!("cannot open link to {}: {e}", self.config.target);
                let reason = e.to_string();
                advance(&mut inner, MonitorState::Closed, &reason);
                inner.outcome = Some(SessionOutcome::Closed {
                    initiator: CloseInitiator::Internal,
                    reason,
                });
                shared.changed.notify_all();
                Err(e.into())
            }
            Ok(mut link) => {
                link.set_decode_raw_frames(true);
                link.add_listener(Arc::new(FrameListener {
                    shared: shared.clone(),
                    sink: self.sink.clone(),
                    compact: self.config.compact,
                }));
                tracing::info!("monitoring {} on {}", link.name(), link.medium());
                inner.link = Some(link);
                advance(&mut inner, MonitorState::Open, "link open");

                if let Some(outcome) = inner.pending.take() {
                    shared.teardown(&mut inner, outcome);
                }
                Ok(())
            }
        }
    }

    /// Block until the session is closed and return how it ended.
    ///
    /// Wakes on every state change and at least every [`WAIT_INTERVAL`] to
    /// check that the link is still open; a link that died without notice is
    /// torn down here.
    pub fn run(&self) -> Result<SessionOutcome, SessionError> {
        let shared = &self.handle.shared;
        let mut inner = shared.inner.lock();
        loop {
            match inner.machine.state() {
                MonitorState::Idle | MonitorState::Starting => return Err(SessionError::NotStarted),
                MonitorState::Closed => break,
                MonitorState::Open | MonitorState::Closing => {}
            }

            shared.changed.wait_for(&mut inner, WAIT_INTERVAL);

            let dead = inner.machine.state().can_receive()
                && !inner.link.as_ref().is_some_and(|link| link.is_open());
            if dead {
                tracing::warn!("link closed without notification");
                shared.teardown(
                    &mut inner,
                    SessionOutcome::Closed {
                        initiator: CloseInitiator::Internal,
                        reason: "link no longer open".to_string(),
                    },
                );
            }
        }
        let outcome = inner.outcome.clone();
        drop(inner);

        self.quit();
        tracing::info!("{}", shared.stats());
        outcome.ok_or(SessionError::NotStarted)
    }

    /// Close the session; does nothing if already closed
    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Frame counters
    pub fn stats(&self) -> SessionStats {
        self.handle.stats()
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.quit();
    }
}
