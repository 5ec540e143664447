//! The seam to the native media engine
//!
//! Capture devices, codecs, transport and signaling all live behind
//! [`MediaEngine`]. Commands issued through it only report whether the engine
//! accepted them; their effect arrives later as a [`SessionEvent`] on the
//! channel handed over at connect time.

pub mod loopback;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ConnectOptions;
use crate::event::SessionEvent;
use crate::sink::SinkId;
use crate::types::{TrackKind, TrackPriority, TrackSid};

/// Channel end the engine pushes session events into
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Engine-side handle of one connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// How the engine finds a track: local tracks by name, remote tracks by sid
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackRef {
    Local(String),
    Remote(TrackSid),
}

impl fmt::Display for TrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(name) => write!(f, "local:{name}"),
            Self::Remote(sid) => write!(f, "remote:{sid}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine rejected {command}: {reason}")]
    Rejected { command: &'static str, reason: String },

    #[error("unknown session {0}")]
    UnknownSession(SessionHandle),

    #[error("unknown track {0}")]
    UnknownTrack(String),
}

/// Imperative surface of the native media engine
pub trait MediaEngine: Send + Sync + 'static {
    /// Start connecting; events for the session flow into `events`
    fn connect(&self, options: &ConnectOptions, events: EventSender) -> Result<SessionHandle, EngineError>;

    /// Tear the native session down
    fn disconnect(&self, session: SessionHandle);

    /// Drop the event listener registered by `connect`
    fn remove_listener(&self, session: SessionHandle);

    fn create_local_track(&self, name: &str, kind: TrackKind, enabled: bool) -> Result<(), EngineError>;

    fn release_local_track(&self, name: &str);

    fn publish_track(
        &self,
        session: SessionHandle,
        name: &str,
        kind: TrackKind,
        priority: TrackPriority,
    ) -> Result<(), EngineError>;

    fn unpublish_track(&self, session: SessionHandle, name: &str) -> Result<(), EngineError>;

    /// Enable or disable local capture. For a published track the engine
    /// also reports the change as a track enabled/disabled event on the
    /// publishing session.
    fn set_track_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError>;

    fn set_playback_enabled(&self, track_sid: &TrackSid, enabled: bool) -> Result<(), EngineError>;

    fn add_sink(&self, track: &TrackRef, sink: SinkId);

    fn remove_sink(&self, track: &TrackRef, sink: SinkId);
}

/// Scoped ownership of the listener registered by [`MediaEngine::connect`].
///
/// Released exactly once, either explicitly or on drop.
pub struct ListenerRegistration {
    engine: Arc<dyn MediaEngine>,
    session: SessionHandle,
    released: AtomicBool,
}

impl ListenerRegistration {
    pub(crate) fn new(engine: Arc<dyn MediaEngine>, session: SessionHandle) -> Self {
        Self {
            engine,
            session,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn session(&self) -> SessionHandle {
        self.session
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns true if this call performed the release
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.engine.remove_listener(self.session);
        debug!(session = %self.session, "Released session listener");
        true
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.release();
    }
}
