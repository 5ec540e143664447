//! In-process engine that records commands and lets the caller script events
//!
//! Used by the tests and by the replay binary in place of a real media engine.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{EngineError, EventSender, MediaEngine, SessionHandle, TrackRef};
use crate::config::ConnectOptions;
use crate::event::{ParticipantEvent, PublicationInfo, SessionEvent};
use crate::sink::SinkId;
use crate::types::{ParticipantSid, TrackKind, TrackPriority, TrackSid};

/// A command the loopback engine received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Connect { session: SessionHandle, room_name: Option<String> },
    Disconnect(SessionHandle),
    RemoveListener(SessionHandle),
    CreateLocalTrack { name: String, kind: TrackKind },
    ReleaseLocalTrack { name: String },
    Publish { session: SessionHandle, name: String, kind: TrackKind, priority: TrackPriority },
    Unpublish { session: SessionHandle, name: String },
    SetTrackEnabled { name: String, enabled: bool },
    SetPlaybackEnabled { track_sid: TrackSid, enabled: bool },
    AddSink { track: TrackRef, sink: SinkId },
    RemoveSink { track: TrackRef, sink: SinkId },
}

#[derive(Default)]
struct LoopbackState {
    listeners: IndexMap<SessionHandle, EventSender>,
    commands: Vec<EngineCommand>,
    local_tracks: HashMap<String, bool>,
    sinks: HashMap<TrackRef, Vec<SinkId>>,
    rejections: HashMap<&'static str, String>,
    local_participants: HashMap<SessionHandle, ParticipantSid>,
    published: HashMap<(SessionHandle, String), TrackSid>,
    next_track: u64,
}

impl LoopbackState {
    fn take_rejection(&mut self, command: &'static str) -> Result<(), EngineError> {
        match self.rejections.remove(command) {
            Some(reason) => Err(EngineError::Rejected { command, reason }),
            None => Ok(()),
        }
    }

    fn send(&mut self, session: SessionHandle, event: SessionEvent) -> bool {
        if let SessionEvent::RoomConnected { local_participant, .. } = &event {
            self.local_participants
                .insert(session, local_participant.sid.clone());
        }
        let Some(listener) = self.listeners.get(&session) else {
            return false;
        };
        trace!(session = %session, event_type = event.event_type(), "Loopback emit");
        if listener.send(event).is_err() {
            self.listeners.shift_remove(&session);
            return false;
        }
        true
    }
}

/// Scriptable stand-in for the native media engine
pub struct LoopbackEngine {
    state: Mutex<LoopbackState>,
    next_session: AtomicU64,
    auto_confirm: bool,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopbackState::default()),
            next_session: AtomicU64::new(1),
            auto_confirm: false,
        })
    }

    /// Engine that answers publish/unpublish commands with confirmation
    /// events once the session has reported its local participant
    #[must_use]
    pub fn with_auto_confirm() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopbackState::default()),
            next_session: AtomicU64::new(1),
            auto_confirm: true,
        })
    }

    /// Deliver an event to the most recently connected session
    pub fn emit(&self, event: SessionEvent) -> bool {
        let mut state = self.state.lock();
        let Some(session) = state.listeners.keys().last().copied() else {
            debug!(event_type = event.event_type(), "No listener for loopback event");
            return false;
        };
        state.send(session, event)
    }

    pub fn emit_to(&self, session: SessionHandle, event: SessionEvent) -> bool {
        self.state.lock().send(session, event)
    }

    /// Make the next call of `command` fail with `reason`
    pub fn reject(&self, command: &'static str, reason: impl Into<String>) {
        self.state.lock().rejections.insert(command, reason.into());
    }

    #[must_use]
    pub fn latest_session(&self) -> Option<SessionHandle> {
        self.state.lock().listeners.keys().last().copied()
    }

    #[must_use]
    pub fn commands(&self) -> Vec<EngineCommand> {
        self.state.lock().commands.clone()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Sinks currently attached to a track
    #[must_use]
    pub fn sinks(&self, track: &TrackRef) -> Vec<SinkId> {
        self.state
            .lock()
            .sinks
            .get(track)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn local_track_enabled(&self, name: &str) -> Option<bool> {
        self.state.lock().local_tracks.get(name).copied()
    }
}

impl MediaEngine for LoopbackEngine {
    fn connect(&self, options: &ConnectOptions, events: EventSender) -> Result<SessionHandle, EngineError> {
        let mut state = self.state.lock();
        state.take_rejection("connect")?;
        let session = SessionHandle(self.next_session.fetch_add(1, Ordering::Relaxed));
        state.listeners.insert(session, events);
        state.commands.push(EngineCommand::Connect {
            session,
            room_name: options.room_name.clone(),
        });
        Ok(session)
    }

    fn disconnect(&self, session: SessionHandle) {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::Disconnect(session));
        state.local_participants.remove(&session);
        state.published.retain(|(s, _), _| *s != session);
    }

    fn remove_listener(&self, session: SessionHandle) {
        let mut state = self.state.lock();
        state.commands.push(EngineCommand::RemoveListener(session));
        state.listeners.shift_remove(&session);
    }

    fn create_local_track(&self, name: &str, kind: TrackKind, enabled: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.take_rejection("create_local_track")?;
        if state.local_tracks.contains_key(name) {
            return Err(EngineError::Rejected {
                command: "create_local_track",
                reason: format!("a local track named {name} already exists"),
            });
        }
        state.local_tracks.insert(name.to_string(), enabled);
        state.commands.push(EngineCommand::CreateLocalTrack {
            name: name.to_string(),
            kind,
        });
        Ok(())
    }

    fn release_local_track(&self, name: &str) {
        let mut state = self.state.lock();
        state.local_tracks.remove(name);
        state.commands.push(EngineCommand::ReleaseLocalTrack {
            name: name.to_string(),
        });
    }

    fn publish_track(
        &self,
        session: SessionHandle,
        name: &str,
        kind: TrackKind,
        priority: TrackPriority,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.take_rejection("publish_track")?;
        if !state.listeners.contains_key(&session) {
            return Err(EngineError::UnknownSession(session));
        }
        if !state.local_tracks.contains_key(name) {
            return Err(EngineError::UnknownTrack(name.to_string()));
        }
        state.commands.push(EngineCommand::Publish {
            session,
            name: name.to_string(),
            kind,
            priority,
        });

        if self.auto_confirm {
            if let Some(local) = state.local_participants.get(&session).cloned() {
                state.next_track += 1;
                let track_sid = TrackSid::new(format!("MT{:04}", state.next_track));
                state
                    .published
                    .insert((session, name.to_string()), track_sid.clone());
                let enabled = state.local_tracks.get(name).copied().unwrap_or(true);
                state.send(
                    session,
                    SessionEvent::participant(
                        local,
                        ParticipantEvent::TrackPublished {
                            publication: PublicationInfo {
                                track_sid,
                                track_name: name.to_string(),
                                kind,
                                priority,
                                is_track_enabled: enabled,
                            },
                        },
                    ),
                );
            }
        }
        Ok(())
    }

    fn unpublish_track(&self, session: SessionHandle, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.take_rejection("unpublish_track")?;
        state.commands.push(EngineCommand::Unpublish {
            session,
            name: name.to_string(),
        });

        if self.auto_confirm {
            let local = state.local_participants.get(&session).cloned();
            let track_sid = state.published.remove(&(session, name.to_string()));
            if let (Some(local), Some(track_sid)) = (local, track_sid) {
                state.send(
                    session,
                    SessionEvent::participant(local, ParticipantEvent::TrackUnpublished { track_sid }),
                );
            }
        }
        Ok(())
    }

    fn set_track_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.take_rejection("set_track_enabled")?;
        let Some(current) = state.local_tracks.get_mut(name) else {
            return Err(EngineError::UnknownTrack(name.to_string()));
        };
        *current = enabled;
        state.commands.push(EngineCommand::SetTrackEnabled {
            name: name.to_string(),
            enabled,
        });

        if self.auto_confirm {
            let targets: Vec<_> = state
                .published
                .iter()
                .filter(|((_, published), _)| published == name)
                .filter_map(|((session, _), track_sid)| {
                    let local = state.local_participants.get(session)?;
                    Some((*session, local.clone(), track_sid.clone()))
                })
                .collect();
            for (session, local, track_sid) in targets {
                let event = if enabled {
                    ParticipantEvent::TrackEnabled { track_sid }
                } else {
                    ParticipantEvent::TrackDisabled { track_sid }
                };
                state.send(session, SessionEvent::participant(local, event));
            }
        }
        Ok(())
    }

    fn set_playback_enabled(&self, track_sid: &TrackSid, enabled: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.take_rejection("set_playback_enabled")?;
        state.commands.push(EngineCommand::SetPlaybackEnabled {
            track_sid: track_sid.clone(),
            enabled,
        });
        Ok(())
    }

    fn add_sink(&self, track: &TrackRef, sink: SinkId) {
        let mut state = self.state.lock();
        let sinks = state.sinks.entry(track.clone()).or_default();
        if !sinks.contains(&sink) {
            sinks.push(sink);
        }
        state.commands.push(EngineCommand::AddSink {
            track: track.clone(),
            sink,
        });
    }

    fn remove_sink(&self, track: &TrackRef, sink: SinkId) {
        let mut state = self.state.lock();
        let drained = state.sinks.get_mut(track).is_some_and(|sinks| {
            sinks.retain(|s| *s != sink);
            sinks.is_empty()
        });
        if drained {
            state.sinks.remove(track);
        }
        state.commands.push(EngineCommand::RemoveSink {
            track: track.clone(),
            sink,
        });
    }
}
