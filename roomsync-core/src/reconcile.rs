//! Event reconciliation
//!
//! [`Reconciler::apply`] folds one native [`SessionEvent`] into a
//! [`SessionModel`]. It never blocks and never touches the engine: anything
//! that has to happen outside the model (ending tracks, resolving pending
//! commands, releasing the listener) is returned as an [`Effect`] for the
//! caller to run once the model lock is released.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::event::{ParticipantInfo, SessionEvent};
use crate::participant::{LocalParticipant, RemoteParticipant, TrackStore};
use crate::publication::LocalTrackPublication;
use crate::snapshot::RoomSnapshot;
use crate::track::Track;
use crate::types::{ParticipantSid, RoomSid, TrackSid};

const DISCONNECTED_WHILE_CONNECTING: &str = "disconnected before the room was connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl RoomState {
    /// Connected or temporarily reconnecting
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Work left over after a model mutation
#[derive(Debug)]
pub enum Effect {
    /// The track lost its owner and must end
    EndTrack(Track),
    /// A new remote track the room must hear about when it ends
    ObserveTrack(Track),
    ResolvePublish {
        name: String,
        result: Result<LocalTrackPublication>,
    },
    ResolveUnpublish {
        sid: TrackSid,
    },
    /// The engine reported the enabled state of a published local track
    ResolveEnabled {
        sid: TrackSid,
        enabled: bool,
    },
    /// A publish was confirmed for a local track that had already ended
    UnpublishTrack {
        name: String,
    },
    /// The session is over: drop the listener and fail what is still pending
    ReleaseSession,
}

/// The mirrored state of one room session
#[derive(Debug)]
pub struct SessionModel {
    pub(crate) version: u64,
    pub(crate) state: RoomState,
    pub(crate) sid: Option<RoomSid>,
    pub(crate) name: String,
    pub(crate) is_recording: bool,
    pub(crate) dominant_speaker: Option<ParticipantSid>,
    pub(crate) failure: Option<String>,
    pub(crate) local: Option<LocalParticipant>,
    pub(crate) remotes: IndexMap<ParticipantSid, RemoteParticipant>,
    /// Local tracks with a publish command awaiting confirmation, by name
    pub(crate) publishing: IndexMap<String, Track>,
    /// Owner of every subscribed remote track
    pub(crate) tracks: TrackStore,
}

impl SessionModel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: 0,
            state: RoomState::Connecting,
            sid: None,
            name: name.into(),
            is_recording: false,
            dominant_speaker: None,
            failure: None,
            local: None,
            remotes: IndexMap::new(),
            publishing: IndexMap::new(),
            tracks: TrackStore::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> RoomState {
        self.state
    }

    #[must_use]
    pub fn local_participant(&self) -> Option<&LocalParticipant> {
        self.local.as_ref()
    }

    #[must_use]
    pub fn remote_participants(&self) -> &IndexMap<ParticipantSid, RemoteParticipant> {
        &self.remotes
    }

    #[must_use]
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            version: self.version,
            sid: self.sid.clone(),
            name: self.name.clone(),
            state: self.state,
            is_recording: self.is_recording,
            dominant_speaker: self.dominant_speaker.clone(),
            failure: self.failure.clone(),
            local_participant: self.local.as_ref().map(LocalParticipant::snapshot),
            remote_participants: self.remotes.values().map(RemoteParticipant::snapshot).collect(),
        }
    }

    /// Whether `track` is part of the mirrored state
    #[must_use]
    pub(crate) fn mirrors(&self, track: &Track) -> bool {
        if track.is_local() {
            self.local
                .as_ref()
                .is_some_and(|local| local.publication_of(track).is_some())
        } else {
            self.tracks.values().any(|held| held.same_track(track))
        }
    }

    fn add_remote(&mut self, info: &ParticipantInfo) -> Result<()> {
        let is_local = self.local.as_ref().is_some_and(|local| local.sid() == &info.sid);
        if is_local || self.remotes.contains_key(&info.sid) {
            return Err(Error::StaleEvent(format!(
                "participant {} is already in the room",
                info.sid
            )));
        }
        self.remotes
            .insert(info.sid.clone(), RemoteParticipant::from_info(info));
        Ok(())
    }

    /// Enter `Disconnected`, release everything and report what to clean up
    fn teardown(&mut self, reason: Option<&str>, effects: &mut Vec<Effect>) {
        if self.state == RoomState::Connecting {
            self.failure = Some(reason.unwrap_or(DISCONNECTED_WHILE_CONNECTING).to_string());
        }
        self.state = RoomState::Disconnected;

        for (_, mut remote) in self.remotes.drain(..) {
            effects.extend(
                remote
                    .release_subscriptions(&mut self.tracks)
                    .into_iter()
                    .map(Effect::EndTrack),
            );
        }
        effects.extend(self.tracks.drain(..).map(|(_, track)| Effect::EndTrack(track)));
        if let Some(mut local) = self.local.take() {
            local.clear_publications();
        }
        self.publishing.clear();
        self.dominant_speaker = None;
        self.is_recording = false;
        effects.push(Effect::ReleaseSession);
    }
}

/// Applies native events to a [`SessionModel`]
pub struct Reconciler {
    engine: Arc<dyn MediaEngine>,
}

impl Reconciler {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self { engine }
    }

    /// Apply `event`. `Err(Error::StaleEvent)` means the event did not match
    /// the current state and the model is unchanged.
    pub fn apply(&self, model: &mut SessionModel, event: &SessionEvent) -> Result<Vec<Effect>> {
        let mut effects = Vec::new();

        match model.state {
            RoomState::Disconnected => {
                return Err(Error::StaleEvent(format!(
                    "{} after the room disconnected",
                    event.event_type()
                )));
            }
            RoomState::Connecting => self.apply_connecting(model, event, &mut effects)?,
            RoomState::Connected | RoomState::Reconnecting => self.apply_live(model, event, &mut effects)?,
        }

        model.version += 1;
        Ok(effects)
    }

    fn apply_connecting(&self, model: &mut SessionModel, event: &SessionEvent, effects: &mut Vec<Effect>) -> Result<()> {
        match event {
            SessionEvent::RoomConnected {
                room_sid,
                room_name,
                local_participant,
                remote_participants,
                is_recording,
            } => {
                model.sid = Some(room_sid.clone());
                model.name.clone_from(room_name);
                model.is_recording = *is_recording;
                model.local = Some(LocalParticipant::from_info(local_participant));
                for remote in remote_participants {
                    if let Err(err) = model.add_remote(remote) {
                        warn!(participant_sid = %remote.sid, error = %err, "Skipping duplicate participant");
                    }
                }
                model.state = RoomState::Connected;
                info!(
                    room_sid = %room_sid,
                    room_name = %room_name,
                    local_participant = %local_participant.sid,
                    remote_participants = model.remotes.len(),
                    "Room connected"
                );
            }
            SessionEvent::ConnectFailed { reason } => {
                warn!(room_name = %model.name, reason = %reason, "Room connect failed");
                model.teardown(Some(reason), effects);
            }
            SessionEvent::Disconnected { reason } => {
                model.teardown(reason.as_deref(), effects);
                info!(room_name = %model.name, "Room disconnected while connecting");
            }
            _ => {
                return Err(Error::StaleEvent(format!(
                    "{} before the room connected",
                    event.event_type()
                )));
            }
        }
        Ok(())
    }

    fn apply_live(&self, model: &mut SessionModel, event: &SessionEvent, effects: &mut Vec<Effect>) -> Result<()> {
        match event {
            SessionEvent::RoomConnected { .. } | SessionEvent::ConnectFailed { .. } => {
                return Err(Error::StaleEvent(format!(
                    "{} while the room is {}",
                    event.event_type(),
                    model.state
                )));
            }
            SessionEvent::Reconnecting { reason } => {
                model.state = RoomState::Reconnecting;
                warn!(room_name = %model.name, reason = reason.as_deref().unwrap_or(""), "Room reconnecting");
            }
            SessionEvent::Reconnected => {
                model.state = RoomState::Connected;
                info!(room_name = %model.name, "Room reconnected");
            }
            SessionEvent::Disconnected { reason } => {
                model.teardown(reason.as_deref(), effects);
                info!(room_name = %model.name, reason = reason.as_deref().unwrap_or(""), "Room disconnected");
            }
            SessionEvent::RecordingStarted => model.is_recording = true,
            SessionEvent::RecordingStopped => model.is_recording = false,
            SessionEvent::DominantSpeakerChanged { participant_sid } => {
                if let Some(sid) = participant_sid {
                    if !model.remotes.contains_key(sid) {
                        return Err(Error::StaleEvent(format!(
                            "dominant speaker {sid} is not in the room"
                        )));
                    }
                }
                model.dominant_speaker.clone_from(participant_sid);
            }
            SessionEvent::ParticipantConnected { participant } => {
                model.add_remote(participant)?;
                info!(
                    participant_sid = %participant.sid,
                    identity = %participant.identity,
                    "Participant connected"
                );
            }
            SessionEvent::ParticipantDisconnected { participant_sid } => {
                let Some(mut remote) = model.remotes.shift_remove(participant_sid) else {
                    return Err(Error::StaleEvent(format!(
                        "unknown participant {participant_sid} disconnected"
                    )));
                };
                effects.extend(
                    remote
                        .release_subscriptions(&mut model.tracks)
                        .into_iter()
                        .map(Effect::EndTrack),
                );
                if model.dominant_speaker.as_ref() == Some(participant_sid) {
                    model.dominant_speaker = None;
                }
                info!(participant_sid = %participant_sid, "Participant disconnected");
            }
            SessionEvent::Participant { participant_sid, event } => {
                let is_local = model
                    .local
                    .as_ref()
                    .is_some_and(|local| local.sid() == participant_sid);
                if is_local {
                    let SessionModel { local, publishing, .. } = &mut *model;
                    if let Some(local) = local.as_mut() {
                        local.apply(event, publishing, effects)?;
                    }
                } else if let Some(remote) = model.remotes.get_mut(participant_sid) {
                    remote.apply(&self.engine, event, &mut model.tracks, effects)?;
                } else {
                    return Err(Error::StaleEvent(format!(
                        "{} for unknown participant {participant_sid}",
                        event.event_type()
                    )));
                }
                debug!(participant_sid = %participant_sid, event_type = event.event_type(), "Participant event applied");
            }
        }
        Ok(())
    }
}
