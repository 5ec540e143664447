//! Participants and the per-participant event reconciliation
//!
//! Publications are kept in three arrival-ordered collections keyed by track
//! sid, one per media kind. Remote participants mirror what signaling
//! reports; the local participant only changes when the engine confirms a
//! publish, an unpublish or an enabled-state change.
//!
//! Subscribed remote tracks are owned by the session's [`TrackStore`];
//! publications only point at them.

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::event::{ParticipantEvent, ParticipantInfo, PublicationInfo};
use crate::publication::{LocalTrackPublication, Publication, RemoteTrackPublication};
use crate::reconcile::Effect;
use crate::snapshot::ParticipantSnapshot;
use crate::track::Track;
use crate::types::{NetworkQualityLevel, ParticipantSid, TrackKind, TrackSid};

pub type RemoteParticipant = Participant<RemoteTrackPublication>;
pub type LocalParticipant = Participant<LocalTrackPublication>;

/// Subscribed remote tracks by sid
pub(crate) type TrackStore = IndexMap<TrackSid, Track>;

#[derive(Debug, Clone)]
pub struct Participant<P> {
    sid: ParticipantSid,
    identity: String,
    network_quality_level: NetworkQualityLevel,
    audio_tracks: IndexMap<TrackSid, P>,
    video_tracks: IndexMap<TrackSid, P>,
    data_tracks: IndexMap<TrackSid, P>,
}

impl<P: Publication> Participant<P> {
    fn empty(info: &ParticipantInfo) -> Self {
        Self {
            sid: info.sid.clone(),
            identity: info.identity.clone(),
            network_quality_level: info.network_quality_level,
            audio_tracks: IndexMap::new(),
            video_tracks: IndexMap::new(),
            data_tracks: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn sid(&self) -> &ParticipantSid {
        &self.sid
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn network_quality_level(&self) -> NetworkQualityLevel {
        self.network_quality_level
    }

    #[must_use]
    pub fn audio_tracks(&self) -> &IndexMap<TrackSid, P> {
        &self.audio_tracks
    }

    #[must_use]
    pub fn video_tracks(&self) -> &IndexMap<TrackSid, P> {
        &self.video_tracks
    }

    #[must_use]
    pub fn data_tracks(&self) -> &IndexMap<TrackSid, P> {
        &self.data_tracks
    }

    /// All publications, audio then video then data
    pub fn publications(&self) -> impl Iterator<Item = &P> {
        self.audio_tracks
            .values()
            .chain(self.video_tracks.values())
            .chain(self.data_tracks.values())
    }

    #[must_use]
    pub fn publication_count(&self) -> usize {
        self.audio_tracks.len() + self.video_tracks.len() + self.data_tracks.len()
    }

    #[must_use]
    pub fn publication(&self, track_sid: &TrackSid) -> Option<&P> {
        self.audio_tracks
            .get(track_sid)
            .or_else(|| self.video_tracks.get(track_sid))
            .or_else(|| self.data_tracks.get(track_sid))
    }

    fn publication_mut(&mut self, track_sid: &TrackSid) -> Option<&mut P> {
        if let Some(p) = self.audio_tracks.get_mut(track_sid) {
            return Some(p);
        }
        if let Some(p) = self.video_tracks.get_mut(track_sid) {
            return Some(p);
        }
        self.data_tracks.get_mut(track_sid)
    }

    fn collection_mut(&mut self, kind: TrackKind) -> &mut IndexMap<TrackSid, P> {
        match kind {
            TrackKind::Audio => &mut self.audio_tracks,
            TrackKind::Video => &mut self.video_tracks,
            TrackKind::Data => &mut self.data_tracks,
        }
    }

    /// Insert a new publication at the end of its collection, or refresh the
    /// existing one in place
    fn upsert(&mut self, info: &PublicationInfo, create: impl FnOnce() -> P) -> bool {
        if let Some(existing) = self.publication_mut(&info.track_sid) {
            existing.refresh(info);
            return false;
        }
        self.collection_mut(info.kind)
            .insert(info.track_sid.clone(), create());
        true
    }

    /// Remove a publication, keeping the order of the rest
    fn remove(&mut self, track_sid: &TrackSid) -> Option<P> {
        self.audio_tracks
            .shift_remove(track_sid)
            .or_else(|| self.video_tracks.shift_remove(track_sid))
            .or_else(|| self.data_tracks.shift_remove(track_sid))
    }

    fn update<F>(&mut self, event: &ParticipantEvent, track_sid: &TrackSid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut P),
    {
        let participant_sid = self.sid.clone();
        let Some(publication) = self.publication_mut(track_sid) else {
            return Err(stale(&participant_sid, event));
        };
        apply(publication);
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            sid: self.sid.clone(),
            identity: self.identity.clone(),
            network_quality_level: self.network_quality_level,
            audio_tracks: self.audio_tracks.values().map(Publication::snapshot).collect(),
            video_tracks: self.video_tracks.values().map(Publication::snapshot).collect(),
            data_tracks: self.data_tracks.values().map(Publication::snapshot).collect(),
        }
    }
}

fn stale(participant_sid: &ParticipantSid, event: &ParticipantEvent) -> Error {
    match event.track_sid() {
        Some(track_sid) => Error::StaleEvent(format!(
            "{} for unknown track {track_sid} of participant {participant_sid}",
            event.event_type()
        )),
        None => Error::StaleEvent(format!(
            "{} does not apply to participant {participant_sid}",
            event.event_type()
        )),
    }
}

impl RemoteParticipant {
    pub(crate) fn from_info(info: &ParticipantInfo) -> Self {
        let mut participant = Self::empty(info);
        for publication in &info.publications {
            participant.upsert(publication, || RemoteTrackPublication::from_info(publication));
        }
        participant
    }

    /// The subscribed track published under `track_sid`, if any
    #[must_use]
    pub fn subscribed_track(&self, track_sid: &TrackSid) -> Option<Track> {
        self.publication(track_sid)
            .and_then(RemoteTrackPublication::remote_track)
    }

    /// Apply one native event to this participant's publications
    pub(crate) fn apply(
        &mut self,
        engine: &Arc<dyn MediaEngine>,
        event: &ParticipantEvent,
        tracks: &mut TrackStore,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        match event {
            ParticipantEvent::TrackPublished { publication } => {
                let inserted = self.upsert(publication, || RemoteTrackPublication::from_info(publication));
                debug!(
                    participant_sid = %self.sid,
                    track_sid = %publication.track_sid,
                    kind = %publication.kind,
                    inserted,
                    "Remote track published"
                );
            }
            ParticipantEvent::TrackUnpublished { track_sid } => {
                if self.remove(track_sid).is_none() {
                    return Err(stale(&self.sid, event));
                }
                if let Some(track) = tracks.shift_remove(track_sid) {
                    effects.push(Effect::EndTrack(track));
                }
                debug!(participant_sid = %self.sid, track_sid = %track_sid, "Remote track unpublished");
            }
            ParticipantEvent::TrackSubscribed { track_sid } => {
                let participant_sid = self.sid.clone();
                let Some(publication) = self.publication_mut(track_sid) else {
                    return Err(stale(&participant_sid, event));
                };
                let track = Track::remote(
                    Arc::clone(engine),
                    track_sid.clone(),
                    publication.track_name().to_string(),
                    publication.kind(),
                    publication.is_track_enabled(),
                );
                publication.subscribe(&track);
                if let Some(previous) = tracks.insert(track_sid.clone(), track.clone()) {
                    effects.push(Effect::EndTrack(previous));
                }
                effects.push(Effect::ObserveTrack(track));
                info!(participant_sid = %participant_sid, track_sid = %track_sid, "Subscribed to remote track");
            }
            ParticipantEvent::TrackUnsubscribed { track_sid } => {
                let participant_sid = self.sid.clone();
                let Some(publication) = self.publication_mut(track_sid) else {
                    return Err(stale(&participant_sid, event));
                };
                publication.unsubscribe();
                if let Some(track) = tracks.shift_remove(track_sid) {
                    effects.push(Effect::EndTrack(track));
                }
                info!(participant_sid = %participant_sid, track_sid = %track_sid, "Unsubscribed from remote track");
            }
            ParticipantEvent::TrackSubscriptionFailed { track_sid, reason } => {
                let participant_sid = self.sid.clone();
                let Some(publication) = self.publication_mut(track_sid) else {
                    return Err(stale(&participant_sid, event));
                };
                publication.fail_subscription(reason.clone());
                if let Some(track) = tracks.shift_remove(track_sid) {
                    effects.push(Effect::EndTrack(track));
                }
                warn!(
                    participant_sid = %participant_sid,
                    track_sid = %track_sid,
                    reason = %reason,
                    "Track subscription failed"
                );
            }
            ParticipantEvent::TrackEnabled { track_sid } => {
                self.update(event, track_sid, |p| p.set_track_enabled(true))?;
            }
            ParticipantEvent::TrackDisabled { track_sid } => {
                self.update(event, track_sid, |p| p.set_track_enabled(false))?;
            }
            ParticipantEvent::TrackPriorityChanged { track_sid, priority } => {
                self.update(event, track_sid, |p| p.set_priority(*priority))?;
            }
            ParticipantEvent::TrackSwitchedOff { track_sid } => {
                self.update(event, track_sid, |p| p.set_switched_off(true))?;
            }
            ParticipantEvent::TrackSwitchedOn { track_sid } => {
                self.update(event, track_sid, |p| p.set_switched_off(false))?;
            }
            ParticipantEvent::NetworkQualityChanged { level } => {
                self.network_quality_level = *level;
            }
            ParticipantEvent::TrackPublicationFailed { .. } => {
                return Err(stale(&self.sid, event));
            }
        }
        Ok(())
    }

    /// Drop every subscription, handing back the tracks to end
    pub(crate) fn release_subscriptions(&mut self, tracks: &mut TrackStore) -> Vec<Track> {
        let mut released = Vec::new();
        for collection in [&mut self.audio_tracks, &mut self.video_tracks, &mut self.data_tracks] {
            for (track_sid, publication) in collection.iter_mut() {
                publication.unsubscribe();
                if let Some(track) = tracks.shift_remove(track_sid) {
                    released.push(track);
                }
            }
        }
        released
    }

    /// Forget `track` if one of our publications still holds it
    pub(crate) fn release_track(&mut self, track: &Track) -> bool {
        let Some(sid) = track.sid() else {
            return false;
        };
        self.publication_mut(&sid)
            .is_some_and(|publication| publication.release_if(track))
    }
}

impl LocalParticipant {
    pub(crate) fn from_info(info: &ParticipantInfo) -> Self {
        Self::empty(info)
    }

    /// Apply one native event to the local participant.
    ///
    /// `publishing` holds tracks whose publish command awaits confirmation,
    /// keyed by track name.
    pub(crate) fn apply(
        &mut self,
        event: &ParticipantEvent,
        publishing: &mut IndexMap<String, Track>,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        match event {
            ParticipantEvent::TrackPublished { publication } => {
                if self.publication(&publication.track_sid).is_some() {
                    self.update(event, &publication.track_sid, |p| p.refresh(publication))?;
                    return Ok(());
                }
                let Some(track) = publishing.shift_remove(&publication.track_name) else {
                    return Err(Error::StaleEvent(format!(
                        "publish confirmation for {} which has no pending publish",
                        publication.track_name
                    )));
                };
                if track.is_ended() {
                    warn!(
                        participant_sid = %self.sid,
                        track_sid = %publication.track_sid,
                        track_name = %publication.track_name,
                        "Publish confirmed for a track that has since ended, unpublishing it"
                    );
                    effects.push(Effect::ResolvePublish {
                        name: publication.track_name.clone(),
                        result: Err(Error::InvalidState(format!(
                            "track {} ended before its publish was confirmed",
                            publication.track_name
                        ))),
                    });
                    effects.push(Effect::UnpublishTrack {
                        name: publication.track_name.clone(),
                    });
                    return Ok(());
                }
                if let Err(err) = track.assign_sid(publication.track_sid.clone()) {
                    warn!(
                        participant_sid = %self.sid,
                        track_sid = %publication.track_sid,
                        error = %err,
                        "Publish confirmation conflicts with the track's sid"
                    );
                    effects.push(Effect::ResolvePublish {
                        name: publication.track_name.clone(),
                        result: Err(err),
                    });
                    return Ok(());
                }
                let local = LocalTrackPublication::new(publication, track);
                self.collection_mut(publication.kind)
                    .insert(publication.track_sid.clone(), local.clone());
                effects.push(Effect::ResolvePublish {
                    name: publication.track_name.clone(),
                    result: Ok(local),
                });
                info!(
                    participant_sid = %self.sid,
                    track_sid = %publication.track_sid,
                    track_name = %publication.track_name,
                    "Local track published"
                );
            }
            ParticipantEvent::TrackPublicationFailed { track_name, reason } => {
                if publishing.shift_remove(track_name).is_none() {
                    return Err(stale(&self.sid, event));
                }
                effects.push(Effect::ResolvePublish {
                    name: track_name.clone(),
                    result: Err(Error::SubscriptionFailure {
                        track: track_name.clone(),
                        reason: reason.clone(),
                    }),
                });
                warn!(
                    participant_sid = %self.sid,
                    track_name = %track_name,
                    reason = %reason,
                    "Local track publication failed"
                );
            }
            ParticipantEvent::TrackUnpublished { track_sid } => {
                let Some(publication) = self.remove(track_sid) else {
                    return Err(stale(&self.sid, event));
                };
                publication.track().clear_sid();
                effects.push(Effect::ResolveUnpublish {
                    sid: track_sid.clone(),
                });
                info!(participant_sid = %self.sid, track_sid = %track_sid, "Local track unpublished");
            }
            ParticipantEvent::TrackEnabled { track_sid } | ParticipantEvent::TrackDisabled { track_sid } => {
                let enabled = matches!(event, ParticipantEvent::TrackEnabled { .. });
                self.update(event, track_sid, |p| p.set_track_enabled(enabled))?;
                effects.push(Effect::ResolveEnabled {
                    sid: track_sid.clone(),
                    enabled,
                });
                debug!(participant_sid = %self.sid, track_sid = %track_sid, enabled, "Local track enabled state confirmed");
            }
            ParticipantEvent::TrackPriorityChanged { track_sid, priority } => {
                self.update(event, track_sid, |p| p.set_priority(*priority))?;
            }
            ParticipantEvent::NetworkQualityChanged { level } => {
                self.network_quality_level = *level;
            }
            ParticipantEvent::TrackSubscribed { .. }
            | ParticipantEvent::TrackUnsubscribed { .. }
            | ParticipantEvent::TrackSubscriptionFailed { .. }
            | ParticipantEvent::TrackSwitchedOff { .. }
            | ParticipantEvent::TrackSwitchedOn { .. } => {
                return Err(stale(&self.sid, event));
            }
        }
        Ok(())
    }

    /// Clear every publication; the tracks themselves stay with the caller
    pub(crate) fn clear_publications(&mut self) {
        for collection in [&mut self.audio_tracks, &mut self.video_tracks, &mut self.data_tracks] {
            for (_, publication) in collection.drain(..) {
                publication.track().clear_sid();
            }
        }
    }

    /// The publication backed by `track`, if it is published here
    #[must_use]
    pub fn publication_of(&self, track: &Track) -> Option<&LocalTrackPublication> {
        self.publications()
            .find(|publication| publication.track().same_track(track))
    }
}
