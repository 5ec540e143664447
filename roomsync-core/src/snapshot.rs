//! Read-only views of the mirrored state tree
//!
//! A [`RoomSnapshot`] is rebuilt after every applied event and handed to
//! subscribers over a `watch` channel. Collections keep arrival order.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::reconcile::RoomState;
use crate::track::TrackSnapshot;
use crate::types::{NetworkQualityLevel, ParticipantSid, RoomSid, TrackKind, TrackPriority, TrackSid};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
    Failed { reason: String },
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubscribed => f.write_str("unsubscribed"),
            Self::Subscribed => f.write_str("subscribed"),
            Self::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationSnapshot {
    pub track_sid: TrackSid,
    pub track_name: String,
    pub kind: TrackKind,
    pub priority: TrackPriority,
    pub is_track_enabled: bool,
    pub is_track_switched_off: bool,
    /// `None` for local publications
    pub subscription: Option<SubscriptionState>,
    pub track: Option<TrackSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub sid: ParticipantSid,
    pub identity: String,
    pub network_quality_level: NetworkQualityLevel,
    pub audio_tracks: Vec<PublicationSnapshot>,
    pub video_tracks: Vec<PublicationSnapshot>,
    pub data_tracks: Vec<PublicationSnapshot>,
}

impl ParticipantSnapshot {
    /// All publications, audio then video then data
    pub fn publications(&self) -> impl Iterator<Item = &PublicationSnapshot> {
        self.audio_tracks
            .iter()
            .chain(&self.video_tracks)
            .chain(&self.data_tracks)
    }

    #[must_use]
    pub fn publication(&self, track_sid: &TrackSid) -> Option<&PublicationSnapshot> {
        self.publications().find(|p| &p.track_sid == track_sid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    /// Bumped on every applied change
    pub version: u64,
    pub sid: Option<RoomSid>,
    pub name: String,
    pub state: RoomState,
    pub is_recording: bool,
    pub dominant_speaker: Option<ParticipantSid>,
    /// Why the room never reached `connected`
    pub failure: Option<String>,
    pub local_participant: Option<ParticipantSnapshot>,
    pub remote_participants: Vec<ParticipantSnapshot>,
}

impl RoomSnapshot {
    #[must_use]
    pub fn connecting(name: impl Into<String>) -> Self {
        Self {
            version: 0,
            sid: None,
            name: name.into(),
            state: RoomState::Connecting,
            is_recording: false,
            dominant_speaker: None,
            failure: None,
            local_participant: None,
            remote_participants: Vec::new(),
        }
    }

    #[must_use]
    pub fn remote_participant(&self, sid: &ParticipantSid) -> Option<&ParticipantSnapshot> {
        self.remote_participants.iter().find(|p| &p.sid == sid)
    }

    /// Indented walk of the whole tree, for debug displays
    #[must_use]
    pub fn render_tree(&self) -> String {
        self.to_string()
    }
}

fn write_publication(f: &mut fmt::Formatter<'_>, publication: &PublicationSnapshot) -> fmt::Result {
    write!(
        f,
        "      {} [{}] priority={} enabled={}",
        publication.track_name, publication.track_sid, publication.priority, publication.is_track_enabled
    )?;
    if let Some(subscription) = &publication.subscription {
        write!(
            f,
            " subscription={subscription} switched_off={}",
            publication.is_track_switched_off
        )?;
    }
    writeln!(f)?;
    if let Some(track) = &publication.track {
        writeln!(
            f,
            "        track {} state={} sinks={}",
            track.name, track.state, track.bound_surfaces
        )?;
    }
    Ok(())
}

fn write_participant(f: &mut fmt::Formatter<'_>, role: &str, participant: &ParticipantSnapshot) -> fmt::Result {
    writeln!(
        f,
        "  {role} participant {} ({}) network={}",
        participant.identity, participant.sid, participant.network_quality_level
    )?;
    for (label, publications) in [
        ("audio", &participant.audio_tracks),
        ("video", &participant.video_tracks),
        ("data", &participant.data_tracks),
    ] {
        if publications.is_empty() {
            continue;
        }
        writeln!(f, "    {label}:")?;
        for publication in publications {
            write_publication(f, publication)?;
        }
    }
    Ok(())
}

impl fmt::Display for RoomSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room {}", self.name)?;
        if let Some(sid) = &self.sid {
            write!(f, " ({sid})")?;
        }
        writeln!(f, " state={} recording={}", self.state, self.is_recording)?;
        if let Some(failure) = &self.failure {
            writeln!(f, "  failure: {failure}")?;
        }
        if let Some(speaker) = &self.dominant_speaker {
            writeln!(f, "  dominant speaker: {speaker}")?;
        }
        if let Some(local) = &self.local_participant {
            write_participant(f, "local", local)?;
        }
        for remote in &self.remote_participants {
            write_participant(f, "remote", remote)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{TrackOrigin, TrackState};

    fn participant() -> ParticipantSnapshot {
        ParticipantSnapshot {
            sid: ParticipantSid::from("PA2"),
            identity: "bob".to_string(),
            network_quality_level: NetworkQualityLevel::Three,
            audio_tracks: Vec::new(),
            video_tracks: vec![PublicationSnapshot {
                track_sid: TrackSid::from("MT9"),
                track_name: "camera".to_string(),
                kind: TrackKind::Video,
                priority: TrackPriority::High,
                is_track_enabled: true,
                is_track_switched_off: false,
                subscription: Some(SubscriptionState::Subscribed),
                track: Some(TrackSnapshot {
                    name: "camera".to_string(),
                    sid: Some(TrackSid::from("MT9")),
                    kind: TrackKind::Video,
                    origin: TrackOrigin::Remote,
                    state: TrackState::Enabled,
                    is_enabled: true,
                    is_playback_enabled: true,
                    bound_surfaces: 1,
                }),
            }],
            data_tracks: Vec::new(),
        }
    }

    #[test]
    fn test_render_tree() {
        let mut snapshot = RoomSnapshot::connecting("demo");
        snapshot.sid = Some(RoomSid::from("RM1"));
        snapshot.state = RoomState::Connected;
        snapshot.dominant_speaker = Some(ParticipantSid::from("PA2"));
        snapshot.remote_participants.push(participant());

        let tree = snapshot.render_tree();
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(
            lines,
            vec![
                "room demo (RM1) state=connected recording=false",
                "  dominant speaker: PA2",
                "  remote participant bob (PA2) network=3",
                "    video:",
                "      camera [MT9] priority=high enabled=true subscription=subscribed switched_off=false",
                "        track camera state=enabled sinks=1",
            ]
        );
    }

    #[test]
    fn test_lookup() {
        let mut snapshot = RoomSnapshot::connecting("demo");
        snapshot.remote_participants.push(participant());

        let bob = snapshot.remote_participant(&ParticipantSid::from("PA2")).unwrap();
        assert!(bob.publication(&TrackSid::from("MT9")).is_some());
        assert!(bob.publication(&TrackSid::from("MT1")).is_none());
    }
}
