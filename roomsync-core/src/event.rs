//! Native session events
//!
//! The engine delivers these one at a time, in order, over the channel it was
//! handed at connect time. They are plain data so a bridge (or a replay file)
//! can feed them as JSON.

use serde::{Deserialize, Serialize};

use crate::types::{NetworkQualityLevel, ParticipantSid, RoomSid, TrackKind, TrackPriority, TrackSid};

/// Published metadata of one track as reported by the signaling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationInfo {
    pub track_sid: TrackSid,
    pub track_name: String,
    pub kind: TrackKind,
    #[serde(default)]
    pub priority: TrackPriority,
    #[serde(default = "default_true")]
    pub is_track_enabled: bool,
}

/// Participant as reported on connect or join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub sid: ParticipantSid,
    pub identity: String,
    #[serde(default)]
    pub network_quality_level: NetworkQualityLevel,
    #[serde(default)]
    pub publications: Vec<PublicationInfo>,
}

const fn default_true() -> bool {
    true
}

/// Events scoped to one participant's publications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParticipantEvent {
    TrackPublished { publication: PublicationInfo },
    /// Local participant only: the engine refused a publish command
    TrackPublicationFailed { track_name: String, reason: String },
    TrackUnpublished { track_sid: TrackSid },
    TrackSubscribed { track_sid: TrackSid },
    TrackUnsubscribed { track_sid: TrackSid },
    TrackSubscriptionFailed { track_sid: TrackSid, reason: String },
    TrackEnabled { track_sid: TrackSid },
    TrackDisabled { track_sid: TrackSid },
    TrackPriorityChanged { track_sid: TrackSid, priority: TrackPriority },
    TrackSwitchedOff { track_sid: TrackSid },
    TrackSwitchedOn { track_sid: TrackSid },
    NetworkQualityChanged { level: NetworkQualityLevel },
}

impl ParticipantEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::TrackPublished { .. } => "track_published",
            Self::TrackPublicationFailed { .. } => "track_publication_failed",
            Self::TrackUnpublished { .. } => "track_unpublished",
            Self::TrackSubscribed { .. } => "track_subscribed",
            Self::TrackUnsubscribed { .. } => "track_unsubscribed",
            Self::TrackSubscriptionFailed { .. } => "track_subscription_failed",
            Self::TrackEnabled { .. } => "track_enabled",
            Self::TrackDisabled { .. } => "track_disabled",
            Self::TrackPriorityChanged { .. } => "track_priority_changed",
            Self::TrackSwitchedOff { .. } => "track_switched_off",
            Self::TrackSwitchedOn { .. } => "track_switched_on",
            Self::NetworkQualityChanged { .. } => "network_quality_changed",
        }
    }

    /// The track this event names, if any
    #[must_use]
    pub fn track_sid(&self) -> Option<&TrackSid> {
        match self {
            Self::TrackPublished { publication } => Some(&publication.track_sid),
            Self::TrackUnpublished { track_sid }
            | Self::TrackSubscribed { track_sid }
            | Self::TrackUnsubscribed { track_sid }
            | Self::TrackSubscriptionFailed { track_sid, .. }
            | Self::TrackEnabled { track_sid }
            | Self::TrackDisabled { track_sid }
            | Self::TrackPriorityChanged { track_sid, .. }
            | Self::TrackSwitchedOff { track_sid }
            | Self::TrackSwitchedOn { track_sid } => Some(track_sid),
            Self::TrackPublicationFailed { .. } | Self::NetworkQualityChanged { .. } => None,
        }
    }
}

/// Session-level events delivered by the native engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    RoomConnected {
        room_sid: RoomSid,
        room_name: String,
        local_participant: ParticipantInfo,
        #[serde(default)]
        remote_participants: Vec<ParticipantInfo>,
        #[serde(default)]
        is_recording: bool,
    },
    ConnectFailed {
        reason: String,
    },
    Reconnecting {
        #[serde(default)]
        reason: Option<String>,
    },
    Reconnected,
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    RecordingStarted,
    RecordingStopped,
    DominantSpeakerChanged {
        #[serde(default)]
        participant_sid: Option<ParticipantSid>,
    },
    ParticipantConnected {
        participant: ParticipantInfo,
    },
    ParticipantDisconnected {
        participant_sid: ParticipantSid,
    },
    Participant {
        participant_sid: ParticipantSid,
        event: ParticipantEvent,
    },
}

impl SessionEvent {
    pub fn participant(participant_sid: impl Into<ParticipantSid>, event: ParticipantEvent) -> Self {
        Self::Participant {
            participant_sid: participant_sid.into(),
            event,
        }
    }

    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::RoomConnected { .. } => "room_connected",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::Disconnected { .. } => "disconnected",
            Self::RecordingStarted => "recording_started",
            Self::RecordingStopped => "recording_stopped",
            Self::DominantSpeakerChanged { .. } => "dominant_speaker_changed",
            Self::ParticipantConnected { .. } => "participant_connected",
            Self::ParticipantDisconnected { .. } => "participant_disconnected",
            Self::Participant { event, .. } => event.event_type(),
        }
    }

    /// Get the participant sid for events that belong to a specific participant
    #[must_use]
    pub fn participant_sid(&self) -> Option<&ParticipantSid> {
        match self {
            Self::ParticipantConnected { participant } => Some(&participant.sid),
            Self::ParticipantDisconnected { participant_sid }
            | Self::Participant { participant_sid, .. } => Some(participant_sid),
            Self::DominantSpeakerChanged { participant_sid } => participant_sid.as_ref(),
            _ => None,
        }
    }

    /// Parse one event from its JSON form
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_event_from_json() {
        let event = SessionEvent::from_json(
            r#"{"type":"participant","participant_sid":"PA1","event":{"type":"track_published","publication":{"track_sid":"MT1","track_name":"camera","kind":"video"}}}"#,
        )
        .unwrap();

        assert_eq!(event.event_type(), "track_published");
        assert_eq!(event.participant_sid(), Some(&ParticipantSid::from("PA1")));
        match event {
            SessionEvent::Participant {
                event: ParticipantEvent::TrackPublished { publication },
                ..
            } => {
                assert_eq!(publication.priority, TrackPriority::Standard);
                assert!(publication.is_track_enabled);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unit_variants() {
        let event = SessionEvent::from_json(r#"{"type":"reconnected"}"#).unwrap();
        assert_eq!(event, SessionEvent::Reconnected);

        let event = SessionEvent::from_json(r#"{"type":"disconnected"}"#).unwrap();
        assert_eq!(event, SessionEvent::Disconnected { reason: None });
    }

    #[test]
    fn test_track_sid_accessor() {
        let event = ParticipantEvent::TrackSubscriptionFailed {
            track_sid: TrackSid::from("MT9"),
            reason: "unsupported codec".to_string(),
        };
        assert_eq!(event.track_sid(), Some(&TrackSid::from("MT9")));
        assert_eq!(
            ParticipantEvent::NetworkQualityChanged {
                level: NetworkQualityLevel::Four
            }
            .track_sid(),
            None
        );
    }
}
