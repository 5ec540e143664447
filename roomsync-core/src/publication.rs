//! Track publications
//!
//! A publication is the signaling-side record of a track: its sid, name,
//! kind and publisher-reported flags. Remote publications additionally carry
//! the local subscription to that track.

use crate::error::Error;
use crate::event::PublicationInfo;
use crate::snapshot::{PublicationSnapshot, SubscriptionState};
use crate::track::{Track, WeakTrack};
use crate::types::{TrackKind, TrackPriority, TrackSid};

/// What every publication exposes, local or remote
pub trait Publication: Clone {
    fn track_sid(&self) -> &TrackSid;
    fn track_name(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn priority(&self) -> TrackPriority;
    fn snapshot(&self) -> PublicationSnapshot;

    /// Apply a publisher-reported re-announcement to an existing publication
    fn refresh(&mut self, info: &PublicationInfo);
    fn set_priority(&mut self, priority: TrackPriority);
    fn set_track_enabled(&mut self, enabled: bool);
}

/// Local subscription to a remote publication.
///
/// Holding the track inside the `Subscribed` variant keeps "subscribed" and
/// "has a track" from ever disagreeing. The reference is weak: the session
/// owns the track, so a cloned publication never keeps it alive.
#[derive(Debug, Clone, Default)]
pub enum Subscription {
    #[default]
    Unsubscribed,
    Subscribed(WeakTrack),
    Failed { reason: String },
}

impl Subscription {
    /// The subscribed track, if it is still live
    #[must_use]
    pub fn track(&self) -> Option<Track> {
        match self {
            Self::Subscribed(track) => track.upgrade().filter(|track| !track.is_ended()),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        match self {
            Self::Unsubscribed => SubscriptionState::Unsubscribed,
            Self::Subscribed(_) if self.track().is_none() => SubscriptionState::Unsubscribed,
            Self::Subscribed(_) => SubscriptionState::Subscribed,
            Self::Failed { reason } => SubscriptionState::Failed {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteTrackPublication {
    track_sid: TrackSid,
    track_name: String,
    kind: TrackKind,
    priority: TrackPriority,
    is_track_enabled: bool,
    is_track_switched_off: bool,
    subscription: Subscription,
}

impl RemoteTrackPublication {
    pub(crate) fn from_info(info: &PublicationInfo) -> Self {
        Self {
            track_sid: info.track_sid.clone(),
            track_name: info.track_name.clone(),
            kind: info.kind,
            priority: info.priority,
            is_track_enabled: info.is_track_enabled,
            is_track_switched_off: false,
            subscription: Subscription::Unsubscribed,
        }
    }

    #[must_use]
    pub fn is_track_enabled(&self) -> bool {
        self.is_track_enabled
    }

    #[must_use]
    pub fn is_track_switched_off(&self) -> bool {
        self.is_track_switched_off
    }

    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    #[must_use]
    pub fn is_track_subscribed(&self) -> bool {
        self.remote_track().is_some()
    }

    /// The subscribed track; present exactly when `is_track_subscribed()`
    #[must_use]
    pub fn remote_track(&self) -> Option<Track> {
        self.subscription.track()
    }

    /// The last subscription attempt failed
    #[must_use]
    pub fn subscription_failure(&self) -> Option<Error> {
        match &self.subscription {
            Subscription::Failed { reason } => Some(Error::SubscriptionFailure {
                track: self.track_name.clone(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }

    /// Point the subscription at a newly subscribed track
    pub(crate) fn subscribe(&mut self, track: &Track) {
        self.subscription = Subscription::Subscribed(track.downgrade());
    }

    pub(crate) fn unsubscribe(&mut self) {
        self.subscription = Subscription::Unsubscribed;
    }

    pub(crate) fn fail_subscription(&mut self, reason: String) {
        self.subscription = Subscription::Failed { reason };
    }

    /// Drop the subscription if it still refers to `track`
    pub(crate) fn release_if(&mut self, track: &Track) -> bool {
        if matches!(&self.subscription, Subscription::Subscribed(held) if held.points_to(track)) {
            self.subscription = Subscription::Unsubscribed;
            return true;
        }
        false
    }

    pub(crate) fn set_switched_off(&mut self, switched_off: bool) {
        self.is_track_switched_off = switched_off;
    }
}

impl Publication for RemoteTrackPublication {
    fn track_sid(&self) -> &TrackSid {
        &self.track_sid
    }

    fn track_name(&self) -> &str {
        &self.track_name
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn priority(&self) -> TrackPriority {
        self.priority
    }

    fn snapshot(&self) -> PublicationSnapshot {
        PublicationSnapshot {
            track_sid: self.track_sid.clone(),
            track_name: self.track_name.clone(),
            kind: self.kind,
            priority: self.priority,
            is_track_enabled: self.is_track_enabled,
            is_track_switched_off: self.is_track_switched_off,
            subscription: Some(self.subscription.state()),
            track: self.remote_track().as_ref().map(Track::snapshot),
        }
    }

    fn refresh(&mut self, info: &PublicationInfo) {
        self.track_name.clone_from(&info.track_name);
        self.priority = info.priority;
        self.set_track_enabled(info.is_track_enabled);
    }

    fn set_priority(&mut self, priority: TrackPriority) {
        self.priority = priority;
    }

    fn set_track_enabled(&mut self, enabled: bool) {
        self.is_track_enabled = enabled;
        if let Some(track) = self.remote_track() {
            track.mark_enabled(enabled);
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalTrackPublication {
    track_sid: TrackSid,
    track_name: String,
    kind: TrackKind,
    priority: TrackPriority,
    is_track_enabled: bool,
    track: Track,
}

impl LocalTrackPublication {
    pub(crate) fn new(info: &PublicationInfo, track: Track) -> Self {
        track.mark_enabled(info.is_track_enabled);
        Self {
            track_sid: info.track_sid.clone(),
            track_name: info.track_name.clone(),
            kind: info.kind,
            priority: info.priority,
            is_track_enabled: info.is_track_enabled,
            track,
        }
    }

    #[must_use]
    pub fn is_track_enabled(&self) -> bool {
        self.is_track_enabled
    }

    #[must_use]
    pub fn track(&self) -> &Track {
        &self.track
    }
}

impl Publication for LocalTrackPublication {
    fn track_sid(&self) -> &TrackSid {
        &self.track_sid
    }

    fn track_name(&self) -> &str {
        &self.track_name
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn priority(&self) -> TrackPriority {
        self.priority
    }

    fn snapshot(&self) -> PublicationSnapshot {
        PublicationSnapshot {
            track_sid: self.track_sid.clone(),
            track_name: self.track_name.clone(),
            kind: self.kind,
            priority: self.priority,
            is_track_enabled: self.is_track_enabled,
            is_track_switched_off: false,
            subscription: None,
            track: Some(self.track.snapshot()),
        }
    }

    fn refresh(&mut self, info: &PublicationInfo) {
        self.priority = info.priority;
        self.set_track_enabled(info.is_track_enabled);
    }

    fn set_priority(&mut self, priority: TrackPriority) {
        self.priority = priority;
    }

    /// The publication and the local track always report the same state
    fn set_track_enabled(&mut self, enabled: bool) {
        self.is_track_enabled = enabled;
        self.track.mark_enabled(enabled);
    }
}
