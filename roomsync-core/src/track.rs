//! Media track handles
//!
//! A [`Track`] is a cheap, cloneable handle to one audio, video or data stream.
//! Local tracks are created by the application and own a native capture;
//! remote tracks are created when a subscription is confirmed.
//!
//! Ending a track (local `destroy()`, remote unsubscribe, participant leaving)
//! detaches every surface still bound to it and notifies the room so the
//! publication referencing it is released.
//!
//! Publications hold a [`WeakTrack`]; the session owns the strong handle.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::engine::{MediaEngine, TrackRef};
use crate::error::{Error, Result};
use crate::sink::{SinkId, SurfaceInner};
use crate::types::{TrackKind, TrackSid};

/// Lifecycle state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Enabled,
    Disabled,
    Ended,
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Ended => "ended",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackOrigin {
    Local,
    Remote,
}

/// One decoded video frame as handed over by the engine
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp_us: i64,
    pub data: Bytes,
}

/// Point-in-time view of a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub name: String,
    pub sid: Option<TrackSid>,
    pub kind: TrackKind,
    pub origin: TrackOrigin,
    pub state: TrackState,
    pub is_enabled: bool,
    pub is_playback_enabled: bool,
    pub bound_surfaces: usize,
}

/// Resolves once the engine's enable/disable report has been applied
pub(crate) type EnableOutcome = oneshot::Receiver<Result<()>>;

/// Gets told when a track ends or changes, whatever caused it
pub(crate) trait TrackObserver: Send + Sync {
    fn track_ended(&self, track: &Track);

    /// Something shown in the track's snapshot changed outside the event path
    fn track_changed(&self, track: &Track);

    /// Issue an enable/disable for a local track published through this
    /// observer. `None` if the track is not published here.
    fn request_enabled(&self, track: &Track, enabled: bool) -> Option<Result<EnableOutcome>>;
}

struct TrackStatus {
    sid: Option<TrackSid>,
    enabled: bool,
    playback_enabled: bool,
    ended: bool,
    surfaces: Vec<(SinkId, Weak<SurfaceInner>)>,
    observers: Vec<Weak<dyn TrackObserver>>,
}

struct TrackInner {
    name: String,
    kind: TrackKind,
    origin: TrackOrigin,
    engine: Arc<dyn MediaEngine>,
    status: Mutex<TrackStatus>,
}

#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackInner>,
}

/// Non-owning reference to a [`Track`]
#[derive(Clone)]
pub struct WeakTrack {
    inner: Weak<TrackInner>,
}

impl WeakTrack {
    #[must_use]
    pub fn upgrade(&self) -> Option<Track> {
        self.inner.upgrade().map(|inner| Track { inner })
    }

    #[must_use]
    pub fn points_to(&self, track: &Track) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&track.inner))
    }
}

impl fmt::Debug for WeakTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(track) => f.debug_tuple("WeakTrack").field(&track).finish(),
            None => f.write_str("WeakTrack(dropped)"),
        }
    }
}

impl Track {
    /// Start a local capture track
    pub fn create_local(
        engine: Arc<dyn MediaEngine>,
        name: impl Into<String>,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<Self> {
        let name = name.into();
        engine.create_local_track(&name, kind, enabled)?;

        info!(track_name = %name, kind = %kind, enabled, "Created local track");

        Ok(Self::build(engine, name, kind, TrackOrigin::Local, None, enabled))
    }

    /// Mirror of a remote track whose subscription was just confirmed
    pub(crate) fn remote(
        engine: Arc<dyn MediaEngine>,
        sid: TrackSid,
        name: String,
        kind: TrackKind,
        enabled: bool,
    ) -> Self {
        debug!(track_sid = %sid, track_name = %name, kind = %kind, "Created remote track");
        Self::build(engine, name, kind, TrackOrigin::Remote, Some(sid), enabled)
    }

    fn build(
        engine: Arc<dyn MediaEngine>,
        name: String,
        kind: TrackKind,
        origin: TrackOrigin,
        sid: Option<TrackSid>,
        enabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                name,
                kind,
                origin,
                engine,
                status: Mutex::new(TrackStatus {
                    sid,
                    enabled,
                    playback_enabled: true,
                    ended: false,
                    surfaces: Vec::new(),
                    observers: Vec::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    #[must_use]
    pub fn origin(&self) -> TrackOrigin {
        self.inner.origin
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.inner.origin == TrackOrigin::Local
    }

    /// Signaling-assigned sid; `None` for a local track that is not published
    #[must_use]
    pub fn sid(&self) -> Option<TrackSid> {
        self.inner.status.lock().sid.clone()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        let status = self.inner.status.lock();
        status.enabled && !status.ended
    }

    #[must_use]
    pub fn is_playback_enabled(&self) -> bool {
        self.inner.status.lock().playback_enabled
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.status.lock().ended
    }

    #[must_use]
    pub fn state(&self) -> TrackState {
        let status = self.inner.status.lock();
        Self::state_of(&status)
    }

    fn state_of(status: &TrackStatus) -> TrackState {
        if status.ended {
            TrackState::Ended
        } else if status.enabled {
            TrackState::Enabled
        } else {
            TrackState::Disabled
        }
    }

    /// How the engine addresses this track
    #[must_use]
    pub fn native_ref(&self) -> TrackRef {
        match self.inner.origin {
            TrackOrigin::Local => TrackRef::Local(self.inner.name.clone()),
            TrackOrigin::Remote => match self.sid() {
                Some(sid) => TrackRef::Remote(sid),
                None => TrackRef::Local(self.inner.name.clone()),
            },
        }
    }

    #[must_use]
    pub fn same_track(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakTrack {
        WeakTrack {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> TrackSnapshot {
        let status = self.inner.status.lock();
        TrackSnapshot {
            name: self.inner.name.clone(),
            sid: status.sid.clone(),
            kind: self.inner.kind,
            origin: self.inner.origin,
            state: Self::state_of(&status),
            is_enabled: status.enabled && !status.ended,
            is_playback_enabled: status.playback_enabled,
            bound_surfaces: status.surfaces.len(),
        }
    }

    /// Enable or disable local capture.
    ///
    /// For a published track this resolves once the room has applied the
    /// engine's enabled/disabled report for it, and the publication and the
    /// track change together. An unpublished capture has no session to report
    /// through, so the engine's answer confirms it directly.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        if !self.is_local() {
            return Err(Error::InvalidState(format!(
                "remote track {} is controlled by its publisher",
                self.inner.name
            )));
        }
        if self.is_ended() {
            return Err(Error::InvalidState(format!(
                "track {} has ended",
                self.inner.name
            )));
        }

        let observers = self.inner.status.lock().observers.clone();
        let pending = observers
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|observer| observer.request_enabled(self, enabled));
        if let Some(pending) = pending {
            return match pending?.await {
                Ok(result) => result,
                Err(_) => Err(Error::Disconnected),
            };
        }

        self.inner.engine.set_track_enabled(&self.inner.name, enabled)?;
        {
            let mut status = self.inner.status.lock();
            if status.ended {
                return Err(Error::InvalidState(format!(
                    "track {} has ended",
                    self.inner.name
                )));
            }
            status.enabled = enabled;
        }
        debug!(track_name = %self.inner.name, enabled, "Unpublished local track enabled state changed");
        Ok(())
    }

    /// Mute or unmute playback of a remote audio track
    pub fn set_playback_enabled(&self, enabled: bool) -> Result<()> {
        if self.is_local() || self.inner.kind != TrackKind::Audio {
            return Err(Error::InvalidState(format!(
                "playback can only be toggled on remote audio tracks, not {}",
                self.inner.name
            )));
        }
        let sid = {
            let status = self.inner.status.lock();
            if status.ended {
                return Err(Error::InvalidState(format!(
                    "track {} has ended",
                    self.inner.name
                )));
            }
            status.sid.clone()
        };
        let Some(sid) = sid else {
            return Err(Error::InvalidState(format!(
                "remote track {} has no sid",
                self.inner.name
            )));
        };

        self.inner.engine.set_playback_enabled(&sid, enabled)?;
        self.inner.status.lock().playback_enabled = enabled;
        self.notify_changed();
        Ok(())
    }

    /// Release the track's native resources. Calling it again is a no-op.
    pub fn destroy(&self) {
        if self.end() && self.is_local() {
            self.inner.engine.release_local_track(&self.inner.name);
        }
    }

    /// Move to `Ended`, detach every bound surface and notify observers.
    /// Returns false if the track had already ended.
    pub(crate) fn end(&self) -> bool {
        let (surfaces, observers) = {
            let mut status = self.inner.status.lock();
            if status.ended {
                return false;
            }
            status.ended = true;
            (
                std::mem::take(&mut status.surfaces),
                std::mem::take(&mut status.observers),
            )
        };

        let native = self.native_ref();
        for (sink, surface) in surfaces {
            if let Some(surface) = surface.upgrade() {
                surface.release_track(self);
            }
            self.inner.engine.remove_sink(&native, sink);
        }

        info!(track_name = %self.inner.name, track = %native, "Track ended");

        for observer in observers.iter().filter_map(Weak::upgrade) {
            observer.track_ended(self);
        }
        true
    }

    /// Signaling confirmed a publication of this local track
    pub(crate) fn assign_sid(&self, sid: TrackSid) -> Result<()> {
        let mut status = self.inner.status.lock();
        match &status.sid {
            Some(existing) if *existing != sid => Err(Error::InvalidState(format!(
                "track {} already has sid {existing}",
                self.inner.name
            ))),
            _ => {
                status.sid = Some(sid);
                Ok(())
            }
        }
    }

    /// The publication of this local track is gone
    pub(crate) fn clear_sid(&self) {
        if self.is_local() {
            self.inner.status.lock().sid = None;
        }
    }

    /// Enabled state as reported through the session's event stream
    pub(crate) fn mark_enabled(&self, enabled: bool) {
        let mut status = self.inner.status.lock();
        if !status.ended {
            status.enabled = enabled;
        }
    }

    /// Tell the observers that the snapshot of this track changed
    pub(crate) fn notify_changed(&self) {
        let observers = self.inner.status.lock().observers.clone();
        for observer in observers.iter().filter_map(Weak::upgrade) {
            observer.track_changed(self);
        }
    }

    pub(crate) fn observe(&self, observer: Weak<dyn TrackObserver>) {
        let mut status = self.inner.status.lock();
        if status.ended {
            return;
        }
        status.observers.retain(|o| o.strong_count() > 0);
        if !status.observers.iter().any(|o| o.ptr_eq(&observer)) {
            status.observers.push(observer);
        }
    }

    pub(crate) fn attach_surface(&self, sink: SinkId, surface: Weak<SurfaceInner>) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            if status.ended {
                return Err(Error::InvalidState(format!(
                    "cannot bind ended track {}",
                    self.inner.name
                )));
            }
            if status.surfaces.iter().any(|(id, _)| *id == sink) {
                return Ok(());
            }
            status.surfaces.push((sink, surface));
        }
        self.inner.engine.add_sink(&self.native_ref(), sink);
        Ok(())
    }

    pub(crate) fn detach_surface(&self, sink: SinkId) {
        let removed = {
            let mut status = self.inner.status.lock();
            let before = status.surfaces.len();
            status.surfaces.retain(|(id, _)| *id != sink);
            before != status.surfaces.len()
        };
        if removed {
            self.inner.engine.remove_sink(&self.native_ref(), sink);
        }
    }

    #[must_use]
    pub fn bound_surface_count(&self) -> usize {
        self.inner.status.lock().surfaces.len()
    }

    #[must_use]
    pub fn has_bound_surface(&self) -> bool {
        self.bound_surface_count() > 0
    }

    /// Hand a decoded frame to every surface bound to this track.
    /// Returns how many surfaces rendered it.
    pub fn render_frame(&self, frame: &VideoFrame) -> usize {
        let surfaces: Vec<Arc<SurfaceInner>> = {
            let status = self.inner.status.lock();
            if status.ended {
                return 0;
            }
            status
                .surfaces
                .iter()
                .filter_map(|(_, surface)| surface.upgrade())
                .collect()
        };

        surfaces
            .iter()
            .filter(|surface| surface.present(self, frame))
            .count()
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{EngineCommand, LoopbackEngine};

    #[tokio::test]
    async fn test_local_track_lifecycle() {
        let engine = LoopbackEngine::new();
        let track = Track::create_local(engine.clone(), "microphone", TrackKind::Audio, true).unwrap();

        assert_eq!(track.state(), TrackState::Enabled);
        assert_eq!(track.sid(), None);

        track.set_enabled(false).await.unwrap();
        assert_eq!(track.state(), TrackState::Disabled);
        assert_eq!(engine.local_track_enabled("microphone"), Some(false));

        track.destroy();
        assert_eq!(track.state(), TrackState::Ended);
        assert!(!track.is_enabled());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let engine = LoopbackEngine::new();
        let track = Track::create_local(engine.clone(), "camera", TrackKind::Video, true).unwrap();

        track.destroy();
        track.destroy();

        let releases = engine
            .commands()
            .into_iter()
            .filter(|c| matches!(c, EngineCommand::ReleaseLocalTrack { .. }))
            .count();
        assert_eq!(releases, 1);
    }

    #[tokio::test]
    async fn test_set_enabled_after_end_fails() {
        let engine = LoopbackEngine::new();
        let track = Track::create_local(engine, "camera", TrackKind::Video, true).unwrap();
        track.destroy();

        let err = track.set_enabled(true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(track.state(), TrackState::Ended);
    }

    #[tokio::test]
    async fn test_set_enabled_rejected_by_engine_keeps_state() {
        let engine = LoopbackEngine::new();
        let track = Track::create_local(engine.clone(), "camera", TrackKind::Video, true).unwrap();
        engine.reject("set_track_enabled", "camera busy");

        assert!(matches!(track.set_enabled(false).await, Err(Error::Engine(_))));
        assert_eq!(track.state(), TrackState::Enabled);
    }

    #[test]
    fn test_weak_track_does_not_keep_track_alive() {
        let engine = LoopbackEngine::new();
        let track = Track::remote(
            engine,
            TrackSid::from("MT9"),
            "screen".to_string(),
            TrackKind::Video,
            true,
        );
        let weak = track.downgrade();
        assert!(weak.points_to(&track));
        assert!(weak.upgrade().unwrap().same_track(&track));

        drop(track);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_remote_track_is_read_only() {
        let engine = LoopbackEngine::new();
        let track = Track::remote(
            engine,
            TrackSid::from("MT1"),
            "camera".to_string(),
            TrackKind::Video,
            true,
        );

        assert!(matches!(track.set_enabled(false).await, Err(Error::InvalidState(_))));
        assert!(matches!(
            track.set_playback_enabled(false),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(track.native_ref(), TrackRef::Remote(TrackSid::from("MT1")));
    }

    #[test]
    fn test_remote_audio_playback_toggle() {
        let engine = LoopbackEngine::new();
        let track = Track::remote(
            engine.clone(),
            TrackSid::from("MT2"),
            "microphone".to_string(),
            TrackKind::Audio,
            true,
        );

        track.set_playback_enabled(false).unwrap();
        assert!(!track.is_playback_enabled());
        assert!(engine.commands().contains(&EngineCommand::SetPlaybackEnabled {
            track_sid: TrackSid::from("MT2"),
            enabled: false,
        }));
    }

    #[test]
    fn test_sid_assigned_once() {
        let engine = LoopbackEngine::new();
        let track = Track::create_local(engine, "camera", TrackKind::Video, true).unwrap();

        track.assign_sid(TrackSid::from("MT1")).unwrap();
        track.assign_sid(TrackSid::from("MT1")).unwrap();
        assert!(track.assign_sid(TrackSid::from("MT2")).is_err());
        assert_eq!(track.sid(), Some(TrackSid::from("MT1")));

        track.clear_sid();
        assert_eq!(track.sid(), None);
    }

    #[test]
    fn test_duplicate_local_name_rejected() {
        let engine = LoopbackEngine::new();
        let _first = Track::create_local(engine.clone(), "camera", TrackKind::Video, true).unwrap();
        let second = Track::create_local(engine, "camera", TrackKind::Video, true);
        assert!(matches!(second, Err(Error::Engine(_))));
    }
}
