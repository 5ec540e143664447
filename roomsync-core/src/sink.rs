//! Rendering surfaces and the exclusive track-to-surface binding
//!
//! A [`VideoSurface`] holds at most one bound [`Track`]. The slot lives on the
//! surface, so a track that ends can clear it without owning the surface.
//!
//! Lock order: surface slot, then track status. A track never touches a
//! surface while holding its own lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::track::{Track, VideoFrame};

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Engine-visible identifier of one rendering sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SinkId(u64);

impl SinkId {
    fn next() -> Self {
        Self(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Receives the frames of whatever track is bound to a surface
pub trait FrameRenderer: Send + Sync {
    fn render(&self, source: &Track, frame: &VideoFrame);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleType {
    #[default]
    AspectFit,
    AspectFill,
    AspectBalanced,
}

struct SurfaceSlot {
    track: Option<Track>,
    scale_type: ScaleType,
    mirror: bool,
}

pub(crate) struct SurfaceInner {
    id: SinkId,
    renderer: Arc<dyn FrameRenderer>,
    slot: Mutex<SurfaceSlot>,
}

impl SurfaceInner {
    /// Called by an ending track: empty the slot if it still holds `track`
    pub(crate) fn release_track(&self, track: &Track) {
        let mut slot = self.slot.lock();
        if slot.track.as_ref().is_some_and(|bound| bound.same_track(track)) {
            slot.track = None;
            debug!(sink = %self.id, track_name = track.name(), "Surface released by ended track");
        }
    }

    /// Render `frame` if `source` is the bound track. The slot lock is held
    /// for the whole call, so a concurrent rebind waits for it to finish.
    pub(crate) fn present(&self, source: &Track, frame: &VideoFrame) -> bool {
        let slot = self.slot.lock();
        match &slot.track {
            Some(bound) if bound.same_track(source) => {
                self.renderer.render(source, frame);
                true
            }
            _ => false,
        }
    }
}

impl Drop for SurfaceInner {
    fn drop(&mut self) {
        if let Some(track) = self.slot.get_mut().track.take() {
            track.detach_surface(self.id);
            track.notify_changed();
        }
    }
}

/// A rendering surface that accepts frames from at most one track
#[derive(Clone)]
pub struct VideoSurface {
    inner: Arc<SurfaceInner>,
}

impl VideoSurface {
    pub fn new(renderer: Arc<dyn FrameRenderer>) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                id: SinkId::next(),
                renderer,
                slot: Mutex::new(SurfaceSlot {
                    track: None,
                    scale_type: ScaleType::default(),
                    mirror: false,
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> SinkId {
        self.inner.id
    }

    /// Bind `track` to this surface, or unbind with `None`.
    ///
    /// Binding the already-bound track does nothing. Otherwise the previous
    /// track's sink is removed before the new one is added. Binding a track
    /// that has ended, including one that ends while the swap is under way,
    /// fails and leaves the surface bound to the previous track if that one
    /// is still live.
    pub fn bind(&self, track: Option<&Track>) -> Result<()> {
        let Some(next) = track else {
            self.unbind();
            return Ok(());
        };

        let mut slot = self.inner.slot.lock();
        if slot.track.as_ref().is_some_and(|bound| bound.same_track(next)) {
            return Ok(());
        }
        if next.is_ended() {
            return Err(Error::InvalidState(format!(
                "cannot bind ended track {}",
                next.name()
            )));
        }

        let previous = slot.track.take();
        if let Some(previous) = &previous {
            previous.detach_surface(self.inner.id);
            debug!(sink = %self.inner.id, track_name = previous.name(), "Surface detached");
        }

        if let Err(err) = next.attach_surface(self.inner.id, Arc::downgrade(&self.inner)) {
            let Some(previous) = previous else {
                return Err(err);
            };
            if previous
                .attach_surface(self.inner.id, Arc::downgrade(&self.inner))
                .is_ok()
            {
                slot.track = Some(previous);
                debug!(sink = %self.inner.id, track_name = next.name(), "Rebind failed, previous track restored");
            } else {
                drop(slot);
                previous.notify_changed();
            }
            return Err(err);
        }
        slot.track = Some(next.clone());
        drop(slot);
        debug!(sink = %self.inner.id, track_name = next.name(), "Surface attached");

        if let Some(previous) = previous {
            previous.notify_changed();
        }
        next.notify_changed();
        Ok(())
    }

    pub fn unbind(&self) {
        let previous = self.inner.slot.lock().track.take();
        if let Some(previous) = previous {
            previous.detach_surface(self.inner.id);
            debug!(sink = %self.inner.id, track_name = previous.name(), "Surface detached");
            previous.notify_changed();
        }
    }

    #[must_use]
    pub fn bound_track(&self) -> Option<Track> {
        self.inner.slot.lock().track.clone()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.inner.slot.lock().track.is_some()
    }

    #[must_use]
    pub fn scale_type(&self) -> ScaleType {
        self.inner.slot.lock().scale_type
    }

    pub fn set_scale_type(&self, scale_type: ScaleType) {
        self.inner.slot.lock().scale_type = scale_type;
    }

    #[must_use]
    pub fn mirror(&self) -> bool {
        self.inner.slot.lock().mirror
    }

    pub fn set_mirror(&self, mirror: bool) {
        self.inner.slot.lock().mirror = mirror;
    }
}

impl fmt::Debug for VideoSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("VideoSurface")
            .field("id", &self.inner.id)
            .field("track", &slot.track.as_ref().map(Track::name))
            .field("scale_type", &slot.scale_type)
            .field("mirror", &slot.mirror)
            .finish()
    }
}
