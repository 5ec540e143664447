//! Room sessions
//!
//! A [`Room`] owns one native session. Native events arrive on a
//! single-consumer queue drained by a background task, are reconciled into
//! the session model under a write lock, and then published as a fresh
//! [`RoomSnapshot`]. Commands (`publish`, `unpublish`, enabling a published
//! track) resolve only when the confirming event has been reconciled through
//! that same path. Changes that never reach the event stream (surface
//! bindings, remote playback) still bump the snapshot version.
//!
//! Lock order: room model, then pending commands, then track state.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ConnectOptions, SessionConfig};
use crate::engine::{ListenerRegistration, MediaEngine, SessionHandle};
use crate::error::{Error, Result};
use crate::event::SessionEvent;
use crate::logging::generate_session_id;
use crate::participant::RemoteParticipant;
use crate::publication::{LocalTrackPublication, Publication};
use crate::reconcile::{Effect, Reconciler, RoomState, SessionModel};
use crate::snapshot::{ParticipantSnapshot, RoomSnapshot};
use crate::track::{EnableOutcome, Track, TrackObserver};
use crate::types::{ParticipantSid, RoomSid, TrackPriority, TrackSid};

type PublishReply = oneshot::Sender<Result<LocalTrackPublication>>;
type CommandOutcome = oneshot::Receiver<Result<()>>;

/// One caller waiting for a command on a track; `id` tells concurrent
/// callers of the same command apart
struct Waiter {
    id: u64,
    reply: oneshot::Sender<Result<()>>,
}

impl Waiter {
    fn resolve(self, result: Result<()>) {
        let _ = self.reply.send(result);
    }
}

/// Commands waiting for their confirming event
#[derive(Default)]
struct PendingCommands {
    next_id: u64,
    publishes: HashMap<String, PublishReply>,
    unpublishes: HashMap<TrackSid, Vec<Waiter>>,
    /// Enable/disable requests with the state each one asked for
    enables: HashMap<TrackSid, Vec<(bool, Waiter)>>,
}

impl PendingCommands {
    fn waiter(&mut self) -> (Waiter, CommandOutcome) {
        self.next_id += 1;
        let (reply, outcome) = oneshot::channel();
        (Waiter { id: self.next_id, reply }, outcome)
    }

    fn add_unpublish(&mut self, sid: TrackSid) -> (u64, CommandOutcome) {
        let (waiter, outcome) = self.waiter();
        let id = waiter.id;
        self.unpublishes.entry(sid).or_default().push(waiter);
        (id, outcome)
    }

    fn add_enable(&mut self, sid: TrackSid, enabled: bool) -> (u64, CommandOutcome) {
        let (waiter, outcome) = self.waiter();
        let id = waiter.id;
        self.enables.entry(sid).or_default().push((enabled, waiter));
        (id, outcome)
    }

    /// Forget the caller `id` after the engine refused its command
    fn withdraw(&mut self, sid: &TrackSid, id: u64) {
        if let Some(waiters) = self.unpublishes.get_mut(sid) {
            waiters.retain(|waiter| waiter.id != id);
            if waiters.is_empty() {
                self.unpublishes.remove(sid);
            }
        }
        if let Some(waiters) = self.enables.get_mut(sid) {
            waiters.retain(|(_, waiter)| waiter.id != id);
            if waiters.is_empty() {
                self.enables.remove(sid);
            }
        }
    }

    /// The oldest caller waiting for `sid` to become `enabled`
    fn take_enable(&mut self, sid: &TrackSid, enabled: bool) -> Option<Waiter> {
        let waiters = self.enables.get_mut(sid)?;
        let index = waiters.iter().position(|(wanted, _)| *wanted == enabled)?;
        let (_, waiter) = waiters.remove(index);
        if waiters.is_empty() {
            self.enables.remove(sid);
        }
        Some(waiter)
    }

    /// Every caller waiting on `sid`: unpublishes first, then enables
    fn take_track(&mut self, sid: &TrackSid) -> (Vec<Waiter>, Vec<Waiter>) {
        let unpublishes = self.unpublishes.remove(sid).unwrap_or_default();
        let enables = self
            .enables
            .remove(sid)
            .unwrap_or_default()
            .into_iter()
            .map(|(_, waiter)| waiter)
            .collect();
        (unpublishes, enables)
    }

    fn fail_all(self, err: &Error) -> usize {
        let mut failed = 0;
        for (_, reply) in self.publishes {
            let _ = reply.send(Err(err.clone()));
            failed += 1;
        }
        let waiters = self
            .unpublishes
            .into_values()
            .flatten()
            .chain(self.enables.into_values().flatten().map(|(_, waiter)| waiter));
        for waiter in waiters {
            waiter.resolve(Err(err.clone()));
            failed += 1;
        }
        failed
    }
}

struct RoomInner {
    session_id: String,
    session: SessionHandle,
    engine: Arc<dyn MediaEngine>,
    reconciler: Reconciler,
    config: SessionConfig,
    model: RwLock<SessionModel>,
    pending: Mutex<PendingCommands>,
    registration: ListenerRegistration,
    disconnect_requested: AtomicBool,
    snapshot_tx: watch::Sender<RoomSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    weak_self: Weak<RoomInner>,
}

/// Handle to one room session. Clones share the session; it is torn down
/// when the last handle goes away or on [`Room::disconnect`].
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl Room {
    /// Ask the engine to connect and start draining its events.
    ///
    /// Returns immediately in `Connecting`; use [`Room::connected`] to wait
    /// for the outcome. Must be called from within a tokio runtime.
    pub fn new(engine: Arc<dyn MediaEngine>, options: &ConnectOptions, config: SessionConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::InvalidState("a room needs a running tokio runtime".to_string()))?;

        let session_id = generate_session_id();
        let (events_in, events_out) = mpsc::unbounded_channel();
        let session = engine
            .connect(options, events_in)
            .map_err(|err| Error::ConnectionFailure(err.to_string()))?;

        let name = options.room_name.clone().unwrap_or_default();
        let (snapshot_tx, _) = watch::channel(RoomSnapshot::connecting(name.clone()));
        let (events_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let cancel = CancellationToken::new();

        let inner = Arc::new_cyclic(|weak_self| RoomInner {
            session_id: session_id.clone(),
            session,
            engine: Arc::clone(&engine),
            reconciler: Reconciler::new(Arc::clone(&engine)),
            config,
            model: RwLock::new(SessionModel::new(name.clone())),
            pending: Mutex::new(PendingCommands::default()),
            registration: ListenerRegistration::new(Arc::clone(&engine), session),
            disconnect_requested: AtomicBool::new(false),
            snapshot_tx,
            events_tx,
            cancel: cancel.clone(),
            weak_self: weak_self.clone(),
        });

        runtime.spawn(
            run_event_loop(Arc::downgrade(&inner), events_out, cancel)
                .instrument(info_span!("room_session", session_id = %session_id)),
        );

        info!(
            session_id = %session_id,
            session = %session,
            room_name = %name,
            "Room connecting"
        );

        Ok(Self { inner })
    }

    /// Connect and wait until the room is connected or has failed
    pub async fn connect(engine: Arc<dyn MediaEngine>, options: &ConnectOptions, config: SessionConfig) -> Result<Self> {
        let room = Self::new(engine, options, config)?;
        room.connected().await?;
        Ok(room)
    }

    /// Wait for the pending connect to settle.
    ///
    /// Resolves to `ConnectionFailure` if the engine reports a failure, the
    /// room is disconnected first, or the configured connect timeout passes.
    pub async fn connected(&self) -> Result<()> {
        let mut updates = self.inner.snapshot_tx.subscribe();
        let settled = async {
            updates
                .wait_for(|snapshot| snapshot.state != RoomState::Connecting)
                .await
                .map(|_| ())
        };

        let timed_out = match self.inner.config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, settled).await.is_err(),
            None => {
                let _ = settled.await;
                false
            }
        };
        if timed_out {
            self.inner.fail_connect("timed out waiting for the room to connect");
        }

        let model = self.inner.model.read();
        match model.state {
            RoomState::Connected | RoomState::Reconnecting => Ok(()),
            RoomState::Disconnected => Err(Error::ConnectionFailure(
                model
                    .failure
                    .clone()
                    .unwrap_or_else(|| "room disconnected".to_string()),
            )),
            RoomState::Connecting => Err(Error::ConnectionFailure(
                "room connect was abandoned".to_string(),
            )),
        }
    }

    /// Leave the room. Safe to call any number of times.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    #[must_use]
    pub fn session(&self) -> SessionHandle {
        self.inner.session
    }

    #[must_use]
    pub fn state(&self) -> RoomState {
        self.inner.model.read().state
    }

    #[must_use]
    pub fn sid(&self) -> Option<RoomSid> {
        self.inner.model.read().sid.clone()
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.inner.model.read().name.clone()
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.inner.model.read().is_recording
    }

    #[must_use]
    pub fn dominant_speaker(&self) -> Option<ParticipantSid> {
        self.inner.model.read().dominant_speaker.clone()
    }

    /// Current state of the whole tree
    #[must_use]
    pub fn snapshot(&self) -> RoomSnapshot {
        self.inner.model.read().snapshot()
    }

    /// Receive a new snapshot after every applied event
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Receive every native event that was applied
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    #[must_use]
    pub fn local_participant(&self) -> Option<LocalParticipantHandle> {
        let model = self.inner.model.read();
        let local = model.local.as_ref()?;
        Some(LocalParticipantHandle {
            room: Arc::clone(&self.inner),
            sid: local.sid().clone(),
            identity: local.identity().to_string(),
        })
    }

    #[must_use]
    pub fn remote_participants(&self) -> Vec<RemoteParticipant> {
        self.inner.model.read().remotes.values().cloned().collect()
    }

    #[must_use]
    pub fn remote_participant(&self, sid: &ParticipantSid) -> Option<RemoteParticipant> {
        self.inner.model.read().remotes.get(sid).cloned()
    }

    /// The subscribed remote track published under `track_sid`
    #[must_use]
    pub fn find_remote_track(&self, track_sid: &TrackSid) -> Option<Track> {
        self.inner
            .model
            .read()
            .remotes
            .values()
            .find_map(|remote| remote.subscribed_track(track_sid))
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("session_id", &self.inner.session_id)
            .field("session", &self.inner.session)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RoomInner {
    /// Reconcile one event, run its effects and publish the result
    fn dispatch(&self, event: SessionEvent) {
        let event_type = event.event_type();
        let effects = {
            let mut model = self.model.write();
            match self.reconciler.apply(&mut model, &event) {
                Ok(effects) => effects,
                Err(err) => {
                    warn!(
                        session_id = %self.session_id,
                        event_type,
                        participant_sid = ?event.participant_sid(),
                        error = %err,
                        "Dropping stale event"
                    );
                    return;
                }
            }
        };

        debug!(session_id = %self.session_id, event_type, effects = effects.len(), "Event applied");
        self.run_effects(effects);
        self.publish_snapshot();
        let _ = self.events_tx.send(event);
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::EndTrack(track) => {
                    track.end();
                }
                Effect::ObserveTrack(track) => track.observe(self.observer()),
                Effect::ResolvePublish { name, result } => {
                    let reply = self.pending.lock().publishes.remove(&name);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => debug!(session_id = %self.session_id, track_name = %name, "No caller waiting for publish"),
                    }
                }
                Effect::ResolveUnpublish { sid } => {
                    let (unpublished, enables) = self.pending.lock().take_track(&sid);
                    for waiter in unpublished {
                        waiter.resolve(Ok(()));
                    }
                    for waiter in enables {
                        waiter.resolve(Err(Error::InvalidState(format!(
                            "track {sid} was unpublished before the change was confirmed"
                        ))));
                    }
                }
                Effect::ResolveEnabled { sid, enabled } => {
                    let waiter = self.pending.lock().take_enable(&sid, enabled);
                    match waiter {
                        Some(waiter) => waiter.resolve(Ok(())),
                        None => debug!(session_id = %self.session_id, track_sid = %sid, enabled, "No caller waiting for enabled state"),
                    }
                }
                Effect::UnpublishTrack { name } => {
                    if let Err(err) = self.engine.unpublish_track(self.session, &name) {
                        warn!(
                            session_id = %self.session_id,
                            track_name = %name,
                            error = %err,
                            "Failed to unpublish ended track"
                        );
                    }
                }
                Effect::ReleaseSession => self.release_session(),
            }
        }
    }

    fn release_session(&self) {
        self.registration.release();
        self.cancel.cancel();
        let pending = std::mem::take(&mut *self.pending.lock());
        let failed = pending.fail_all(&Error::Disconnected);
        info!(
            session_id = %self.session_id,
            session = %self.session,
            failed_commands = failed,
            "Session released"
        );
    }

    fn publish_snapshot(&self) {
        let snapshot = self.model.read().snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if snapshot.version < current.version || *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn observer(&self) -> Weak<dyn TrackObserver> {
        self.weak_self.clone()
    }

    fn disconnect(&self) {
        if self.model.read().state == RoomState::Disconnected {
            debug!(session_id = %self.session_id, "Room already disconnected");
            return;
        }
        if !self.disconnect_requested.swap(true, Ordering::AcqRel) {
            self.engine.disconnect(self.session);
        }
        self.dispatch(SessionEvent::Disconnected { reason: None });
    }

    fn fail_connect(&self, reason: &str) {
        if self.model.read().state != RoomState::Connecting {
            return;
        }
        warn!(session_id = %self.session_id, reason, "Abandoning room connect");
        if !self.disconnect_requested.swap(true, Ordering::AcqRel) {
            self.engine.disconnect(self.session);
        }
        self.dispatch(SessionEvent::ConnectFailed {
            reason: reason.to_string(),
        });
    }

    fn begin_publish(
        &self,
        track: &Track,
        priority: TrackPriority,
    ) -> Result<oneshot::Receiver<Result<LocalTrackPublication>>> {
        if !track.is_local() {
            return Err(Error::InvalidState(format!(
                "only local tracks can be published, {} is remote",
                track.name()
            )));
        }
        if track.is_ended() {
            return Err(Error::InvalidState(format!("track {} has ended", track.name())));
        }

        let (reply, outcome) = oneshot::channel();
        {
            let mut model = self.model.write();
            if !model.state.is_live() {
                return Err(Error::InvalidState(format!("room is {}", model.state)));
            }
            if let Some(sid) = track.sid() {
                return Err(Error::InvalidState(format!(
                    "track {} is already published as {sid}",
                    track.name()
                )));
            }
            if model.publishing.contains_key(track.name()) {
                return Err(Error::InvalidState(format!(
                    "track {} is already being published",
                    track.name()
                )));
            }
            model.publishing.insert(track.name().to_string(), track.clone());
            self.pending.lock().publishes.insert(track.name().to_string(), reply);
        }
        track.observe(self.observer());

        if let Err(err) = self
            .engine
            .publish_track(self.session, track.name(), track.kind(), priority)
        {
            self.model.write().publishing.shift_remove(track.name());
            self.pending.lock().publishes.remove(track.name());
            warn!(session_id = %self.session_id, track_name = track.name(), error = %err, "Publish rejected");
            return Err(err.into());
        }

        info!(
            session_id = %self.session_id,
            track_name = track.name(),
            kind = %track.kind(),
            priority = %priority,
            "Publishing local track"
        );
        Ok(outcome)
    }

    fn begin_unpublish(&self, track: &Track) -> Result<CommandOutcome> {
        let (sid, id, outcome) = {
            let model = self.model.read();
            if !model.state.is_live() {
                return Err(Error::InvalidState(format!("room is {}", model.state)));
            }
            let Some(publication) = model
                .local
                .as_ref()
                .and_then(|local| local.publication_of(track))
            else {
                return Err(Error::InvalidState(format!(
                    "track {} is not published",
                    track.name()
                )));
            };
            let sid = publication.track_sid().clone();
            let (id, outcome) = self.pending.lock().add_unpublish(sid.clone());
            (sid, id, outcome)
        };

        if let Err(err) = self.engine.unpublish_track(self.session, track.name()) {
            self.pending.lock().withdraw(&sid, id);
            warn!(session_id = %self.session_id, track_sid = %sid, error = %err, "Unpublish rejected");
            return Err(err.into());
        }

        info!(session_id = %self.session_id, track_sid = %sid, track_name = track.name(), "Unpublishing local track");
        Ok(outcome)
    }

    /// Ask the engine to enable or disable a published local track.
    /// `None` if the track is not published in this room.
    fn begin_set_enabled(&self, track: &Track, enabled: bool) -> Option<Result<CommandOutcome>> {
        let (sid, id, outcome) = {
            let model = self.model.read();
            if !model.state.is_live() {
                return None;
            }
            let sid = model.local.as_ref()?.publication_of(track)?.track_sid().clone();
            let (id, outcome) = self.pending.lock().add_enable(sid.clone(), enabled);
            (sid, id, outcome)
        };

        if let Err(err) = self.engine.set_track_enabled(track.name(), enabled) {
            self.pending.lock().withdraw(&sid, id);
            warn!(session_id = %self.session_id, track_sid = %sid, enabled, error = %err, "Enable request rejected");
            return Some(Err(err.into()));
        }

        debug!(session_id = %self.session_id, track_sid = %sid, enabled, "Requested local track enabled state");
        Some(Ok(outcome))
    }
}

impl TrackObserver for RoomInner {
    fn track_ended(&self, track: &Track) {
        if track.is_local() {
            let (published, pending) = {
                let model = self.model.read();
                (
                    model.state.is_live() && model.mirrors(track),
                    model
                        .publishing
                        .get(track.name())
                        .is_some_and(|pending| pending.same_track(track)),
                )
            };
            if pending {
                debug!(
                    session_id = %self.session_id,
                    track_name = track.name(),
                    "Track ended with its publish pending, unpublishing once confirmed"
                );
            }
            if published {
                if let Err(err) = self.engine.unpublish_track(self.session, track.name()) {
                    warn!(
                        session_id = %self.session_id,
                        track_name = track.name(),
                        error = %err,
                        "Failed to unpublish ended track"
                    );
                }
            }
            return;
        }

        let released = {
            let mut model = self.model.write();
            let owned = model.tracks.len();
            model.tracks.retain(|_, held| !held.same_track(track));
            let dropped = model.tracks.len() != owned;
            let unsubscribed = model
                .remotes
                .values_mut()
                .any(|remote| remote.release_track(track));
            if dropped || unsubscribed {
                model.version += 1;
            }
            dropped || unsubscribed
        };
        if released {
            debug!(session_id = %self.session_id, track_name = track.name(), "Ended remote track released");
            self.publish_snapshot();
        }
    }

    fn track_changed(&self, track: &Track) {
        let mirrored = {
            let mut model = self.model.write();
            let mirrored = model.mirrors(track);
            if mirrored {
                model.version += 1;
            }
            mirrored
        };
        if mirrored {
            debug!(session_id = %self.session_id, track_name = track.name(), "Track changed outside the event stream");
            self.publish_snapshot();
        }
    }

    fn request_enabled(&self, track: &Track, enabled: bool) -> Option<Result<EnableOutcome>> {
        self.begin_set_enabled(track, enabled)
    }
}

impl Drop for RoomInner {
    fn drop(&mut self) {
        if self.model.get_mut().state != RoomState::Disconnected {
            self.disconnect();
        }
        self.cancel.cancel();
    }
}

/// Drains the engine's event queue into the room, one event at a time
async fn run_event_loop(
    room: Weak<RoomInner>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(room) = room.upgrade() else {
                    break;
                };
                room.dispatch(event);
            }
        }
    }
    debug!("Session event loop stopped");
}

/// Command surface of the local participant.
///
/// Holds the room alive while it exists.
#[derive(Clone)]
pub struct LocalParticipantHandle {
    room: Arc<RoomInner>,
    sid: ParticipantSid,
    identity: String,
}

impl LocalParticipantHandle {
    #[must_use]
    pub fn sid(&self) -> &ParticipantSid {
        &self.sid
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<ParticipantSnapshot> {
        self.room
            .model
            .read()
            .local
            .as_ref()
            .map(|local| local.snapshot())
    }

    #[must_use]
    pub fn publications(&self) -> Vec<LocalTrackPublication> {
        self.room
            .model
            .read()
            .local
            .as_ref()
            .map(|local| local.publications().cloned().collect())
            .unwrap_or_default()
    }

    /// Publish `track` at standard priority
    pub async fn publish(&self, track: &Track) -> Result<LocalTrackPublication> {
        self.publish_with_priority(track, TrackPriority::Standard).await
    }

    /// Publish `track` and wait for the engine to confirm or refuse it
    pub async fn publish_with_priority(
        &self,
        track: &Track,
        priority: TrackPriority,
    ) -> Result<LocalTrackPublication> {
        let outcome = self.room.begin_publish(track, priority)?;
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Unpublish `track` and wait for the engine to confirm it
    pub async fn unpublish(&self, track: &Track) -> Result<()> {
        let outcome = self.room.begin_unpublish(track)?;
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected),
        }
    }
}

impl std::fmt::Debug for LocalParticipantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalParticipantHandle")
            .field("sid", &self.sid)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
