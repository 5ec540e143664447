// Integration tests for room session synchronization
//
// Drives a Room through the loopback engine and checks the mirrored state:
// - participant and track lifecycle across join, subscribe and leave
// - publish confirmation and publish failure
// - surface rebinding without cross-talk
// - disconnect idempotency and disconnect during connect
// - enable changes, unpublish and out-of-band changes reaching snapshots

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use roomsync_core::engine::loopback::{EngineCommand, LoopbackEngine};
use roomsync_core::{
    ConnectOptions, Error, FrameRenderer, ParticipantEvent, ParticipantInfo, ParticipantSid,
    PublicationInfo, Room, RoomSid, RoomSnapshot, RoomState, SessionConfig, SessionEvent,
    SubscriptionState, Track, TrackKind, TrackPriority, TrackSid, TrackState, VideoFrame,
    VideoSurface,
};

const WAIT: Duration = Duration::from_secs(5);

fn participant(sid: &str, identity: &str) -> ParticipantInfo {
    ParticipantInfo {
        sid: ParticipantSid::from(sid),
        identity: identity.to_string(),
        network_quality_level: Default::default(),
        publications: Vec::new(),
    }
}

fn room_connected(remotes: Vec<ParticipantInfo>) -> SessionEvent {
    SessionEvent::RoomConnected {
        room_sid: RoomSid::from("RM1"),
        room_name: "standup".to_string(),
        local_participant: participant("PA1", "alice"),
        remote_participants: remotes,
        is_recording: false,
    }
}

fn published(participant_sid: &str, track_sid: &str, name: &str, kind: TrackKind) -> SessionEvent {
    SessionEvent::participant(
        participant_sid,
        ParticipantEvent::TrackPublished {
            publication: PublicationInfo {
                track_sid: TrackSid::from(track_sid),
                track_name: name.to_string(),
                kind,
                priority: TrackPriority::Standard,
                is_track_enabled: true,
            },
        },
    )
}

fn subscribed(participant_sid: &str, track_sid: &str) -> SessionEvent {
    SessionEvent::participant(
        participant_sid,
        ParticipantEvent::TrackSubscribed {
            track_sid: TrackSid::from(track_sid),
        },
    )
}

async fn connected_room(engine: &Arc<LoopbackEngine>, remotes: Vec<ParticipantInfo>) -> Room {
    let options = ConnectOptions {
        room_name: Some("standup".to_string()),
        ..ConnectOptions::default()
    };
    let room = Room::new(engine.clone(), &options, SessionConfig::default()).unwrap();
    engine.emit(room_connected(remotes));
    room.connected().await.unwrap();
    room
}

/// Emit `event` and wait until the room has applied it
async fn apply(engine: &LoopbackEngine, room: &Room, event: SessionEvent) {
    let mut events = room.events();
    assert!(engine.emit(event.clone()));
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(applied) if applied == event => break,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("event was not applied");
}

async fn wait_for_snapshot(room: &Room, predicate: impl FnMut(&RoomSnapshot) -> bool) -> RoomSnapshot {
    let mut updates = room.subscribe();
    let snapshot = tokio::time::timeout(WAIT, updates.wait_for(predicate))
        .await
        .expect("snapshot condition not reached")
        .expect("room dropped")
        .clone();
    snapshot
}

fn assert_subscription_invariant(room: &Room) {
    for remote in room.remote_participants() {
        for publication in remote.publications() {
            assert_eq!(
                publication.is_track_subscribed(),
                publication.remote_track().is_some()
            );
        }
    }
    let snapshot = room.snapshot();
    for remote in &snapshot.remote_participants {
        for publication in remote.publications() {
            let subscribed = publication.subscription == Some(SubscriptionState::Subscribed);
            assert_eq!(subscribed, publication.track.is_some());
        }
    }
}

#[derive(Default)]
struct FrameLog {
    sources: Mutex<Vec<Option<TrackSid>>>,
}

impl FrameRenderer for FrameLog {
    fn render(&self, source: &Track, _frame: &VideoFrame) {
        self.sources.lock().push(source.sid());
    }
}

fn frame() -> VideoFrame {
    VideoFrame {
        width: 320,
        height: 240,
        timestamp_us: 0,
        data: Bytes::from_static(b"frame"),
    }
}

#[tokio::test]
async fn test_participant_leaving_ends_subscribed_track() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, Vec::new()).await;

    apply(
        &engine,
        &room,
        SessionEvent::ParticipantConnected {
            participant: participant("P1", "bob"),
        },
    )
    .await;
    apply(&engine, &room, published("P1", "T1", "camera", TrackKind::Video)).await;
    apply(&engine, &room, subscribed("P1", "T1")).await;
    assert_subscription_invariant(&room);

    let track = room.find_remote_track(&TrackSid::from("T1")).unwrap();
    assert_eq!(track.state(), TrackState::Enabled);
    let surface = VideoSurface::new(Arc::new(FrameLog::default()));
    surface.bind(Some(&track)).unwrap();
    assert_eq!(engine.sinks(&track.native_ref()), vec![surface.id()]);

    apply(
        &engine,
        &room,
        SessionEvent::ParticipantDisconnected {
            participant_sid: ParticipantSid::from("P1"),
        },
    )
    .await;

    assert!(room.remote_participants().is_empty());
    assert!(room.snapshot().remote_participants.is_empty());
    assert_eq!(track.state(), TrackState::Ended);
    assert!(!surface.is_bound());
    assert_eq!(track.bound_surface_count(), 0);
    assert!(engine.sinks(&track.native_ref()).is_empty());
    assert!(room.find_remote_track(&TrackSid::from("T1")).is_none());
}

#[tokio::test]
async fn test_publication_failure_leaves_collection_unchanged() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, Vec::new()).await;
    let local = room.local_participant().unwrap();
    let mic = Track::create_local(engine.clone(), "mic", TrackKind::Audio, true).unwrap();

    let publishing = {
        let local = local.clone();
        let mic = mic.clone();
        tokio::spawn(async move { local.publish(&mic).await })
    };
    tokio::time::timeout(WAIT, async {
        while !engine
            .commands()
            .iter()
            .any(|c| matches!(c, EngineCommand::Publish { name, .. } if name == "mic"))
        {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    engine.emit(SessionEvent::participant(
        "PA1",
        ParticipantEvent::TrackPublicationFailed {
            track_name: "mic".to_string(),
            reason: "publisher quota exceeded".to_string(),
        },
    ));

    let outcome = tokio::time::timeout(WAIT, publishing).await.unwrap().unwrap();
    match outcome {
        Err(err @ Error::SubscriptionFailure { .. }) => {
            assert_eq!(err.class(), roomsync_core::ErrorClass::Subscription);
        }
        other => panic!("expected a subscription failure, got {other:?}"),
    }
    assert!(local.publications().is_empty());
    assert_eq!(local.snapshot().unwrap().audio_tracks.len(), 0);
    assert_eq!(mic.sid(), None);
    assert_eq!(mic.state(), TrackState::Enabled);
}

#[tokio::test]
async fn test_publish_confirmed_through_event_path() {
    let engine = LoopbackEngine::with_auto_confirm();
    let room = connected_room(&engine, Vec::new()).await;
    let local = room.local_participant().unwrap();
    let camera = Track::create_local(engine.clone(), "camera", TrackKind::Video, true).unwrap();

    let mut events = room.events();
    let publication = local
        .publish_with_priority(&camera, TrackPriority::High)
        .await
        .unwrap();

    let applied = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(applied.event_type(), "track_published");
    assert_eq!(camera.sid().as_ref(), Some(roomsync_core::Publication::track_sid(&publication)));

    let snapshot = wait_for_snapshot(&room, |s| {
        s.local_participant
            .as_ref()
            .is_some_and(|p| p.video_tracks.len() == 1)
    })
    .await;
    let local_snapshot = snapshot.local_participant.unwrap();
    assert_eq!(local_snapshot.video_tracks[0].priority, TrackPriority::High);
    assert_eq!(local_snapshot.video_tracks[0].subscription, None);
}

#[tokio::test]
async fn test_rebinding_surface_between_tracks() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, vec![participant("P2", "carol")]).await;
    apply(&engine, &room, published("P2", "TA", "camera", TrackKind::Video)).await;
    apply(&engine, &room, published("P2", "TB", "screen", TrackKind::Video)).await;
    apply(&engine, &room, subscribed("P2", "TA")).await;
    apply(&engine, &room, subscribed("P2", "TB")).await;

    let track_a = room.find_remote_track(&TrackSid::from("TA")).unwrap();
    let track_b = room.find_remote_track(&TrackSid::from("TB")).unwrap();
    let log = Arc::new(FrameLog::default());
    let surface = VideoSurface::new(log.clone());

    surface.bind(Some(&track_a)).unwrap();
    assert_eq!(track_a.render_frame(&frame()), 1);

    surface.bind(Some(&track_b)).unwrap();
    assert!(surface.bound_track().unwrap().same_track(&track_b));
    assert_eq!(track_a.bound_surface_count(), 0);
    assert_eq!(track_b.bound_surface_count(), 1);

    assert_eq!(track_a.render_frame(&frame()), 0);
    assert_eq!(track_b.render_frame(&frame()), 1);
    assert_eq!(
        *log.sources.lock(),
        vec![Some(TrackSid::from("TA")), Some(TrackSid::from("TB"))]
    );

    let snapshot = room.snapshot();
    let carol = snapshot.remote_participant(&ParticipantSid::from("P2")).unwrap();
    let sinks: Vec<usize> = carol
        .video_tracks
        .iter()
        .map(|p| p.track.as_ref().map_or(0, |t| t.bound_surfaces))
        .collect();
    assert_eq!(sinks, vec![0, 1]);
}

#[tokio::test]
async fn test_subscription_lifecycle_keeps_invariant() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, vec![participant("P2", "carol")]).await;

    let steps = vec![
        published("P2", "T1", "mic", TrackKind::Audio),
        subscribed("P2", "T1"),
        SessionEvent::participant(
            "P2",
            ParticipantEvent::TrackDisabled {
                track_sid: TrackSid::from("T1"),
            },
        ),
        SessionEvent::participant(
            "P2",
            ParticipantEvent::TrackUnsubscribed {
                track_sid: TrackSid::from("T1"),
            },
        ),
        SessionEvent::participant(
            "P2",
            ParticipantEvent::TrackSubscriptionFailed {
                track_sid: TrackSid::from("T1"),
                reason: "codec unsupported".to_string(),
            },
        ),
        subscribed("P2", "T1"),
    ];
    for step in steps {
        apply(&engine, &room, step).await;
        assert_subscription_invariant(&room);
    }

    let carol = room.remote_participant(&ParticipantSid::from("P2")).unwrap();
    let publication = carol.publication(&TrackSid::from("T1")).unwrap();
    assert!(publication.is_track_subscribed());
    assert!(!publication.is_track_enabled());
    assert!(!publication.remote_track().unwrap().is_enabled());
}

#[tokio::test]
async fn test_failed_subscription_is_observable() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, vec![participant("P2", "carol")]).await;
    apply(&engine, &room, published("P2", "T1", "camera", TrackKind::Video)).await;
    apply(&engine, &room, published("P2", "T2", "screen", TrackKind::Video)).await;
    apply(
        &engine,
        &room,
        SessionEvent::participant(
            "P2",
            ParticipantEvent::TrackSubscriptionFailed {
                track_sid: TrackSid::from("T1"),
                reason: "codec unsupported".to_string(),
            },
        ),
    )
    .await;

    let snapshot = room.snapshot();
    let carol = snapshot.remote_participant(&ParticipantSid::from("P2")).unwrap();
    assert_eq!(
        carol.publication(&TrackSid::from("T1")).unwrap().subscription,
        Some(SubscriptionState::Failed {
            reason: "codec unsupported".to_string()
        })
    );
    assert_eq!(
        carol.publication(&TrackSid::from("T2")).unwrap().subscription,
        Some(SubscriptionState::Unsubscribed)
    );
    assert_eq!(room.state(), RoomState::Connected);
}

#[tokio::test]
async fn test_unknown_track_events_are_dropped() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, vec![participant("P2", "carol")]).await;
    let before = room.snapshot();

    engine.emit(subscribed("P2", "T404"));
    engine.emit(SessionEvent::ParticipantDisconnected {
        participant_sid: ParticipantSid::from("P404"),
    });
    apply(&engine, &room, SessionEvent::RecordingStarted).await;

    let after = room.snapshot();
    assert_eq!(after.version, before.version + 1);
    assert!(after.is_recording);
    assert_eq!(after.remote_participants, before.remote_participants);
}

#[tokio::test]
async fn test_disconnect_twice_is_same_as_once() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, vec![participant("P2", "carol")]).await;
    apply(&engine, &room, published("P2", "T1", "camera", TrackKind::Video)).await;
    apply(&engine, &room, subscribed("P2", "T1")).await;
    let track = room.find_remote_track(&TrackSid::from("T1")).unwrap();

    room.disconnect();
    room.disconnect();

    assert_eq!(room.state(), RoomState::Disconnected);
    assert!(room.remote_participants().is_empty());
    assert!(room.local_participant().is_none());
    assert_eq!(track.state(), TrackState::Ended);
    assert_eq!(engine.listener_count(), 0);

    let commands = engine.commands();
    let disconnects = commands
        .iter()
        .filter(|c| matches!(c, EngineCommand::Disconnect(_)))
        .count();
    let removals = commands
        .iter()
        .filter(|c| matches!(c, EngineCommand::RemoveListener(_)))
        .count();
    assert_eq!((disconnects, removals), (1, 1));

    let snapshot = room.snapshot();
    assert!(snapshot.local_participant.is_none());
    assert!(snapshot.remote_participants.is_empty());
    assert!(snapshot.failure.is_none());
}

#[tokio::test]
async fn test_disconnect_during_connect_fails_pending_connect() {
    let engine = LoopbackEngine::new();
    let room = Room::new(engine.clone(), &ConnectOptions::default(), SessionConfig::default()).unwrap();

    let waiter = {
        let room = room.clone();
        tokio::spawn(async move { room.connected().await })
    };
    tokio::task::yield_now().await;
    room.disconnect();

    let outcome = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::ConnectionFailure(_))));
    assert_eq!(room.state(), RoomState::Disconnected);

    // a late confirmation must not resurrect the room
    engine.emit_to(room.session(), room_connected(Vec::new()));
    tokio::task::yield_now().await;
    assert_eq!(room.state(), RoomState::Disconnected);
    assert!(room.local_participant().is_none());
}

#[tokio::test]
async fn test_connect_failure_is_terminal() {
    let engine = LoopbackEngine::new();
    let room = Room::new(engine.clone(), &ConnectOptions::default(), SessionConfig::default()).unwrap();
    engine.emit(SessionEvent::ConnectFailed {
        reason: "access token expired".to_string(),
    });

    match room.connected().await {
        Err(Error::ConnectionFailure(reason)) => assert_eq!(reason, "access token expired"),
        other => panic!("expected a connection failure, got {other:?}"),
    }
    assert!(room.remote_participants().is_empty());
    assert!(room.local_participant().is_none());
    assert_eq!(engine.listener_count(), 0);
}

#[tokio::test]
async fn test_reconnecting_keeps_participants() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, vec![participant("P2", "carol")]).await;

    apply(&engine, &room, SessionEvent::Reconnecting { reason: Some("network lost".to_string()) }).await;
    assert_eq!(room.state(), RoomState::Reconnecting);
    assert_eq!(room.remote_participants().len(), 1);

    apply(&engine, &room, SessionEvent::Reconnected).await;
    assert_eq!(room.state(), RoomState::Connected);

    apply(
        &engine,
        &room,
        SessionEvent::DominantSpeakerChanged {
            participant_sid: Some(ParticipantSid::from("P2")),
        },
    )
    .await;
    assert_eq!(room.dominant_speaker(), Some(ParticipantSid::from("P2")));
    let tree = room.snapshot().render_tree();
    assert!(tree.contains("dominant speaker: P2"));
    assert!(tree.contains("remote participant carol (P2)"));
}

async fn wait_for_command(engine: &LoopbackEngine, mut sent: impl FnMut(&EngineCommand) -> bool) {
    tokio::time::timeout(WAIT, async {
        while !engine.commands().iter().any(&mut sent) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("engine never received the command");
}

#[tokio::test]
async fn test_disabling_published_track_updates_publication_and_track() {
    let engine = LoopbackEngine::with_auto_confirm();
    let room = connected_room(&engine, Vec::new()).await;
    let local = room.local_participant().unwrap();
    let camera = Track::create_local(engine.clone(), "camera", TrackKind::Video, true).unwrap();
    let publication = local.publish(&camera).await.unwrap();
    let sid = roomsync_core::Publication::track_sid(&publication).clone();
    let before = room.snapshot().version;

    camera.set_enabled(false).await.unwrap();
    assert!(!camera.is_enabled());

    let snapshot = wait_for_snapshot(&room, |s| s.version > before).await;
    let video = &snapshot.local_participant.unwrap().video_tracks[0];
    assert!(!video.is_track_enabled);
    assert_eq!(video.track.as_ref().unwrap().state, TrackState::Disabled);

    // The engine may also report a change nobody asked for
    apply(
        &engine,
        &room,
        SessionEvent::participant("PA1", ParticipantEvent::TrackEnabled { track_sid: sid }),
    )
    .await;
    assert!(camera.is_enabled());
    let video = &room.snapshot().local_participant.unwrap().video_tracks[0];
    assert!(video.is_track_enabled);
    assert_eq!(video.track.as_ref().unwrap().state, TrackState::Enabled);
}

#[tokio::test]
async fn test_enable_waits_for_confirming_event() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, Vec::new()).await;
    let local = room.local_participant().unwrap();
    let mic = Track::create_local(engine.clone(), "mic", TrackKind::Audio, true).unwrap();

    let publishing = {
        let (local, mic) = (local.clone(), mic.clone());
        tokio::spawn(async move { local.publish(&mic).await })
    };
    wait_for_command(&engine, |c| matches!(c, EngineCommand::Publish { .. })).await;
    apply(&engine, &room, published("PA1", "MT1", "mic", TrackKind::Audio)).await;
    publishing.await.unwrap().unwrap();

    let disabling = {
        let mic = mic.clone();
        tokio::spawn(async move { mic.set_enabled(false).await })
    };
    wait_for_command(&engine, |c| {
        matches!(c, EngineCommand::SetTrackEnabled { enabled: false, .. })
    })
    .await;
    assert!(!disabling.is_finished());
    assert!(mic.is_enabled());
    assert!(room.snapshot().local_participant.unwrap().audio_tracks[0].is_track_enabled);

    apply(
        &engine,
        &room,
        SessionEvent::participant(
            "PA1",
            ParticipantEvent::TrackDisabled {
                track_sid: TrackSid::from("MT1"),
            },
        ),
    )
    .await;
    tokio::time::timeout(WAIT, disabling).await.unwrap().unwrap().unwrap();
    assert!(!mic.is_enabled());
    assert!(!room.snapshot().local_participant.unwrap().audio_tracks[0].is_track_enabled);
}

#[tokio::test]
async fn test_destroying_track_with_publish_pending() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, Vec::new()).await;
    let local = room.local_participant().unwrap();
    let camera = Track::create_local(engine.clone(), "camera", TrackKind::Video, true).unwrap();

    let publishing = {
        let (local, camera) = (local.clone(), camera.clone());
        tokio::spawn(async move { local.publish(&camera).await })
    };
    wait_for_command(&engine, |c| matches!(c, EngineCommand::Publish { .. })).await;

    camera.destroy();
    apply(&engine, &room, published("PA1", "MT1", "camera", TrackKind::Video)).await;

    let outcome = tokio::time::timeout(WAIT, publishing).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::InvalidState(_))));
    assert_eq!(camera.state(), TrackState::Ended);
    assert_eq!(camera.sid(), None);
    assert!(local.publications().is_empty());
    assert!(engine
        .commands()
        .iter()
        .any(|c| matches!(c, EngineCommand::Unpublish { name, .. } if name == "camera")));
}

#[tokio::test]
async fn test_out_of_band_track_changes_reach_subscribers() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, vec![participant("P2", "carol")]).await;
    apply(&engine, &room, published("P2", "TA", "mic", TrackKind::Audio)).await;
    apply(&engine, &room, published("P2", "TV", "camera", TrackKind::Video)).await;
    apply(&engine, &room, subscribed("P2", "TA")).await;
    apply(&engine, &room, subscribed("P2", "TV")).await;

    let carol_track = |s: &RoomSnapshot, sid: &str| {
        s.remote_participant(&ParticipantSid::from("P2"))
            .and_then(|p| p.publication(&TrackSid::from(sid)))
            .and_then(|p| p.track.clone())
    };

    let mic = room.find_remote_track(&TrackSid::from("TA")).unwrap();
    mic.set_playback_enabled(false).unwrap();
    wait_for_snapshot(&room, |s| {
        carol_track(s, "TA").is_some_and(|t| !t.is_playback_enabled)
    })
    .await;

    let camera = room.find_remote_track(&TrackSid::from("TV")).unwrap();
    let surface = VideoSurface::new(Arc::new(FrameLog::default()));
    surface.bind(Some(&camera)).unwrap();
    wait_for_snapshot(&room, |s| {
        carol_track(s, "TV").is_some_and(|t| t.bound_surfaces == 1)
    })
    .await;

    surface.unbind();
    wait_for_snapshot(&room, |s| {
        carol_track(s, "TV").is_some_and(|t| t.bound_surfaces == 0)
    })
    .await;
}

#[tokio::test]
async fn test_rejected_unpublish_leaves_other_caller_waiting() {
    let engine = LoopbackEngine::new();
    let room = connected_room(&engine, Vec::new()).await;
    let local = room.local_participant().unwrap();
    let mic = Track::create_local(engine.clone(), "mic", TrackKind::Audio, true).unwrap();

    let publishing = {
        let (local, mic) = (local.clone(), mic.clone());
        tokio::spawn(async move { local.publish(&mic).await })
    };
    wait_for_command(&engine, |c| matches!(c, EngineCommand::Publish { .. })).await;
    apply(&engine, &room, published("PA1", "MT1", "mic", TrackKind::Audio)).await;
    publishing.await.unwrap().unwrap();

    let first = {
        let (local, mic) = (local.clone(), mic.clone());
        tokio::spawn(async move { local.unpublish(&mic).await })
    };
    wait_for_command(&engine, |c| matches!(c, EngineCommand::Unpublish { .. })).await;

    engine.reject("unpublish_track", "busy");
    assert!(matches!(local.unpublish(&mic).await, Err(Error::Engine(_))));

    apply(
        &engine,
        &room,
        SessionEvent::participant(
            "PA1",
            ParticipantEvent::TrackUnpublished {
                track_sid: TrackSid::from("MT1"),
            },
        ),
    )
    .await;
    let outcome = tokio::time::timeout(WAIT, first).await.unwrap().unwrap();
    assert!(outcome.is_ok());
    assert!(local.publications().is_empty());
}
