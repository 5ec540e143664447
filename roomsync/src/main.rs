use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use roomsync_core::engine::loopback::LoopbackEngine;
use roomsync_core::{logging, Config, Room, SessionEvent, Track, TrackKind, TrackPriority};

/// Replay a script of native session events against a room and print the
/// mirrored state tree after every step
#[derive(Debug, Parser)]
#[command(name = "roomsync", version)]
struct Args {
    /// Configuration file (JSON, TOML or YAML)
    #[arg(short, long, env = "ROOMSYNC_CONFIG")]
    config: Option<String>,

    /// JSON-lines script; each line is a session event or a local command
    script: String,

    /// How long to wait for each step to be applied
    #[arg(long, default_value_t = 500)]
    step_timeout_ms: u64,
}

/// Commands issued by the local participant from the script
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum LocalCommand {
    CreateTrack {
        name: String,
        kind: TrackKind,
        #[serde(default = "enabled_by_default")]
        enabled: bool,
    },
    Publish {
        name: String,
        #[serde(default)]
        priority: TrackPriority,
    },
    Unpublish {
        name: String,
    },
    SetEnabled {
        name: String,
        enabled: bool,
    },
    Destroy {
        name: String,
    },
    Disconnect,
}

const fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Step {
    Command(LocalCommand),
    Event(SessionEvent),
}

struct Replay {
    engine: Arc<LoopbackEngine>,
    room: Room,
    tracks: HashMap<String, Track>,
    step_timeout: Duration,
}

impl Replay {
    async fn run_event(&self, event: SessionEvent) {
        let mut applied = self.room.events();
        let event_type = event.event_type();
        if !self.engine.emit(event) {
            warn!(event_type, "Room is no longer listening");
            return;
        }
        match tokio::time::timeout(self.step_timeout, applied.recv()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(event_type, error = %err, "Event stream closed"),
            Err(_) => warn!(event_type, "Event was not applied (stale?)"),
        }
    }

    async fn run_command(&mut self, command: LocalCommand) -> Result<()> {
        match command {
            LocalCommand::CreateTrack { name, kind, enabled } => {
                let track = Track::create_local(self.engine.clone(), name.clone(), kind, enabled)?;
                self.tracks.insert(name, track);
            }
            LocalCommand::Publish { name, priority } => {
                let track = self.track(&name)?;
                let local = self
                    .room
                    .local_participant()
                    .context("room has no local participant")?;
                let publication = tokio::time::timeout(
                    self.step_timeout,
                    local.publish_with_priority(&track, priority),
                )
                .await
                .context("publish was not confirmed in time")??;
                info!(track_name = %name, track = ?publication.track().sid(), "Published");
            }
            LocalCommand::Unpublish { name } => {
                let track = self.track(&name)?;
                let local = self
                    .room
                    .local_participant()
                    .context("room has no local participant")?;
                tokio::time::timeout(self.step_timeout, local.unpublish(&track))
                    .await
                    .context("unpublish was not confirmed in time")??;
            }
            LocalCommand::SetEnabled { name, enabled } => {
                let track = self.track(&name)?;
                tokio::time::timeout(self.step_timeout, track.set_enabled(enabled))
                    .await
                    .context("enabled state was not confirmed in time")??;
            }
            LocalCommand::Destroy { name } => {
                self.track(&name)?.destroy();
            }
            LocalCommand::Disconnect => self.room.disconnect(),
        }
        Ok(())
    }

    fn track(&self, name: &str) -> Result<Track> {
        self.tracks
            .get(name)
            .cloned()
            .with_context(|| format!("no local track named {name}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(script = %args.script, "roomsync replay starting");

    // 3. Read the script
    let script = tokio::fs::read_to_string(&args.script)
        .await
        .with_context(|| format!("failed to read {}", args.script))?;

    // 4. Connect a room over the loopback engine
    let engine = LoopbackEngine::with_auto_confirm();
    let room = Room::new(engine.clone(), &config.connect, config.session.clone())?;
    info!(session_id = room.session_id(), "Room created");

    let mut replay = Replay {
        engine,
        room,
        tracks: HashMap::new(),
        step_timeout: Duration::from_millis(args.step_timeout_ms),
    };

    // 5. Replay
    for (index, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step: Step = serde_json::from_str(line)
            .with_context(|| format!("line {}: not a session event or command", index + 1))?;

        match step {
            Step::Event(event) => replay.run_event(event).await,
            Step::Command(command) => {
                if let Err(err) = replay.run_command(command).await {
                    warn!(line = index + 1, error = %err, "Command failed");
                }
            }
        }

        println!("--- step {} ---", index + 1);
        print!("{}", replay.room.snapshot().render_tree());
    }

    replay.room.disconnect();
    info!("roomsync replay finished");
    Ok(())
}
