//! Stage facade: connection lifecycle, manual moves and run wiring.

pub mod params;
pub mod position;
pub mod timing;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, StartOutcome};
use crate::motion_queue::{QueueError, is_dispatchable};
use crate::stage::params::{ParamError, ParameterStore};
use crate::stage::position::{Position, PositionTracker};
use crate::stage::timing::TimingError;
use crate::transport::{SerialTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("parameter error: {0}")]
    Param(#[from] ParamError),
    #[error("timing error: {0}")]
    Timing(#[from] TimingError),
    #[error("recovery impossible: {0}")]
    RecoveryImpossible(String),
    #[error("a run is active; manual stage commands are rejected until it finishes")]
    RunActive,
}

/// A connected two-axis stage.
///
/// Owns the dispatcher (and through it the serial link) for the lifetime
/// of the connection. Manual operations (jog, homing, one-off commands)
/// go through the dispatcher's manual path so they can never interleave
/// with an active run at the transmission level.
pub struct Stage {
    dispatcher: Dispatcher,
    position_file: String,
}

impl Stage {
    /// Open the serial port, wake the controller, stream the startup file
    /// and parse its `$` settings.
    pub async fn connect(config: &Config) -> Result<Self, StageError> {
        let mut transport =
            SerialTransport::open(&config.stage.port, config.stage.baud).await?;
        transport
            .set_response_timeout(Duration::from_millis(config.dispatch.response_timeout_ms));
        transport.wake().await?;
        let checkpoint = Arc::new(FileCheckpointStore::new(&config.dispatch.checkpoint_file));
        Self::bring_up(config, Box::new(transport), checkpoint).await
    }

    /// Connect over an already-open transport. This is the seam the tests
    /// and dry runs use to drive the stage without hardware.
    pub async fn bring_up(
        config: &Config,
        mut transport: Box<dyn Transport>,
        checkpoint: Arc<dyn CheckpointStore>,
    ) -> Result<Self, StageError> {
        let startup = tokio::fs::read_to_string(&config.stage.startup_file)
            .await
            .map_err(|source| QueueError::SourceNotFound {
                path: config.stage.startup_file.clone(),
                source,
            })?;

        let mut tracker = PositionTracker::new();
        for line in startup.lines().filter(|l| is_dispatchable(l)) {
            let line = line.trim();
            transport.send_line(line).await?;
            let response = transport.read_line().await?;
            if response.to_ascii_lowercase().starts_with("error") {
                tracing::warn!("startup command '{}' rejected: {}", line, response);
            }
            tracker.apply(line);
        }
        tracing::info!("streamed startup file '{}'", config.stage.startup_file);

        let mut params = ParameterStore::new();
        params.load(&startup);
        if let Ok(rate) = params.get("xMaxRate") {
            tracker.set_feed_rate(rate);
        }

        restore_last_position(&config.stage.position_file, &mut tracker).await;

        let dispatcher = Dispatcher::new(
            transport,
            checkpoint,
            params,
            tracker,
            Duration::from_millis(config.dispatch.checkpoint_interval_ms),
        );
        Ok(Self {
            dispatcher,
            position_file: config.stage.position_file.clone(),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn position(&self) -> Position {
        self.dispatcher.position()
    }

    /// Load a command file and start dispatching it.
    pub async fn run_file(&self, path: &str) -> Result<StartOutcome, StageError> {
        self.dispatcher.start(path).await
    }

    /// Resume an interrupted run from the persisted checkpoint.
    pub async fn resume(&self) -> Result<StartOutcome, StageError> {
        self.dispatcher.resume_from_checkpoint().await
    }

    /// Cancel the active run; see [`Dispatcher::halt`].
    pub async fn halt(&self) {
        self.dispatcher.halt().await;
    }

    /// Send one command line manually. Refused while a run is active.
    pub async fn send_command(&self, line: &str) -> Result<Option<String>, StageError> {
        self.dispatcher.send_manual(line).await
    }

    /// Move the X axis by `distance` millimetres, restoring absolute mode
    /// afterwards.
    pub async fn jog_x(&self, distance: f64) -> Result<(), StageError> {
        self.dispatcher
            .send_manual(&format!("G91 x{distance}"))
            .await?;
        self.dispatcher.send_manual("G90").await?;
        Ok(())
    }

    /// Move the Y axis by `distance` millimetres, restoring absolute mode
    /// afterwards.
    pub async fn jog_y(&self, distance: f64) -> Result<(), StageError> {
        self.dispatcher
            .send_manual(&format!("G91 y{distance}"))
            .await?;
        self.dispatcher.send_manual("G90").await?;
        Ok(())
    }

    /// Rapid to the work origin at the configured maximum rate.
    pub async fn go_home(&self) -> Result<(), StageError> {
        let rate = self.dispatcher.params().get("xMaxRate")?;
        self.dispatcher
            .send_manual(&format!("G90 X0 Y0 F{rate}"))
            .await?;
        Ok(())
    }

    /// Declare the current location to be the work origin.
    pub async fn set_home(&self) -> Result<(), StageError> {
        self.dispatcher.send_manual("G92 X0 Y0").await?;
        Ok(())
    }

    /// Persist the last known position and drop the connection.
    pub async fn disconnect(self) -> Result<(), StageError> {
        let position = self.dispatcher.position();
        save_last_position(&self.position_file, position).await;
        tracing::info!("stage disconnected at {}", position);
        Ok(())
    }
}

/// Restore the position saved by the previous session, if any. Failure is
/// only worth a log line: a missing or stale record just means the DRO
/// starts from zero.
async fn restore_last_position(path: &str, tracker: &mut PositionTracker) {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => match serde_json::from_str::<Position>(&text) {
            Ok(position) => {
                tracing::info!("restored last known position {}", position);
                tracker.set_position(position);
            }
            Err(e) => tracing::warn!("could not parse last position file '{}': {}", path, e),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no last position file at '{}'", path);
        }
        Err(e) => tracing::warn!("could not read last position file '{}': {}", path, e),
    }
}

async fn save_last_position(path: &str, position: Position) {
    match serde_json::to_string_pretty(&position) {
        Ok(json) => {
            if let Err(e) = tokio::fs::write(path, json).await {
                tracing::warn!("could not save last position to '{}': {}", path, e);
            }
        }
        Err(e) => tracing::warn!("could not serialize last position: {}", e),
    }
}
