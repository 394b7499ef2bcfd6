//! stage-host: motion-command dispatcher for a GRBL-driven two-axis stage.
//!
//! Loads a file of stage commands, feeds them to the controller one at a
//! time over a serial link, paces transmission with a physically-derived
//! inter-move delay, tracks absolute position across coordinate-mode
//! switches, and checkpoints progress so an interrupted run can resume.

pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod motion_queue;
pub mod stage;
pub mod transport;

pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{Config, load_config};
pub use dispatcher::{DispatchEvent, Dispatcher, DispatcherState, StartOutcome};
pub use motion_queue::MotionQueue;
pub use stage::position::{CoordinateMode, Position, PositionTracker};
pub use stage::{Stage, StageError};
pub use transport::{SerialTransport, SimTransport, Transport};
