use clap::{Parser, Subcommand, ValueEnum};

use stage_host::checkpoint::CheckpointError;
use stage_host::dispatcher::{DispatchEvent, StartOutcome};
use stage_host::{Stage, StageError, config};

#[derive(Parser)]
#[command(name = "stage-host", version, about = "Motion-command dispatcher for a two-axis stage")]
struct Cli {
    /// Host configuration file
    #[arg(short, long, default_value = "stage.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dispatch a command file to the stage
    Run { file: String },
    /// Resume an interrupted run from the checkpoint
    Resume,
    /// Jog one axis by a distance in millimetres
    Jog {
        #[arg(value_enum)]
        axis: Axis,
        distance: f64,
    },
    /// Send a single command line
    Send { line: String },
    /// Rapid to the work origin
    Home,
    /// Declare the current location to be the work origin
    SetHome,
}

#[derive(Clone, Copy, ValueEnum)]
enum Axis {
    X,
    Y,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    tracing::info!("loading configuration from {}", cli.config);
    let config = config::load_config(&cli.config).map_err(|e| {
        tracing::error!("failed to load config '{}': {}", cli.config, e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    tracing::info!(
        "stage on {} @ {} baud, startup file '{}'",
        config.stage.port,
        config.stage.baud,
        config.stage.startup_file
    );

    let stage = Stage::connect(&config).await?;
    tracing::info!("connected; position {}", stage.position());

    match cli.command {
        Command::Run { file } => {
            let mut events = stage.dispatcher().subscribe();
            match stage.run_file(&file).await? {
                StartOutcome::Started => watch_run(&stage, &mut events).await,
                StartOutcome::AlreadyRunning => tracing::warn!("a run is already active"),
            }
        }
        Command::Resume => {
            let mut events = stage.dispatcher().subscribe();
            match stage.resume().await {
                Ok(StartOutcome::Started) => watch_run(&stage, &mut events).await,
                Ok(StartOutcome::AlreadyRunning) => tracing::warn!("a run is already active"),
                Err(StageError::Checkpoint(CheckpointError::NoCheckpoint)) => {
                    tracing::info!("nothing to resume: no checkpoint found");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Jog { axis, distance } => {
            match axis {
                Axis::X => stage.jog_x(distance).await?,
                Axis::Y => stage.jog_y(distance).await?,
            }
            tracing::info!("position {}", stage.position());
        }
        Command::Send { line } => {
            if let Some(response) = stage.send_command(&line).await? {
                tracing::info!("controller: {}", response);
            }
            tracing::info!("position {}", stage.position());
        }
        Command::Home => stage.go_home().await?,
        Command::SetHome => stage.set_home().await?,
    }

    stage.disconnect().await?;
    Ok(())
}

/// Follow a run to completion, halting on Ctrl-C.
async fn watch_run(
    stage: &Stage,
    events: &mut tokio::sync::broadcast::Receiver<DispatchEvent>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DispatchEvent::Started { source, pending, .. }) => {
                    tracing::info!("dispatching {} commands from '{}'", pending, source);
                }
                Ok(DispatchEvent::Sent { line, dispatched, response, delay }) => {
                    tracing::info!("[{}] {} -> {} (next move in {:?})", dispatched, line, response, delay);
                }
                Ok(DispatchEvent::Completed { dispatched }) => {
                    tracing::info!("run complete: {} commands dispatched", dispatched);
                    break;
                }
                Ok(DispatchEvent::Halted { dispatched }) => {
                    tracing::info!("run halted after {} commands; resume later with 'resume'", dispatched);
                    break;
                }
                Ok(DispatchEvent::Failed { dispatched, error }) => {
                    tracing::error!("run failed after {} commands: {}", dispatched, error);
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("missed {} dispatch events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt: halting run");
                stage.halt().await;
            }
        }
    }
    stage.dispatcher().wait_idle().await;
}
