use std::io::Write;
use std::sync::Arc;

use stage_host::checkpoint::MemoryCheckpointStore;
use stage_host::config::Config;
use stage_host::stage::Stage;
use stage_host::stage::position::Position;
use stage_host::transport::SimTransport;
use tempfile::tempdir;

const STARTUP: &str = "\
; grbl defaults for the stage
$110=800
$111=800
$120=200
$121=200
G90
";

fn test_config(dir: &tempfile::TempDir) -> Config {
    let startup_path = dir.path().join("startup.grbl");
    let mut file = std::fs::File::create(&startup_path).unwrap();
    file.write_all(STARTUP.as_bytes()).unwrap();

    toml::from_str(&format!(
        r#"
        [stage]
        port = "/dev/null"
        startup_file = "{}"
        position_file = "{}"

        [dispatch]
        checkpoint_file = "{}"
        checkpoint_interval_ms = 0
        "#,
        startup_path.display(),
        dir.path().join("last_position.json").display(),
        dir.path().join("checkpoint.json").display(),
    ))
    .unwrap()
}

#[tokio::test]
async fn bring_up_streams_startup_and_loads_parameters() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let transport = SimTransport::new();

    let stage = Stage::bring_up(
        &config,
        Box::new(transport.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await
    .unwrap();

    // $ settings and the bare G90 all go to the controller verbatim.
    assert_eq!(
        transport.sent(),
        vec!["$110=800", "$111=800", "$120=200", "$121=200", "G90"]
    );
    assert_eq!(stage.dispatcher().params().get("xMaxRate").unwrap(), 800.0);
    // The feed rate starts at the configured maximum.
    assert_eq!(stage.dispatcher().feed_rate(), 800.0);
}

#[tokio::test]
async fn jog_moves_relative_and_restores_absolute_mode() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let transport = SimTransport::new();

    let stage = Stage::bring_up(
        &config,
        Box::new(transport.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await
    .unwrap();

    stage.jog_x(2.5).await.unwrap();
    stage.jog_y(-1.0).await.unwrap();

    let sent = transport.sent();
    let tail = &sent[sent.len() - 4..];
    assert_eq!(tail, vec!["G91 x2.5", "G90", "G91 y-1", "G90"]);
    assert_eq!(stage.position(), Position::new(2.5, -1.0));
}

#[tokio::test]
async fn homing_commands_use_configured_rate() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let transport = SimTransport::new();

    let stage = Stage::bring_up(
        &config,
        Box::new(transport.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await
    .unwrap();

    stage.go_home().await.unwrap();
    stage.set_home().await.unwrap();

    let sent = transport.sent();
    let tail = &sent[sent.len() - 2..];
    assert_eq!(tail, vec!["G90 X0 Y0 F800", "G92 X0 Y0"]);
}

#[tokio::test]
async fn blank_and_comment_lines_never_reach_the_wire() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let transport = SimTransport::new();

    let stage = Stage::bring_up(
        &config,
        Box::new(transport.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await
    .unwrap();

    let before = transport.sent().len();
    assert!(stage.send_command("   ").await.unwrap().is_none());
    assert!(stage.send_command("; note to self").await.unwrap().is_none());
    assert_eq!(transport.sent().len(), before);
}

#[tokio::test]
async fn position_round_trips_through_disconnect() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    let stage = Stage::bring_up(
        &config,
        Box::new(SimTransport::new()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await
    .unwrap();
    stage.send_command("G90 X3 Y4").await.unwrap();
    stage.disconnect().await.unwrap();

    // A fresh session picks up where the last one left off.
    let revived = Stage::bring_up(
        &config,
        Box::new(SimTransport::new()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .await
    .unwrap();
    assert_eq!(revived.position(), Position::new(3.0, 4.0));
}
