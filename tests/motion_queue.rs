use std::io::Write;

use stage_host::motion_queue::{MotionQueue, QueueError};
use tempfile::tempdir;

fn write_source(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn load_preserves_fifo_order_and_skips_noise() {
    let dir = tempdir().unwrap();
    let path = write_source(
        &dir,
        "pattern.nc",
        "; raster pattern\nG90 X0 Y0\n\n  ; indented comment\nG1 X10 Y0\nG1 X10 Y10\n",
    );

    let mut queue = MotionQueue::new();
    let loaded = queue.load_file(&path).await.unwrap();
    assert_eq!(loaded, 3);
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.source(), Some(path.as_str()));

    assert_eq!(queue.dequeue().unwrap(), "G90 X0 Y0");
    assert_eq!(queue.dequeue().unwrap(), "G1 X10 Y0");
    assert_eq!(queue.dequeue().unwrap(), "G1 X10 Y10");
    assert!(matches!(queue.dequeue(), Err(QueueError::QueueEmpty)));
}

#[tokio::test]
async fn peek_does_not_consume() {
    let dir = tempdir().unwrap();
    let path = write_source(&dir, "one.nc", "G1 X1\n");

    let mut queue = MotionQueue::new();
    queue.load_file(&path).await.unwrap();
    assert_eq!(queue.peek(), Some("G1 X1"));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.dequeue().unwrap(), "G1 X1");
    assert_eq!(queue.peek(), None);
}

#[tokio::test]
async fn reload_replaces_existing_entries() {
    let dir = tempdir().unwrap();
    let first = write_source(&dir, "a.nc", "G1 X1\nG1 X2\n");
    let second = write_source(&dir, "b.nc", "G1 Y9\n");

    let mut queue = MotionQueue::new();
    queue.load_file(&first).await.unwrap();
    queue.load_file(&second).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.dequeue().unwrap(), "G1 Y9");
    assert_eq!(queue.source(), Some(second.as_str()));
}

#[tokio::test]
async fn clear_empties_regardless_of_size() {
    let dir = tempdir().unwrap();
    let path = write_source(&dir, "many.nc", "G1 X1\nG1 X2\nG1 X3\nG1 X4\n");

    let mut queue = MotionQueue::new();
    queue.load_file(&path).await.unwrap();
    queue.clear();
    assert!(queue.is_empty());
    assert!(matches!(queue.dequeue(), Err(QueueError::QueueEmpty)));
}

#[tokio::test]
async fn missing_source_is_reported() {
    let mut queue = MotionQueue::new();
    let err = queue.load_file("/no/such/file.nc").await.unwrap_err();
    match err {
        QueueError::SourceNotFound { path, .. } => assert_eq!(path, "/no/such/file.nc"),
        other => panic!("unexpected error: {other}"),
    }
}
