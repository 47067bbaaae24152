//! Configuration loading tests

use uac_stream::StreamConfig;

#[test]
fn test_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.toml");

    let mut config = StreamConfig::default();
    config.packet_size = 96;
    config.sample_rate_hz = 44_100;
    config.save(&path).unwrap();

    let loaded = StreamConfig::load(&path).unwrap();
    assert_eq!(loaded.packet_size, 96);
    assert_eq!(loaded.sample_rate_hz, 44_100);
    assert_eq!(loaded.transfers, config.transfers);
}

#[test]
fn test_load_partial_file_fills_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.toml");
    std::fs::write(&path, "transfers = 4\n[drain]\nmax_waits = 3\n").unwrap();

    let loaded = StreamConfig::load(&path).unwrap();
    assert_eq!(loaded.transfers, 4);
    assert_eq!(loaded.drain.max_waits, 3);
    assert_eq!(loaded.packet_size, 192);
    assert_eq!(loaded.drain.wait_ms, 100);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(StreamConfig::load(std::path::Path::new("/nonexistent/stream.toml")).is_err());
}

#[test]
fn test_load_rejects_invalid_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.toml");
    std::fs::write(&path, "transfers = 0\n").unwrap();
    assert!(StreamConfig::load(&path).is_err());
}

#[test]
fn test_load_rejects_malformed_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.toml");
    std::fs::write(&path, "transfers = [not toml").unwrap();
    assert!(StreamConfig::load(&path).is_err());
}
