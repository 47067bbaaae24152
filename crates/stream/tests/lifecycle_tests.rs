//! Session lifecycle tests against the public API
//!
//! These run without USB hardware: they exercise the state machine's
//! misuse paths, idempotence guarantees, and the sink trait surface.

use std::sync::Mutex;

use uac_stream::{AudioSink, Error, SessionState, SinkError, StreamConfig, UacSession};

struct VecSink {
    received: Mutex<Vec<u8>>,
}

impl VecSink {
    fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
        }
    }
}

impl AudioSink for VecSink {
    fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        self.received.lock().unwrap().extend_from_slice(payload);
        Ok(())
    }
}

fn session() -> UacSession {
    UacSession::new(StreamConfig::default(), Box::new(VecSink::new())).unwrap()
}

#[test]
fn test_close_before_stop_reports_misuse() {
    let mut session = session();
    let err = session.close().unwrap_err();
    assert!(matches!(err, Error::CloseBeforeStop));
    // Nothing was mutated by the refused close.
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.measure(), 0);
}

#[test]
fn test_stop_twice_matches_stop_once() {
    let mut session = session();
    session.stop();
    let bytes_after_one = session.measure();
    let state_after_one = session.state();

    session.stop();
    assert_eq!(session.measure(), bytes_after_one);
    assert_eq!(session.state(), state_after_one);
}

#[test]
fn test_full_teardown_without_device() {
    let mut session = session();
    session.stop();
    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_start_requires_open_device() {
    let mut session = session();
    assert!(matches!(session.start(), Err(Error::NotOpen)));
}

#[test]
fn test_event_pump_requires_open_device() {
    let session = session();
    assert!(session.event_pump().is_err());
}

#[test]
fn test_measure_is_zero_before_any_stream() {
    assert_eq!(session().measure(), 0);
}

#[test]
fn test_degenerate_config_rejected_at_construction() {
    let mut config = StreamConfig::default();
    config.packets = 0;
    assert!(UacSession::new(config, Box::new(VecSink::new())).is_err());
}
