//! Error types for the capture pipeline

use thiserror::Error;

/// Errors reported by the session lifecycle surface.
///
/// Setup-time failures are fatal to that setup attempt and fully rolled
/// back; everything that can go wrong mid-stream (a bad packet, a
/// rejected resubmission, a sink failure) is local to one transfer slot
/// and is logged rather than surfaced here.
#[derive(Debug, Error)]
pub enum Error {
    /// A device open/configure/claim step failed during setup.
    #[error("setup failed while {stage}: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: rusb::Error,
    },

    /// The opened device does not match the vendor/product ids the
    /// caller handed over with the file descriptor.
    #[error(
        "device identity mismatch: expected {expected_vid:04x}:{expected_pid:04x}, \
         descriptor reports {actual_vid:04x}:{actual_pid:04x}"
    )]
    DeviceMismatch {
        expected_vid: u16,
        expected_pid: u16,
        actual_vid: u16,
        actual_pid: u16,
    },

    /// No Audio-Class/Audio-Streaming interface with an endpoint was
    /// found in the device's configuration descriptor.
    #[error("no audio streaming interface with an endpoint found")]
    NoStreamingInterface,

    /// An operation that needs an open device was called without one.
    #[error("session has no open device")]
    NotOpen,

    /// `close()` was called before any `stop()`.
    #[error("close() called before stop()")]
    CloseBeforeStop,

    /// A transfer descriptor or buffer could not be allocated.
    #[error("failed to allocate transfer {index}")]
    TransferAlloc { index: usize },

    /// A new submission pass was attempted while slots from a previous
    /// stream are still occupied (a timed-out drain leaves them so).
    #[error("{occupied} transfer slot(s) still occupied from a previous stream")]
    SlotsOccupied { occupied: usize },

    /// Configuration file problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Passthrough for USB errors outside setup.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// I/O error (config file reads and the like).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for library results
pub type Result<T> = std::result::Result<T, Error>;
