//! Isochronous USB Audio Class capture
//!
//! This crate streams isochronous audio data from a USB Audio Class
//! device into a host-supplied sink. It keeps a fixed pool of in-flight
//! transfers against the device's streaming endpoint; a completion
//! callback validates each transfer, forwards the assembled payload to
//! the sink, and resubmits the transfer in place. Stopping a stream
//! cancels every outstanding transfer and drains the pool under a
//! condition variable before the device is released.
//!
//! Device enumeration and permission negotiation are out of scope: the
//! caller hands over an already-open file descriptor together with the
//! expected vendor/product ids (the usual arrangement on hosts without
//! root-level USB access).

pub mod config;
pub mod error;
pub mod logging;
pub mod sink;
pub mod stats;
pub mod usb;

pub use config::StreamConfig;
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use sink::{AudioSink, SinkError};
pub use usb::pump::EventPump;
pub use usb::session::{DeviceHandoff, SessionState, UacSession};
