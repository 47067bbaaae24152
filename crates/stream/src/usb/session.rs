//! Device session lifecycle
//!
//! Open → claim → configure → stream → stop → release → close, with an
//! absorbing Failed state for setup errors. The session owns the USB
//! context and device handle; the transfer pipeline only ever sees the
//! raw handle for the duration of a submission pass.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::sink::AudioSink;
use crate::usb::pump::EventPump;
use crate::usb::transfer::{self, StreamShared};

const USB_CLASS_AUDIO: u8 = 1;
const USB_SUBCLASS_AUDIO_STREAMING: u8 = 2;

/// UAC1 SET_CUR request on the sampling-frequency endpoint control.
const UAC_SET_CUR: u8 = 0x01;
const UAC_SAMPLING_FREQ_CONTROL: u16 = 0x0100;

/// Pre-opened device handed over by the host OS.
///
/// The core performs no enumeration of its own: the caller supplies an
/// already-open file descriptor plus the identity it expects behind it.
#[derive(Debug, Clone, Copy)]
pub struct DeviceHandoff {
    pub vendor_id: u16,
    pub product_id: u16,
    pub fd: RawFd,
    pub bus: u8,
    pub device: u8,
}

/// Lifecycle state of a [`UacSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Idle,
    Streaming,
    Failed,
}

/// One open USB Audio Class capture device.
pub struct UacSession {
    config: StreamConfig,
    shared: Arc<StreamShared>,
    context: Option<Context>,
    handle: Option<DeviceHandle<Context>>,
    interface: u8,
    alt_setting: u8,
    endpoint: u8,
    state: SessionState,
}

impl UacSession {
    /// Create a closed session that will forward audio into `sink`.
    pub fn new(config: StreamConfig, sink: Box<dyn AudioSink>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(StreamShared::new(
            config.transfers,
            config.packet_size,
            sink,
        ));
        Ok(Self {
            config,
            shared,
            context: None,
            handle: None,
            interface: 0,
            alt_setting: 0,
            endpoint: 0,
            state: SessionState::Closed,
        })
    }

    /// Open and configure the streaming interface of a handed-over
    /// device.
    ///
    /// Any failure rolls the session back completely: no partial
    /// session survives a failed open. The caller may re-invoke with a
    /// fresh handoff.
    pub fn open(&mut self, handoff: &DeviceHandoff) -> Result<()> {
        match self.open_inner(handoff) {
            Ok(()) => {
                self.state = SessionState::Idle;
                Ok(())
            }
            Err(e) => {
                self.handle = None;
                self.context = None;
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    fn open_inner(&mut self, handoff: &DeviceHandoff) -> Result<()> {
        // Context init is idempotent across repeated opens.
        let context = if let Some(ctx) = &self.context {
            ctx.clone()
        } else {
            let ctx = Context::new().map_err(|source| Error::Setup {
                stage: "initializing usb context",
                source,
            })?;
            self.context = Some(ctx.clone());
            ctx
        };

        info!(
            "opening usb device {:04x}:{:04x} on bus {:03}/{:03} with fd {}",
            handoff.vendor_id, handoff.product_id, handoff.bus, handoff.device, handoff.fd
        );

        // SAFETY: the caller guarantees `fd` is an open usbfs file
        // descriptor for the named device.
        let handle = unsafe { context.open_device_with_fd(handoff.fd) }.map_err(|source| {
            Error::Setup {
                stage: "opening device from fd",
                source,
            }
        })?;

        let device = handle.device();
        let descriptor = device.device_descriptor().map_err(|source| Error::Setup {
            stage: "reading device descriptor",
            source,
        })?;
        if descriptor.vendor_id() != handoff.vendor_id
            || descriptor.product_id() != handoff.product_id
        {
            return Err(Error::DeviceMismatch {
                expected_vid: handoff.vendor_id,
                expected_pid: handoff.product_id,
                actual_vid: descriptor.vendor_id(),
                actual_pid: descriptor.product_id(),
            });
        }

        let (interface, alt_setting, endpoint) = find_streaming_interface(&device)?;
        debug!(
            "found AudioStreaming interface {} alt {} endpoint {:#04x}",
            interface, alt_setting, endpoint
        );

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("detaching kernel driver from interface {}", interface);
                handle
                    .detach_kernel_driver(interface)
                    .map_err(|source| Error::Setup {
                        stage: "detaching kernel driver",
                        source,
                    })?;
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "could not query kernel driver on interface {}: {}",
                    interface, e
                );
            }
        }

        handle
            .claim_interface(interface)
            .map_err(|source| Error::Setup {
                stage: "claiming interface",
                source,
            })?;
        handle
            .set_alternate_setting(interface, alt_setting)
            .map_err(|source| Error::Setup {
                stage: "selecting alternate setting",
                source,
            })?;

        self.request_sample_rate(&handle, endpoint);

        self.handle = Some(handle);
        self.interface = interface;
        self.alt_setting = alt_setting;
        self.endpoint = endpoint;
        Ok(())
    }

    /// Ask the device for the configured sample rate.
    ///
    /// Best effort, as not every device implements the UAC1 endpoint
    /// control; a refusal is logged and setup continues.
    fn request_sample_rate(&self, handle: &DeviceHandle<Context>, endpoint: u8) {
        let mut rate = [0u8; 3];
        LittleEndian::write_u24(&mut rate, self.config.sample_rate_hz);
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Class,
            rusb::Recipient::Endpoint,
        );
        match handle.write_control(
            request_type,
            UAC_SET_CUR,
            UAC_SAMPLING_FREQ_CONTROL,
            u16::from(endpoint),
            &rate,
            self.config.transfer_timeout(),
        ) {
            Ok(n) if n == rate.len() => {
                debug!("sample rate set to {} Hz", self.config.sample_rate_hz);
            }
            Ok(n) => warn!("sample rate request truncated: {} of {} bytes", n, rate.len()),
            Err(e) => warn!("sample rate request failed: {}", e),
        }
    }

    /// Begin streaming: clears the shutdown flag and fills the pool.
    ///
    /// Returns the number of transfers in flight.
    pub fn start(&mut self) -> Result<usize> {
        let Some(handle) = &self.handle else {
            return Err(Error::NotOpen);
        };
        if self.state == SessionState::Streaming {
            return Err(Error::Usb(rusb::Error::Busy));
        }
        // A timed-out drain can leave cancelled transfers in flight
        // past stop(). Clearing the shutdown flag then would let their
        // late completions resubmit; refuse until the pool empties.
        let occupied = self.shared.in_flight();
        if occupied > 0 {
            return Err(Error::SlotsOccupied { occupied });
        }

        self.shared.shutdown.store(false, Ordering::SeqCst);
        self.shared.degraded.store(false, Ordering::SeqCst);
        info!("starting capture on endpoint {:#04x}", self.endpoint);

        let submitted = transfer::submit_all(
            &self.shared,
            handle.as_raw(),
            self.endpoint,
            &self.config,
        )?;
        self.state = SessionState::Streaming;
        Ok(submitted)
    }

    /// Stop streaming: cancel every outstanding transfer and drain the
    /// pool. Idempotent; safe to call in any state.
    pub fn stop(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.stats.summarize();
        transfer::cancel_all(&self.shared);

        let remaining = transfer::drain(&self.shared, &self.config.drain);
        if remaining > 0 {
            warn!("drain timed out with {} slot(s) still occupied", remaining);
        } else {
            debug!("all transfers cancelled");
        }

        if self.state == SessionState::Streaming {
            self.state = SessionState::Idle;
        }
    }

    /// Release the interface and tear down the device.
    ///
    /// Calling close before any stop is a caller error and mutates
    /// nothing. Closing an already-closed session succeeds.
    pub fn close(&mut self) -> Result<()> {
        if !self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::CloseBeforeStop);
        }
        let Some(context) = self.context.take() else {
            return Ok(());
        };

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(self.interface) {
                warn!("failed to release interface {}: {}", self.interface, e);
            }
        }

        // A drain timeout in stop() can leave a transfer technically in
        // flight here. Accepted: a late completion only touches the
        // shared stream state, which every occupied slot pins through
        // its own Arc count.
        drop(context);
        self.state = SessionState::Closed;
        debug!("session closed");
        Ok(())
    }

    /// Cumulative bytes forwarded to the sink, logging the running
    /// throughput. Returns 0 if no stream was ever started.
    pub fn measure(&self) -> u64 {
        self.shared.stats.summarize()
    }

    /// True once every slot has been released while streaming was
    /// still wanted; the stream is silently producing nothing.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Streaming endpoint address discovered at open.
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Claimed interface number and selected alternate setting.
    pub fn interface(&self) -> (u8, u8) {
        (self.interface, self.alt_setting)
    }

    /// Event pump for the I/O thread. Requires an open session.
    pub fn event_pump(&self) -> Result<EventPump> {
        let Some(context) = &self.context else {
            return Err(Error::NotOpen);
        };
        Ok(EventPump::new(context.clone(), Arc::clone(&self.shared)))
    }
}

/// Locate the first Audio-Class/Audio-Streaming interface with at
/// least one endpoint, preferring the highest qualifying alternate
/// setting.
fn find_streaming_interface(device: &Device<Context>) -> Result<(u8, u8, u8)> {
    let config = device.config_descriptor(0).map_err(|source| Error::Setup {
        stage: "reading config descriptor",
        source,
    })?;

    let mut found: Option<(u8, u8, u8)> = None;
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if desc.class_code() == USB_CLASS_AUDIO
                && desc.sub_class_code() == USB_SUBCLASS_AUDIO_STREAMING
                && desc.num_endpoints() > 0
            {
                if let Some(endpoint) = desc.endpoint_descriptors().next() {
                    // Later alternate settings win: alt 0 is the
                    // zero-bandwidth setting and never qualifies.
                    found = Some((
                        desc.interface_number(),
                        desc.setting_number(),
                        endpoint.address(),
                    ));
                }
            }
        }
        if found.is_some() {
            break;
        }
    }

    found.ok_or(Error::NoStreamingInterface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;

    struct NullSink;

    impl AudioSink for NullSink {
        fn write(&self, _payload: &[u8]) -> std::result::Result<(), SinkError> {
            Ok(())
        }
    }

    fn session() -> UacSession {
        UacSession::new(StreamConfig::default(), Box::new(NullSink)).unwrap()
    }

    #[test]
    fn test_new_session_is_closed() {
        let session = session();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_degraded());
    }

    #[test]
    fn test_close_before_stop_is_misuse_and_mutates_nothing() {
        let mut session = session();
        assert!(matches!(session.close(), Err(Error::CloseBeforeStop)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut session = session();
        session.stop();
        let state_after_first = session.state();
        session.stop();
        assert_eq!(session.state(), state_after_first);
    }

    #[test]
    fn test_close_after_stop_without_device_succeeds() {
        let mut session = session();
        session.stop();
        assert!(session.close().is_ok());
        assert!(session.close().is_ok());
    }

    #[test]
    fn test_start_without_device_fails() {
        let mut session = session();
        assert!(matches!(session.start(), Err(Error::NotOpen)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_measure_without_stream_is_zero() {
        let session = session();
        assert_eq!(session.measure(), 0);
    }

    #[test]
    fn test_event_pump_requires_open_session() {
        let session = session();
        assert!(session.event_pump().is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = StreamConfig::default();
        config.transfers = 0;
        assert!(UacSession::new(config, Box::new(NullSink)).is_err());
    }
}
