//! USB event pump
//!
//! Dedicated thread for libusb event handling. Completion callbacks run
//! on this thread, so it must be pumping whenever transfers are in
//! flight, concurrently with start/stop calls from the driver thread.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{Context, UsbContext};
use tracing::{debug, error};

use crate::usb::transfer::StreamShared;

/// How long one `handle_events` call may block before the shutdown
/// flag is re-checked.
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Extra event iterations granted after shutdown so cancelled
/// transfers can still complete and release their slots.
const DRAIN_GRACE_ITERATIONS: u32 = 10;

/// Pumps USB events until the session's shutdown flag is set.
pub struct EventPump {
    context: Context,
    shared: Arc<StreamShared>,
}

impl EventPump {
    pub(crate) fn new(context: Context, shared: Arc<StreamShared>) -> Self {
        Self { context, shared }
    }

    /// Run the event loop on the current thread.
    ///
    /// Exits once the shutdown flag is set and no transfer remains in
    /// flight, or when the USB stack reports a fatal error. Cancelled
    /// transfers still complete through this loop, so the pump outlives
    /// the shutdown request until the pool drains.
    pub fn run(&self) {
        debug!("usb event pump started");

        let mut grace = DRAIN_GRACE_ITERATIONS;
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                if self.shared.in_flight() == 0 || grace == 0 {
                    break;
                }
                grace -= 1;
            }
            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("usb event handling interrupted");
                }
                Err(e) => {
                    error!("error handling usb events: {}", e);
                    break;
                }
            }
        }

        debug!("usb event pump stopped");
    }

    /// Run the pump on a named background thread.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("usb-event-pump".to_string())
            .spawn(move || self.run())
            .expect("Failed to spawn USB event pump thread")
    }
}
