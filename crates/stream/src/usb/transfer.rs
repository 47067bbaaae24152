//! Isochronous transfer pipeline
//!
//! Submission fills every slot of the arena with an isochronous
//! transfer against the streaming endpoint and hands them to libusb.
//! The completion callback runs on the event-pump thread once per
//! finished transfer: it validates packet statuses, concatenates the
//! received bytes, forwards them to the sink, and either resubmits the
//! transfer in place or releases the slot. Releasing is the only code
//! path that ever frees a slot's descriptor and buffer, which is what
//! keeps cancellation race-free: stop() merely requests cancellation
//! and then waits on the pool condvar until the callback has emptied
//! every slot (or the bounded wait gives up).
//!
//! Each occupied slot leaks one `Arc` strong count on the shared
//! stream state through its `SlotContext`; the release path reclaims
//! it. A completion that arrives after a drain timeout therefore still
//! finds the shared state alive.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use libc::{c_int, c_uint};
use rusb::constants::{
    LIBUSB_ERROR_BUSY, LIBUSB_ERROR_INVALID_PARAM, LIBUSB_ERROR_IO, LIBUSB_ERROR_NOT_SUPPORTED,
    LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NO_MEM, LIBUSB_TRANSFER_COMPLETED,
};
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_device_handle, libusb_fill_iso_transfer,
    libusb_free_transfer, libusb_set_iso_packet_lengths, libusb_submit_transfer, libusb_transfer,
};
use tracing::{debug, warn};

use crate::config::{DrainSettings, StreamConfig};
use crate::error::{Error, Result};
use crate::sink::{AudioSink, SinkBinding};
use crate::stats::Throughput;
use crate::usb::pool::{TransferPool, TransferPtr};

/// State shared between the session, the event-pump callback, and the
/// drain protocol.
pub(crate) struct StreamShared {
    pub pool: Mutex<TransferPool>,
    pub drained: Condvar,
    /// Advisory: read unsynchronized by the callback to pick resubmit
    /// vs release. A racing extra resubmission is absorbed by the
    /// bounded drain and re-checked on the next completion.
    pub shutdown: AtomicBool,
    /// Set when the last slot is released while streaming.
    pub degraded: AtomicBool,
    pub stats: Throughput,
    pub sink: Box<dyn AudioSink>,
    pub packet_size: usize,
}

impl StreamShared {
    pub(crate) fn new(capacity: usize, packet_size: usize, sink: Box<dyn AudioSink>) -> Self {
        Self {
            pool: Mutex::new(TransferPool::new(capacity)),
            drained: Condvar::new(),
            shutdown: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            stats: Throughput::new(),
            sink,
            packet_size,
        }
    }

    /// Number of slots with a transfer still in flight.
    pub(crate) fn in_flight(&self) -> usize {
        lock_pool(self).occupied_count()
    }
}

/// Per-occupancy callback context. One leaked box (and one `Arc`
/// strong count) per occupied slot, reclaimed only in [`release_slot`].
struct SlotContext {
    shared: Arc<StreamShared>,
    index: usize,
}

/// Failure modes of a single completion, local to one slot.
#[derive(Debug, thiserror::Error)]
enum CompletionError {
    #[error("transfer finished with status {0}")]
    Transfer(c_int),
    #[error("packet {index} finished with status {status}")]
    Packet { index: usize, status: c_int },
}

fn lock_pool(shared: &StreamShared) -> MutexGuard<'_, TransferPool> {
    shared.pool.lock().unwrap_or_else(|e| e.into_inner())
}

fn submit_error(rc: c_int) -> rusb::Error {
    match rc {
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_IO => rusb::Error::Io,
        _ => rusb::Error::Other,
    }
}

/// Fill and submit every slot of the pool.
///
/// Allocation failure aborts; a rejected submission is logged, its slot
/// rolled back, and the fill continues best-effort. Returns the number
/// of transfers actually in flight and records the stream-start
/// timestamp.
pub(crate) fn submit_all(
    shared: &Arc<StreamShared>,
    handle: *mut libusb_device_handle,
    endpoint: u8,
    config: &StreamConfig,
) -> Result<usize> {
    // Occupied slots still belong to cancelled transfers from an
    // earlier stream; overwriting them would free buffers libusb may
    // still write into.
    let occupied = lock_pool(shared).occupied_count();
    if occupied > 0 {
        return Err(Error::SlotsOccupied { occupied });
    }

    let transfer_size = config.transfer_size();
    let mut submitted = 0;

    for index in 0..config.transfers {
        let mut buffer = vec![0u8; transfer_size].into_boxed_slice();
        let buffer_ptr = buffer.as_mut_ptr();

        let raw = unsafe { libusb_alloc_transfer(config.packets as c_int) };
        let Some(ptr) = NonNull::new(raw) else {
            return Err(Error::TransferAlloc { index });
        };

        let ctx = Box::into_raw(Box::new(SlotContext {
            shared: Arc::clone(shared),
            index,
        }));

        unsafe {
            libusb_fill_iso_transfer(
                ptr.as_ptr(),
                handle,
                endpoint,
                buffer_ptr,
                transfer_size as c_int,
                config.packets as c_int,
                stream_callback,
                ctx as *mut c_void,
                config.transfer_timeout_ms as c_uint,
            );
            libusb_set_iso_packet_lengths(ptr.as_ptr(), config.packet_size as c_uint);
        }

        // Occupy before submitting so a completion can always resolve
        // its slot.
        lock_pool(shared).occupy(index, TransferPtr::new(ptr), buffer);

        let rc = unsafe { libusb_submit_transfer(ptr.as_ptr()) };
        if rc < 0 {
            warn!(
                "submission of transfer {} rejected: {}",
                index,
                submit_error(rc)
            );
            lock_pool(shared).clear(index);
            unsafe {
                libusb_free_transfer(ptr.as_ptr());
                drop(Box::from_raw(ctx));
            }
            continue;
        }

        debug!("submitted transfer {} on endpoint {:#04x}", index, endpoint);
        submitted += 1;
    }

    shared.stats.mark_start();

    if submitted == 0 {
        warn!("no transfers in flight after submission pass");
        shared.degraded.store(true, Ordering::Relaxed);
    }

    Ok(submitted)
}

/// Completion callback, invoked by libusb exactly once per finished
/// transfer (success, error, or cancellation).
pub(crate) extern "system" fn stream_callback(raw: *mut libusb_transfer) {
    let Some(xfr) = NonNull::new(raw) else {
        return;
    };

    let user_data = unsafe { xfr.as_ref() }.user_data;
    if user_data.is_null() {
        // Cancellation notice for a transfer with no owner.
        return;
    }

    let resubmitted = process_completion(xfr, unsafe { &*(user_data as *const SlotContext) });
    if !resubmitted {
        release_slot(xfr);
    }
}

/// Validate, forward, and resubmit one completed transfer.
///
/// Returns true if the transfer was resubmitted in place; false means
/// the caller must release the slot. Exactly one of the two happens per
/// completion.
fn process_completion(xfr: NonNull<libusb_transfer>, ctx: &SlotContext) -> bool {
    let shared = ctx.shared.as_ref();
    let transfer = unsafe { xfr.as_ref() };
    let mut resubmit = true;

    match SinkBinding::acquire(shared.sink.as_ref()) {
        Ok(binding) => match assemble_payload(transfer, shared.packet_size) {
            Ok(payload) => {
                if let Err(e) = binding.write(&payload) {
                    warn!("slot {}: sink rejected payload: {}", ctx.index, e);
                    resubmit = false;
                } else {
                    shared.stats.record(payload.len());
                }
            }
            Err(e) => {
                warn!("slot {}: {}", ctx.index, e);
                resubmit = false;
            }
        },
        Err(e) => {
            warn!("slot {}: could not bind sink context: {}", ctx.index, e);
            resubmit = false;
        }
    }

    if !resubmit || shared.shutdown.load(Ordering::Relaxed) {
        return false;
    }

    let rc = unsafe { libusb_submit_transfer(xfr.as_ptr()) };
    if rc < 0 {
        warn!(
            "slot {}: resubmission rejected: {}",
            ctx.index,
            submit_error(rc)
        );
        return false;
    }
    true
}

/// Release a slot: cancel, free descriptor and buffer, clear the arena
/// entry, and wake the drain waiter. Reclaims the occupancy's leaked
/// `SlotContext` and its `Arc` count.
fn release_slot(xfr: NonNull<libusb_transfer>) {
    let ctx_ptr = unsafe { xfr.as_ref() }.user_data as *mut SlotContext;
    if ctx_ptr.is_null() {
        return;
    }
    let ctx = unsafe { Box::from_raw(ctx_ptr) };
    let shared = ctx.shared.as_ref();

    let mut pool = lock_pool(shared);
    match pool.clear_matching(ctx.index, xfr.as_ptr()) {
        Some(entry) => {
            unsafe {
                // No-op if the transfer already completed or was
                // cancelled earlier.
                libusb_cancel_transfer(xfr.as_ptr());
                libusb_free_transfer(xfr.as_ptr());
            }
            drop(entry.buffer);
            debug!("released slot {}", ctx.index);
        }
        None => {
            debug!("slot {} already empty on release", ctx.index);
        }
    }

    if pool.occupied_count() == 0
        && !shared.shutdown.load(Ordering::Relaxed)
        && !shared.degraded.swap(true, Ordering::Relaxed)
    {
        warn!("all transfer slots released; stream is no longer producing data");
    }

    shared.drained.notify_all();
}

/// Request cancellation of every occupied slot.
///
/// Cancelling a slot that is already completing is a no-op; freeing
/// stays with the completion callback.
pub(crate) fn cancel_all(shared: &StreamShared) {
    let pool = lock_pool(shared);
    for ptr in pool.occupied_transfers() {
        unsafe {
            libusb_cancel_transfer(ptr);
        }
    }
}

/// Block until the pool is empty or the bounded wait gives up.
///
/// Returns the number of slots still occupied; a non-zero return is an
/// accepted timeout, never escalated to a forced free.
pub(crate) fn drain(shared: &StreamShared, settings: &DrainSettings) -> usize {
    let mut pool = lock_pool(shared);
    for _ in 0..settings.max_waits {
        if pool.occupied_count() == 0 {
            break;
        }
        let (guard, _timed_out) = shared
            .drained
            .wait_timeout(pool, settings.wait())
            .unwrap_or_else(|e| e.into_inner());
        pool = guard;
    }
    pool.occupied_count()
}

/// Status and received length of one isochronous packet.
struct PacketView {
    status: c_int,
    actual_length: usize,
}

/// Read the packet descriptors and buffer out of a raw transfer and
/// assemble the forwarded payload.
fn assemble_payload(
    transfer: &libusb_transfer,
    packet_size: usize,
) -> std::result::Result<Vec<u8>, CompletionError> {
    if transfer.status != LIBUSB_TRANSFER_COMPLETED {
        return Err(CompletionError::Transfer(transfer.status));
    }

    let num_packets = transfer.num_iso_packets as usize;
    let packets: Vec<PacketView> = unsafe {
        std::slice::from_raw_parts(transfer.iso_packet_desc.as_ptr(), num_packets)
            .iter()
            .map(|desc| PacketView {
                status: desc.status,
                actual_length: desc.actual_length as usize,
            })
            .collect()
    };
    let buffer = unsafe { std::slice::from_raw_parts(transfer.buffer, transfer.length as usize) };

    assemble(buffer, packet_size, &packets)
}

/// Concatenate each packet's valid bytes in packet order.
///
/// The received per-packet length is authoritative, not the nominal
/// packet size. Any packet error invalidates the whole transfer; no
/// partial payload is delivered.
fn assemble(
    buffer: &[u8],
    packet_size: usize,
    packets: &[PacketView],
) -> std::result::Result<Vec<u8>, CompletionError> {
    let mut payload = Vec::with_capacity(buffer.len());
    for (index, packet) in packets.iter().enumerate() {
        if packet.status != LIBUSB_TRANSFER_COMPLETED {
            return Err(CompletionError::Packet {
                index,
                status: packet.status,
            });
        }
        let offset = index * packet_size;
        let end = (offset + packet.actual_length.min(packet_size)).min(buffer.len());
        payload.extend_from_slice(&buffer[offset.min(buffer.len())..end]);
    }
    Ok(payload)
}
