//! Audio sink boundary
//!
//! The completion callback runs on whatever thread the USB stack
//! dispatches it on, which the consumer's runtime may not know about.
//! [`SinkBinding`] gives the callback a scoped attachment to the
//! consumer's execution context: the guard attaches only if the current
//! thread is not already attached, and detaches on drop only if it
//! performed the attach itself.

use std::cell::Cell;
use thiserror::Error;

/// Failure raised by the consumer while ingesting audio bytes.
///
/// Local to one transfer slot: the slot is released and the stream
/// continues with the remaining slots.
#[derive(Debug, Error)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

/// Consumer of assembled isochronous payloads.
///
/// `write` is called synchronously from the completion callback, once
/// per completed transfer, with the packets concatenated in order. It
/// must not block indefinitely. Errors must be returned, not panicked:
/// a returned error disables resubmission for that slot only.
pub trait AudioSink: Send + Sync {
    /// Attach the current thread to the sink's execution context.
    ///
    /// Called at most once per callback invocation, and only when the
    /// thread is not already attached. The default is a no-op for sinks
    /// with no runtime of their own.
    fn attach(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Detach the current thread. Paired with a successful `attach`.
    fn detach(&self) {}

    /// Ingest one transfer's worth of audio bytes.
    fn write(&self, payload: &[u8]) -> Result<(), SinkError>;
}

thread_local! {
    static SINK_ATTACHED: Cell<bool> = const { Cell::new(false) };
}

/// RAII attachment of the current thread to the sink's context.
pub(crate) struct SinkBinding<'a> {
    sink: &'a dyn AudioSink,
    performed_attach: bool,
}

impl<'a> SinkBinding<'a> {
    /// Bind the current thread, attaching if it is not bound already.
    pub(crate) fn acquire(sink: &'a dyn AudioSink) -> Result<Self, SinkError> {
        let performed_attach = SINK_ATTACHED.with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        });

        if performed_attach {
            if let Err(e) = sink.attach() {
                SINK_ATTACHED.with(|flag| flag.set(false));
                return Err(e);
            }
        }

        Ok(Self {
            sink,
            performed_attach,
        })
    }

    /// Forward a payload through the bound sink.
    pub(crate) fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        self.sink.write(payload)
    }
}

impl Drop for SinkBinding<'_> {
    fn drop(&mut self) {
        if self.performed_attach {
            self.sink.detach();
            SINK_ATTACHED.with(|flag| flag.set(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        attaches: AtomicUsize,
        detaches: AtomicUsize,
        writes: AtomicUsize,
    }

    impl AudioSink for CountingSink {
        fn attach(&self) -> Result<(), SinkError> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn detach(&self) {
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }

        fn write(&self, _payload: &[u8]) -> Result<(), SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RefusingSink;

    impl AudioSink for RefusingSink {
        fn attach(&self) -> Result<(), SinkError> {
            Err(SinkError("runtime unavailable".into()))
        }

        fn write(&self, _payload: &[u8]) -> Result<(), SinkError> {
            unreachable!("write must not be reached without an attach")
        }
    }

    #[test]
    fn test_binding_attaches_and_detaches_once() {
        let sink = CountingSink::default();
        {
            let binding = SinkBinding::acquire(&sink).unwrap();
            binding.write(&[0u8; 4]).unwrap();
        }
        assert_eq!(sink.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(sink.detaches.load(Ordering::SeqCst), 1);
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_binding_does_not_reattach() {
        let sink = CountingSink::default();
        {
            let _outer = SinkBinding::acquire(&sink).unwrap();
            {
                let inner = SinkBinding::acquire(&sink).unwrap();
                inner.write(&[1u8]).unwrap();
            }
            // Inner guard dropped; the outer attach must survive it.
            assert_eq!(sink.detaches.load(Ordering::SeqCst), 0);
        }
        assert_eq!(sink.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(sink.detaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_attach_clears_thread_flag() {
        assert!(SinkBinding::acquire(&RefusingSink).is_err());
        // The failed acquire must not leave the thread marked attached.
        let sink = CountingSink::default();
        drop(SinkBinding::acquire(&sink).unwrap());
        assert_eq!(sink.attaches.load(Ordering::SeqCst), 1);
    }
}
