//! USB transfer pipeline
//!
//! The pipeline splits into the slot arena ([`pool`]), the isochronous
//! submission/completion/drain machinery ([`transfer`]), the device
//! session lifecycle ([`session`]), and the event pump thread
//! ([`pump`]).

pub(crate) mod pool;
pub mod pump;
pub mod session;
pub(crate) mod transfer;
