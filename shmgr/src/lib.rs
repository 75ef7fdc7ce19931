//! Legacy shared-memory segments over POSIX shared memory.
//!
//! Processes link the [`client`] library (or its [`legacy`] facade) and talk
//! to one [`manager`] service that owns the segment table: which keys map to
//! which segments, who may attach them, and how many attachments each has.
//! Segment contents live in POSIX shared memory objects that the manager
//! creates and clients map directly.

// Log fields are the only use of some bindings when the macros compile away.
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

pub mod client;
pub mod error;
pub mod ipc;
pub mod legacy;
pub mod manager;
pub mod protocol;
mod trace;
pub mod types;

pub use client::ShmContext;
pub use error::{Result, ShmError};
pub use trace::init_tracing;
pub use types::{AttachFlags, ControlCommand, GetFlags, Key, SegmentId, SegmentStat};
