#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! RTP sending engine for a real-time media stack.
//!
//! Turns encoded audio/video frames into RTP packets and applies the
//! sender-side features interactive conferencing needs: header extensions
//! stamped at egress time, a bounded retransmission cache answering NACKs,
//! RFC 4588 RTX wrapping, padding for bandwidth estimation and send-delay
//! statistics. An external pacer may defer any packet and call back into
//! [`RtpSender::time_to_send_packet`] / [`RtpSender::time_to_send_padding`]
//! when its turn arrives.
//!
//! The sender is driven concurrently from a media-producer thread, the
//! pacer thread, a feedback thread delivering NACKs and a periodic process
//! thread; see the module docs in [`sender`] for the locking rules.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod audio;
pub mod clock;
pub mod error;
pub mod extension;
pub mod header;
pub mod history;
pub mod nack;
pub mod observer;
pub mod pacer;
pub mod payload;
pub mod sender;
pub mod ssrc;
pub mod stats;
pub mod transport;
pub mod video;

pub use error::{Error, Result};
pub use sender::{RtpSender, RtpState, RTX_OFF, RTX_REDUNDANT_PAYLOADS, RTX_RETRANSMITTED};

/// Largest packet handed to the transport, IP and UDP headers included.
pub const IP_PACKET_SIZE: usize = 1500;

/// Padding run per padding-only packet. RFC 3550 allows up to 255 bytes;
/// kept a multiple of 32 for SRTP block alignment.
pub const MAX_PADDING_LENGTH: usize = 224;

/// A poisoned lock only marks a panic on another thread; the guarded state
/// itself is still structurally valid, so senders keep operating on it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
