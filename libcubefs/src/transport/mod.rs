//! QUIC transport layer for CSI messages.
//!
//! This module provides [`CsiClient`] and [`CsiServer`] that communicate
//! [`CsiMessage`] values over QUIC bi-directional streams using `quinn`.
//!
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::{CsiServer, dispatch};

/// Upper bound on one serialized message.
pub(crate) const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
