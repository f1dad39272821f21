//! threatlink - client-side synchronization layer for a threat-intelligence platform
//!
//! This crate provides:
//! - A session store that is the single source of truth for authentication
//! - A REST client whose authorization failures end the session
//! - A realtime channel with a fixed-delay reconnect loop and listener fan-out
//! - Dashboard aggregation of independent reads into one snapshot
//! - A route guard deciding whether a view may render
//!
//! # Architecture
//!
//! [`client::SyncClient`] composes the pieces: views are mounted through it,
//! the realtime channel is keyed by the logged-in user, and ending the
//! session tears down every view and the channel.

pub mod api;
pub mod channel;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod guard;
pub mod notifications;
pub mod protocol;
pub mod session;

pub use client::{ClientError, Mount, MountedView, SyncClient, ViewEvent};
