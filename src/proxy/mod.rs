//! Streaming relay between client and upstream.

pub mod transport;

pub use transport::{forward, is_upgrade_request};
