//! Upstream feed multiplexing core.
//!
//! Maintains at most one live upstream odds-feed connection per watched
//! match event, decodes the provider's text framing, and fans validated
//! updates out to downstream sessions through the [`Broadcast`] seam.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod frame;
pub mod interest;
mod keepalive;
pub mod router;
pub mod service;

pub use broadcast::Broadcast;
pub use config::{FeedConfig, DEFAULT_UPSTREAM_URL};
pub use connection::ConnState;
pub use interest::SessionId;
pub use service::FeedService;
