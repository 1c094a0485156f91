//! Downstream WebSocket gateway for the match-odds relay.

pub mod client;
pub mod error;
pub mod protocol;
pub mod ws_server;

pub use client::{ClientRegistry, ClientState};
pub use error::{GatewayError, Result};
pub use protocol::{ClientMessage, ServerMessage};
pub use ws_server::{create_router, AppState};
