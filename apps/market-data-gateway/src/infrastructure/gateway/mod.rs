//! Downstream Gateway
//!
//! WebSocket server, per-client sessions and the client wire protocol.

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{ClientRequest, Notice, RequestError, ServerFrame};
pub use server::{GatewayServer, GatewayServerError, GatewayState, router, serve};
pub use session::{ChannelSink, ClientSession, Outbound, OutboundQueues};
