//! Client session gateway
//!
//! The server side of one client connection: join, propose, diff, leave,
//! plus the stream of committed actions pushed back to the client.

pub mod connection;
pub mod error;
pub mod protocol;

pub use connection::ClientGateway;
pub use error::GatewayError;
pub use protocol::{ClientRequest, JoinResponse, ServerEvent, SocketResponse};
