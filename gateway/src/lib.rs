// Parley gateway
// Terminates one duplex WebSocket per client, demultiplexes JSON control and
// binary audio, and fans broker events back out to the client.

pub mod server;
pub mod session;

pub use server::{Gateway, GatewayConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Bind error: {0}")]
    BindError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] parley_core::CoreError),
}
pub type Result<T> = std::result::Result<T, GatewayError>;
