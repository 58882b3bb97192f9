use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BluetoothError {
    /// The connection to the external service could not be established.
    #[error("service initialization failed: {0}")]
    Init(String),

    #[error("bluetooth service is not operational")]
    NotOperational,

    #[error("invalid remote object: {0}")]
    InvalidRemoteHandle(String),

    #[error("agent request {0} was already resolved")]
    AlreadyResolved(Uuid),

    #[error("no agent request with id {0}")]
    UnknownRequest(Uuid),

    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("daemon is shutting down")]
    DaemonGone,

    #[error("D-Bus error: {0}")]
    Bus(#[from] dbus::Error),
}

pub type Result<T> = std::result::Result<T, BluetoothError>;
