use thiserror::Error;

/// Errors raised while decoding traffic or servicing URBs.
///
/// The protocol engine keys its disposition off the variant: framing
/// problems tear the connection down, per-request problems answer the
/// current request with a non-zero status and keep the connection open.
#[derive(Debug, Error)]
pub enum Error {
    /// The byte stream no longer lines up with any known packet shape.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Header parsed, but the command code is not one we serve.
    #[error("unknown command {0:#06x}")]
    UnknownCommand(u16),

    /// A dev_id or bus_id that resolves to no device on this controller.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// SET_CONFIGURATION named a value no configuration carries.
    #[error("no configuration with value {0}")]
    InvalidConfiguration(u16),

    /// SET_INTERFACE named a number no interface of the active
    /// configuration carries.
    #[error("no interface with number {0}")]
    InvalidInterface(u16),

    /// A request needed an active configuration before one was selected.
    #[error("no active configuration")]
    NoConfiguration,

    /// The user-supplied device hook failed.
    #[error("device handler: {0}")]
    DeviceHandler(String),

    /// The external attach tool could not be run or exited non-zero.
    #[error("attacher: {0}")]
    Attacher(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("packing: {0}")]
    Packing(#[from] packed_struct::PackingError),
}

pub type Result<T> = std::result::Result<T, Error>;
