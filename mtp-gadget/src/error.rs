use crate::protocol;

/// Everything that can go wrong while serving a session.
///
/// The first group maps one-to-one onto PTP response codes; the transport
/// group aborts the current transaction and eventually ends the loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("unknown request type")]
    UnknownRequestType,
    #[error("session not open")]
    SessionNotOpen,
    #[error("invalid storage id")]
    InvalidStorageId,
    #[error("invalid object id")]
    InvalidObjectId,
    #[error("unknown property code")]
    UnknownPropertyCode,
    #[error("invalid property value")]
    InvalidPropertyValue,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("property group specified")]
    GroupSpecified,
    #[error("property depth specified")]
    DepthSpecified,
    #[error("end of transmission")]
    EndOfTransmission,

    #[error("stop requested")]
    StopRequested,
    #[error("usb i/o error: {0}")]
    UsbIo(#[source] std::io::Error),

    #[error("filesystem error: {0}")]
    Fs(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport errors tear the responder loop down instead of being
    /// answered with a response container.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::StopRequested | Error::UsbIo(_))
    }

    /// The response code a failed handler answers with.
    pub fn response_code(&self) -> u16 {
        match self {
            Error::OperationNotSupported => protocol::RSP_OPERATION_NOT_SUPPORTED,
            Error::UnknownRequestType => protocol::RSP_INVALID_PARAMETER,
            Error::SessionNotOpen => protocol::RSP_SESSION_NOT_OPEN,
            Error::InvalidStorageId => protocol::RSP_INVALID_STORAGE_ID,
            Error::InvalidObjectId => protocol::RSP_INVALID_OBJECT_HANDLE,
            Error::UnknownPropertyCode => protocol::RSP_INVALID_OBJECT_PROP_CODE,
            Error::InvalidPropertyValue => protocol::RSP_INVALID_OBJECT_PROP_VALUE,
            Error::InvalidArgument => protocol::RSP_INVALID_PARAMETER,
            Error::GroupSpecified => protocol::RSP_GROUP_NOT_SUPPORTED,
            Error::DepthSpecified => protocol::RSP_DEPTH_NOT_SUPPORTED,
            _ => protocol::RSP_GENERAL_ERROR,
        }
    }
}
