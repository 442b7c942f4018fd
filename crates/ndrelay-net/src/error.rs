use thiserror::Error;

/// Errors that are fatal to a single connection: the caller must close it.
///
/// None of these are process-fatal — the event loop logs at error level and
/// continues serving every other connection.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad protocol number {0}, expected 1")]
    BadProtocol(u8),

    #[error("bad request code {0}, expected 10")]
    BadRequestCode(u8),

    #[error("frame of {0} bytes exceeds max packet size of {max}", max = crate::frame::MAX_PACKET_SIZE)]
    FrameTooLarge(usize),

    #[error("peer closed the connection")]
    PeerClosed,
}
