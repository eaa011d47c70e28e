/// Failures while demultiplexing an archive into the content store.
///
/// Every variant makes the controller's `feed` report failure; the MTP
/// write handler surfaces that as a failed transaction to the host.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("bad archive magic {found:#010x}")]
    BadMagic { found: u32 },
    #[error("no secure partition in disk image")]
    MissingSecurePartition,
    #[error("chunk for {name} arrived out of order (got {offset}, expected {expected})")]
    OutOfOrder {
        name: String,
        offset: u64,
        expected: u64,
    },
    #[error("no writer for archive entry {name}")]
    UnsupportedEntry { name: String },
    #[error("positional read behind the stream cursor")]
    BackwardSeek,
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("content store: {0}")]
    Store(String),
    #[error("ticket import: {0}")]
    Ticket(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type InstallResult<T> = std::result::Result<T, InstallError>;
