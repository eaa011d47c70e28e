//! Streaming installer fed by the MTP gadget.
//!
//! Archives a host writes into the virtual install storage are never
//! persisted; they are demultiplexed on the fly into per-entry writers
//! that stream content blobs into a placeholder-based content store and
//! commit title records when each meta completes.

pub mod entry;
pub mod error;
pub mod image;
pub mod layout;
pub mod manager;
pub mod package;
pub mod pull;
pub mod server;
pub mod store;
pub mod vfs;

pub use error::{InstallError, InstallResult};
pub use manager::{ImageMode, InstallManager, StreamInstaller};
pub use server::{InstallServer, InstallServerOptions, INSTALL_STORAGE_ID};
pub use store::{ContentId, ContentMetaKey, ContentMetaType, ContentStorage, TitleKeeper};
