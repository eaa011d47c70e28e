//! MTP/PTP responder presenting pluggable storage backends to a USB host.
//!
//! The responder speaks the bulk-container protocol on a [`usb::BulkPipe`],
//! keeps a per-session object database, and drives storage through the
//! [`proxy::FileSystemProxy`] trait. Nothing is persisted: the object
//! database lives and dies with the session.

pub mod codec;
pub mod dirfs;
pub mod error;
pub mod events;
pub mod ffs;
pub mod object;
pub mod protocol;
pub mod proxy;
pub mod responder;
pub mod server;
pub mod transfer;
pub mod usb;

pub use error::{Error, Result};
pub use events::{EventSink, SessionEvent};
pub use responder::{DeviceIdentity, Responder};
pub use server::{Server, ServerConfig, StorageBackend};
pub use usb::{BulkPipe, StopToken};
