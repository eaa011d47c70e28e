//! Owns the responder thread and turns an external stop signal into a
//! graceful shutdown.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::EventSink;
use crate::ffs::{DEFAULT_PID, DEFAULT_VID};
use crate::proxy::{FileSystemProxy, ProxyFs};
use crate::responder::{DeviceIdentity, Responder, Storage};
use crate::usb::{BulkPipe, StopToken};

/// Server-wide configuration. The vendor/product ids are advisory here
/// (the transport applies them); the identity strings feed GetDeviceInfo.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub vid: u16,
    pub pid: u16,
    pub identity: DeviceIdentity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            vid: DEFAULT_VID,
            pid: DEFAULT_PID,
            identity: DeviceIdentity::default(),
        }
    }
}

/// One storage to expose: the id the host will see and its backend.
pub struct StorageBackend {
    pub storage_id: u32,
    pub backend: Box<dyn FileSystemProxy>,
}

pub struct Server {
    stop: StopToken,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Force a re-enumeration, then spawn the responder thread. The pipe
    /// and every backend observe `stop`, so `stop()` (or drop) unwinds the
    /// whole session.
    pub fn start(
        mut pipe: Box<dyn BulkPipe>,
        config: ServerConfig,
        backends: Vec<StorageBackend>,
        events: EventSink,
        stop: StopToken,
    ) -> Self {
        // Detach and re-attach so the host re-reads descriptors even if a
        // previous incarnation left the function bound.
        if pipe.disable().is_ok() {
            thread::sleep(Duration::from_millis(50));
            if let Err(e) = pipe.enable() {
                log::warn!("usb enable failed: {e}");
            }
        }

        let storages: Vec<Storage> = backends
            .into_iter()
            .map(|entry| Storage {
                id: entry.storage_id,
                fs: ProxyFs::new(entry.backend, stop.clone()),
            })
            .collect();

        let identity = config.identity.clone();
        let thread = thread::Builder::new()
            .name("mtp-responder".into())
            .spawn(move || {
                Responder::new(pipe, storages, identity, events).run();
            })
            .expect("spawn responder thread");

        Server {
            stop,
            thread: Some(thread),
        }
    }

    /// Signal the stop token and wait for the responder thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("responder thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirfs::DirFs;
    use crate::usb::LoopbackPipe;

    #[test]
    fn server_starts_and_stops_cleanly() {
        let stop = StopToken::new();
        let (pipe, host) = LoopbackPipe::pair(stop.clone());
        let dir = tempfile::tempdir().unwrap();
        let server = Server::start(
            Box::new(pipe),
            ServerConfig::default(),
            vec![StorageBackend {
                storage_id: 0x0001_0001,
                backend: Box::new(DirFs::new("card", "Card", dir.path())),
            }],
            EventSink::none(),
            stop,
        );
        server.stop();
        drop(host);
    }
}
