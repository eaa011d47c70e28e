//! Wires the install pieces to an MTP gadget server: one virtual
//! "install" storage whose writes stream into the content store.

use std::sync::Arc;

use mtp_gadget::{BulkPipe, EventSink, Server, ServerConfig, StopToken, StorageBackend};

use crate::manager::{ImageMode, InstallManager};
use crate::store::{ContentStorage, TitleKeeper};
use crate::vfs::InstallFs;

/// Storage id of the virtual install volume.
pub const INSTALL_STORAGE_ID: u32 = 0x0001_0001;

pub struct InstallServerOptions {
    pub config: ServerConfig,
    pub image_mode: ImageMode,
    pub store: Box<dyn ContentStorage>,
    pub keeper: Box<dyn TitleKeeper>,
    pub events: EventSink,
}

pub struct InstallServer {
    server: Server,
    manager: Arc<InstallManager>,
}

impl InstallServer {
    pub fn start(
        pipe: Box<dyn BulkPipe>,
        options: InstallServerOptions,
        stop: StopToken,
    ) -> Self {
        let manager = InstallManager::new(options.store, options.keeper, options.image_mode);

        let backend = InstallFs::new(
            "install",
            "Install (NSP, XCI, NSZ, XCZ)",
            Arc::clone(&manager),
        );

        let server = Server::start(
            pipe,
            options.config,
            vec![StorageBackend {
                storage_id: INSTALL_STORAGE_ID,
                backend: Box::new(backend),
            }],
            options.events,
            stop,
        );

        InstallServer { server, manager }
    }

    /// Progress, title id and completion queries while serving.
    pub fn manager(&self) -> &Arc<InstallManager> {
        &self.manager
    }

    pub fn stop(self) {
        // Unwind any in-flight install first: finalizing disables the
        // pull-mode queue, so a transfer thread blocked on a full queue
        // observes the shutdown instead of waiting for a consumer that
        // will never come back.
        if self.manager.is_active() {
            self.manager.close();
        }
        self.server.stop();
    }
}
