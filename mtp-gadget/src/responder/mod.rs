//! The PTP responder: reads a command container, dispatches to a handler,
//! optionally consumes or produces a data phase, and always answers with a
//! response container so the host state machine stays aligned.

mod objects;
mod properties;

use crate::codec::{self, DataBuilder, DataParser};
use crate::error::{Error, Result};
use crate::events::{EventSink, SessionEvent};
use crate::object::{ObjKey, ObjectDatabase};
use crate::protocol::*;
use crate::proxy::ProxyFs;
use crate::usb::BulkPipe;

/// Strings reported by GetDeviceInfo.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        DeviceIdentity {
            manufacturer: "mtp-gadget".into(),
            model: "mtp-gadget".into(),
            firmware_version: "1.0".into(),
            serial: "00000000".into(),
        }
    }
}

/// One configured storage: the id the host sees and the wrapped backend.
pub struct Storage {
    pub id: u32,
    pub fs: ProxyFs,
}

/// A decoded command container. At most five u32 parameters follow the
/// header; absent parameters read as zero.
#[derive(Debug, Clone, Copy, Default)]
struct Command {
    header: ContainerHeader,
    params: [u32; 5],
}

impl Command {
    fn param(&self, index: usize) -> u32 {
        self.params[index]
    }
}

/// Pending object size learned from SendObjectPropList.
#[derive(Debug, Clone, Copy)]
struct PendingPropList {
    size: u64,
}

pub struct Responder {
    pipe: Box<dyn BulkPipe>,
    storages: Vec<Storage>,
    db: ObjectDatabase,
    identity: DeviceIdentity,
    events: EventSink,
    session_open: bool,
    /// Retained so a following data phase can be validated against it.
    request: ContainerHeader,
    /// Handle the next SendObject streams into (0 = none).
    send_object_id: u32,
    send_prop_list: Option<PendingPropList>,
}

impl Responder {
    pub fn new(
        pipe: Box<dyn BulkPipe>,
        storages: Vec<Storage>,
        identity: DeviceIdentity,
        events: EventSink,
    ) -> Self {
        Responder {
            pipe,
            storages,
            db: ObjectDatabase::new(),
            identity,
            events,
            session_open: false,
            request: ContainerHeader::default(),
            send_object_id: 0,
            send_prop_list: None,
        }
    }

    /// Serve transactions until a stop request or the transport dies.
    pub fn run(&mut self) {
        log::info!("responder loop started");
        loop {
            match self.handle_request() {
                Ok(()) => {}
                Err(Error::StopRequested) => {
                    log::info!("stop requested, leaving responder loop");
                    break;
                }
                Err(e) => {
                    log::error!("transport error, leaving responder loop: {e}");
                    break;
                }
            }
        }
        self.force_close_session();
    }

    /// One full Command → [Data] → Response transaction.
    fn handle_request(&mut self) -> Result<()> {
        let cmd = self.read_command()?;
        self.request = cmd.header;

        if cmd.header.kind != CONTAINER_COMMAND {
            log::warn!("unexpected container type {:#06x}", cmd.header.kind);
            return self.write_response(Error::UnknownRequestType.response_code(), &[]);
        }

        log::debug!(
            "{} (trans {})",
            op_name(cmd.header.code),
            cmd.header.trans_id
        );

        let code = cmd.header.code;
        let result = if !self.session_open
            && code != OP_GET_DEVICE_INFO
            && code != OP_OPEN_SESSION
        {
            Err(Error::SessionNotOpen)
        } else {
            self.dispatch(&cmd)
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                log::warn!("{} failed: {e}", op_name(code));
                self.write_response(e.response_code(), &[])
            }
        }
    }

    fn dispatch(&mut self, cmd: &Command) -> Result<()> {
        match cmd.header.code {
            OP_GET_DEVICE_INFO => self.get_device_info(),
            OP_OPEN_SESSION => self.open_session(),
            OP_CLOSE_SESSION => self.close_session(),
            OP_GET_STORAGE_IDS => self.get_storage_ids(),
            OP_GET_STORAGE_INFO => self.get_storage_info(cmd),
            OP_GET_OBJECT_HANDLES => self.get_object_handles(cmd),
            OP_GET_OBJECT_INFO => self.get_object_info(cmd),
            OP_GET_OBJECT => self.get_object(cmd),
            OP_SEND_OBJECT_INFO => self.send_object_info(cmd),
            OP_SEND_OBJECT => self.send_object(),
            OP_DELETE_OBJECT => self.delete_object(cmd),
            OP_GET_OBJECT_PROPS_SUPPORTED => self.get_object_props_supported(),
            OP_GET_OBJECT_PROP_DESC => self.get_object_prop_desc(cmd),
            OP_GET_OBJECT_PROP_VALUE => self.get_object_prop_value(cmd),
            OP_SET_OBJECT_PROP_VALUE => self.set_object_prop_value(cmd),
            OP_GET_OBJECT_PROP_LIST => self.get_object_prop_list(cmd),
            OP_SEND_OBJECT_PROP_LIST => self.send_object_prop_list(cmd),
            other => {
                log::warn!("unsupported operation {other:#06x}");
                Err(Error::OperationNotSupported)
            }
        }
    }

    fn read_command(&mut self) -> Result<Command> {
        let mut dp = DataParser::new(self.pipe.as_mut());
        let header = dp.read_header()?;
        let mut cmd = Command {
            header,
            params: [0; 5],
        };
        if header.kind == CONTAINER_COMMAND {
            let count = (header.length as usize)
                .saturating_sub(CONTAINER_HEADER_SIZE)
                .min(5 * 4)
                / 4;
            for i in 0..count {
                cmd.params[i] = dp.read()?;
            }
            // Hosts may pad with parameters we have no use for.
            if header.length != u32::MAX {
                dp.discard_remaining()?;
            }
            dp.finalize()?;
        }
        Ok(cmd)
    }

    pub(super) fn write_response(&mut self, code: u16, params: &[u32]) -> Result<()> {
        codec::write_response(self.pipe.as_mut(), code, self.request.trans_id, params)
    }

    fn ok_response(&mut self) -> Result<()> {
        self.write_response(RSP_OK, &[])
    }

    // -----------------------------------------------------------------------
    // Session bookkeeping
    // -----------------------------------------------------------------------

    fn force_close_session(&mut self) {
        if self.session_open {
            log::info!("closing session");
        }
        self.session_open = false;
        self.send_object_id = 0;
        self.send_prop_list = None;
        self.db.reset();
    }

    fn open_session(&mut self) -> Result<()> {
        // Opening while open silently replaces the previous session.
        self.force_close_session();
        self.session_open = true;

        for i in 0..self.storages.len() {
            let name = self.storages[i].fs.name().to_owned();
            let id = self.storages[i].id;
            let root = self.db.create_root(&name, id);
            self.db.register_as(root, id);
        }

        self.events.emit(SessionEvent::OpenSession);
        self.ok_response()
    }

    fn close_session(&mut self) -> Result<()> {
        self.force_close_session();
        self.events.emit(SessionEvent::CloseSession);
        self.ok_response()
    }

    // -----------------------------------------------------------------------
    // Device and storage queries
    // -----------------------------------------------------------------------

    fn get_device_info(&mut self) -> Result<()> {
        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        b.add(MTP_STANDARD_VERSION);
        b.add(MTP_VENDOR_EXTENSION_ID);
        b.add(MTP_STANDARD_VERSION);
        b.add_string(MTP_VENDOR_EXTENSION_DESC);
        b.add(MTP_FUNCTIONAL_MODE);
        b.add_array(&SUPPORTED_OPERATIONS);
        b.add_array::<u16>(&[]); // events
        b.add_array::<u16>(&[]); // device properties
        b.add_array::<u16>(&[]); // capture formats
        b.add_array(&SUPPORTED_PLAYBACK_FORMATS);
        b.add_string(&self.identity.manufacturer);
        b.add_string(&self.identity.model);
        b.add_string(&self.identity.firmware_version);
        b.add_string(&self.identity.serial);
        b.commit_variable(self.pipe.as_mut())?;

        self.ok_response()
    }

    fn get_storage_ids(&mut self) -> Result<()> {
        let ids: Vec<u32> = self.storages.iter().map(|s| s.id).collect();
        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        b.add_array(&ids);
        b.commit_variable(self.pipe.as_mut())?;
        self.ok_response()
    }

    fn get_storage_info(&mut self, cmd: &Command) -> Result<()> {
        let storage_id = cmd.param(0);
        let index = self
            .storage_index(storage_id)
            .ok_or(Error::InvalidStorageId)?;

        let total = self.storages[index].fs.total_space("/")?;
        let free = self.storages[index].fs.free_space("/")?;
        let description = self.storages[index].fs.display_name().to_owned();

        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        b.add(STORAGE_TYPE_FIXED_MEDIA);
        b.add(FILESYSTEM_GENERIC_HIERARCHICAL);
        b.add(ACCESS_READ_WRITE);
        b.add(total);
        b.add(free);
        b.add(0u32); // free space in images
        b.add_string(&description);
        b.add_string(""); // volume label
        b.commit_variable(self.pipe.as_mut())?;

        self.ok_response()
    }

    // -----------------------------------------------------------------------
    // Lookup helpers shared by the operation handlers
    // -----------------------------------------------------------------------

    pub(super) fn storage_index(&self, storage_id: u32) -> Option<usize> {
        self.storages.iter().position(|s| s.id == storage_id)
    }

    pub(super) fn default_storage_id(&self) -> u32 {
        self.storages.first().map(|s| s.id).unwrap_or(0)
    }

    /// Resolve the storage serving `key`. Storages never disappear while a
    /// session is open, so a miss means a corrupted handle.
    pub(super) fn storage_for(&self, key: ObjKey) -> Result<usize> {
        self.storage_index(self.db.storage_of(key))
            .ok_or(Error::InvalidStorageId)
    }

    pub(super) fn object_by_handle(&self, handle: u32) -> Result<ObjKey> {
        self.db.get(handle).ok_or(Error::InvalidObjectId)
    }
}

fn op_name(code: u16) -> &'static str {
    match code {
        OP_GET_DEVICE_INFO => "GetDeviceInfo",
        OP_OPEN_SESSION => "OpenSession",
        OP_CLOSE_SESSION => "CloseSession",
        OP_GET_STORAGE_IDS => "GetStorageIds",
        OP_GET_STORAGE_INFO => "GetStorageInfo",
        OP_GET_OBJECT_HANDLES => "GetObjectHandles",
        OP_GET_OBJECT_INFO => "GetObjectInfo",
        OP_GET_OBJECT => "GetObject",
        OP_SEND_OBJECT_INFO => "SendObjectInfo",
        OP_SEND_OBJECT => "SendObject",
        OP_DELETE_OBJECT => "DeleteObject",
        OP_GET_OBJECT_PROPS_SUPPORTED => "GetObjectPropsSupported",
        OP_GET_OBJECT_PROP_DESC => "GetObjectPropDesc",
        OP_GET_OBJECT_PROP_VALUE => "GetObjectPropValue",
        OP_SET_OBJECT_PROP_VALUE => "SetObjectPropValue",
        OP_GET_OBJECT_PROP_LIST => "GetObjectPropList",
        OP_SEND_OBJECT_PROP_LIST => "SendObjectPropList",
        _ => "Unknown",
    }
}
