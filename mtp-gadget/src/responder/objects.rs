//! Object enumeration, transfer, creation and deletion handlers.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{Command, Responder};
use crate::codec::{DataBuilder, DataParser};
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::protocol::*;
use crate::proxy::{create_option, open_mode, EntryType};
use crate::transfer::{transfer, Mode};
use crate::usb::BulkPipe;

const FOUR_GIB: u64 = 4 * 1024 * 1024 * 1024;

/// A following data phase must match the command that announced it.
pub(super) fn validate_data_header(header: &ContainerHeader, request: &ContainerHeader) -> Result<()> {
    if header.kind != CONTAINER_DATA {
        return Err(Error::UnknownRequestType);
    }
    if header.code != request.code || header.trans_id != request.trans_id {
        return Err(Error::OperationNotSupported);
    }
    Ok(())
}

/// Everything SendObjectInfo learns from the host's metadata block.
#[derive(Default)]
struct IncomingObjectInfo {
    object_format: u16,
    filename: String,
}

impl Responder {
    // -----------------------------------------------------------------------
    // GetObjectHandles
    // -----------------------------------------------------------------------

    pub(super) fn get_object_handles(&mut self, cmd: &Command) -> Result<()> {
        let mut storage_id = cmd.param(0);
        let _format = cmd.param(1);
        let mut parent = cmd.param(2);

        if storage_id == ALL_STORAGE {
            storage_id = self.default_storage_id();
        }
        // Enumerating the storage root goes through its reserved handle.
        if parent == ROOT_PARENT {
            parent = storage_id;
        }

        let key = self.object_by_handle(parent)?;
        let index = self.storage_for(key)?;
        let path = self.db.name_of(key).to_owned();

        let dir = self.storages[index].fs.open_dir(&path)?;
        let result = self.emit_object_handles(index, key, dir);
        self.storages[index].fs.close_dir(dir);
        result?;

        self.ok_response()
    }

    fn emit_object_handles(&mut self, index: usize, parent: crate::object::ObjKey, dir: u64) -> Result<()> {
        let count = self.storages[index].fs.dir_entry_count(dir)?;

        let mut b = DataBuilder::new();
        b.add_data_header(self.pipe.as_mut(), &self.request, 4 + count * 4)?;
        b.add(count as u32);

        // Lazily mint handles for whatever the backend reports. A handle
        // minted on a previous pass is reused, so a directory that changes
        // mid-enumeration cannot introduce duplicates.
        loop {
            let batch = self.storages[index]
                .fs
                .read_dir(dir, DIRECTORY_READ_SIZE)?;
            for entry in &batch {
                let child = self.db.create_or_find_child(parent, &entry.name);
                let handle = match self.db.handle_of(child) {
                    Some(handle) => handle,
                    None => self.db.register(child),
                };
                b.add(handle);
            }
            if batch.len() < DIRECTORY_READ_SIZE {
                break;
            }
        }

        b.flush(self.pipe.as_mut())
    }

    // -----------------------------------------------------------------------
    // GetObjectInfo
    // -----------------------------------------------------------------------

    pub(super) fn get_object_info(&mut self, cmd: &Command) -> Result<()> {
        let object_id = cmd.param(0);
        let key = self.object_by_handle(object_id)?;

        let (format, association, filename, size, parent) =
            if let Some(index) = self.storage_index(object_id) {
                // Storage roots present as folders named for the backend.
                let display = self.storages[index].fs.display_name().to_owned();
                (FMT_ASSOCIATION, ASSOC_GENERIC_FOLDER, display, 0u64, 0u32)
            } else {
                let index = self.storage_for(key)?;
                let path = self.db.name_of(key).to_owned();
                let entry_type = self.storages[index].fs.entry_type(&path)?;
                let size = if entry_type == EntryType::File {
                    self.sized_file(index, &path)?
                } else {
                    0
                };
                let (format, association) = if entry_type == EntryType::Dir {
                    (FMT_ASSOCIATION, ASSOC_GENERIC_FOLDER)
                } else {
                    (FMT_UNDEFINED, ASSOC_UNDEFINED)
                };
                let filename = self.db.file_name(key).to_owned();
                (format, association, filename, size, self.db.parent_of(key))
            };

        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        b.add(self.db.storage_of(key));
        b.add(format);
        b.add(0u16); // protection status
        b.add(u32::try_from(size).unwrap_or(u32::MAX));
        b.add(0u16); // thumb format
        b.add(0u32); // thumb compressed size
        b.add(0u32); // thumb width
        b.add(0u32); // thumb height
        b.add(0u32); // image width
        b.add(0u32); // image height
        b.add(0u32); // image depth
        b.add(if parent == ROOT_PARENT { 0 } else { parent });
        b.add(association);
        b.add(0u32); // association description
        b.add(0u32); // sequence number
        b.add_string(&filename);
        b.add_string(""); // capture date
        b.add_string(""); // modification date
        b.add_string(""); // keywords
        b.commit_variable(self.pipe.as_mut())?;

        self.ok_response()
    }

    /// Size of a file path, via a short-lived read handle.
    pub(super) fn sized_file(&mut self, index: usize, path: &str) -> Result<u64> {
        let fs = &mut self.storages[index].fs;
        let file = fs.open_file(path, open_mode::READ)?;
        let size = fs.file_size(file);
        fs.close_file(file);
        size
    }

    // -----------------------------------------------------------------------
    // GetObject
    // -----------------------------------------------------------------------

    pub(super) fn get_object(&mut self, cmd: &Command) -> Result<()> {
        let object_id = cmd.param(0);
        let key = self.object_by_handle(object_id)?;
        let index = self.storage_for(key)?;
        let path = self.db.name_of(key).to_owned();

        let file = self.storages[index].fs.open_file(&path, open_mode::READ)?;
        self.events.emit(SessionEvent::ReadBegin { path: path.clone() });
        let result = self.stream_object_out(index, file, &path);
        self.storages[index].fs.close_file(file);
        self.events.emit(SessionEvent::ReadEnd { path });
        result?;

        self.ok_response()
    }

    fn stream_object_out(&mut self, index: usize, file: u64, path: &str) -> Result<()> {
        let size = self.storages[index].fs.file_size(file)?;

        let mut b = DataBuilder::new();
        b.add_data_header(self.pipe.as_mut(), &self.request, size)?;

        let mode = if self.storages[index].fs.prefers_single_threaded(size, true) {
            Mode::SingleThreadedIfSmaller
        } else {
            Mode::MultiThreaded
        };

        let Responder {
            pipe,
            storages,
            events,
            ..
        } = self;
        let fs = &mut storages[index].fs;
        let pipe: &mut dyn BulkPipe = pipe.as_mut();

        transfer(
            size,
            |buf, offset| fs.read_file(file, offset, buf),
            |buf, offset| {
                b.add_buffer(pipe, buf)?;
                events.emit(SessionEvent::ReadProgress {
                    offset,
                    size: buf.len() as u64,
                });
                Ok(())
            },
            mode,
        )?;

        b.flush(pipe)
    }

    // -----------------------------------------------------------------------
    // SendObjectInfo
    // -----------------------------------------------------------------------

    pub(super) fn send_object_info(&mut self, cmd: &Command) -> Result<()> {
        // A new announcement abandons any pending prop list.
        self.send_prop_list = None;

        let storage_id = cmd.param(0);
        let mut parent = cmd.param(1);

        let info = {
            let mut dp = DataParser::new(self.pipe.as_mut());
            let header = dp.read_header()?;
            validate_data_header(&header, &self.request)?;

            let mut info = IncomingObjectInfo::default();
            let _storage: u32 = dp.read()?;
            info.object_format = dp.read()?;
            let _protection: u16 = dp.read()?;
            let _compressed_size: u32 = dp.read()?;
            let _thumb_format: u16 = dp.read()?;
            let _thumb_size: u32 = dp.read()?;
            let _thumb_width: u32 = dp.read()?;
            let _thumb_height: u32 = dp.read()?;
            let _image_width: u32 = dp.read()?;
            let _image_height: u32 = dp.read()?;
            let _image_depth: u32 = dp.read()?;
            let _parent: u32 = dp.read()?;
            let _association_type: u16 = dp.read()?;
            let _association_desc: u32 = dp.read()?;
            let _sequence: u32 = dp.read()?;
            info.filename = dp.read_string()?;
            let _capture_date = dp.read_string()?;
            let _modification_date = dp.read_string()?;
            let _keywords = dp.read_string()?;
            dp.finalize()?;
            info
        };

        if parent == ROOT_PARENT {
            parent = storage_id;
        }
        let parent_key = self.object_by_handle(parent)?;

        let new_object = self.db.create_or_find_child(parent_key, &info.filename);
        let handle = match self.db.handle_of(new_object) {
            Some(handle) => handle,
            None => self.db.register(new_object),
        };

        let result = self.create_on_backend(new_object, info.object_format, 0, 0);
        if let Err(e) = result {
            self.db.delete(new_object);
            return Err(e);
        }

        let parent_handle = self.db.handle_of(parent_key).unwrap_or(parent);
        let reported_parent = if parent == storage_id { 0 } else { parent };
        self.write_response(RSP_OK, &[parent_handle, reported_parent, handle])
    }

    /// Create the file or directory backing a freshly announced object and
    /// remember which handle the next SendObject targets.
    pub(super) fn create_on_backend(
        &mut self,
        key: crate::object::ObjKey,
        format: u16,
        size: u64,
        options: u32,
    ) -> Result<()> {
        let index = self.storage_for(key)?;
        let path = self.db.name_of(key).to_owned();
        let handle = self.db.handle_of(key).unwrap_or(0);

        if format == FMT_ASSOCIATION {
            self.storages[index].fs.create_dir(&path)?;
            self.events.emit(SessionEvent::CreateFolder { path });
            self.send_object_id = 0;
        } else {
            self.storages[index].fs.create_file(&path, size, options)?;
            self.events.emit(SessionEvent::CreateFile { path });
            self.send_object_id = handle;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // SendObject
    // -----------------------------------------------------------------------

    pub(super) fn send_object(&mut self) -> Result<()> {
        let result = self.send_object_impl();
        // The announced handle is good for exactly one data stream.
        self.send_object_id = 0;
        result?;
        self.ok_response()
    }

    fn send_object_impl(&mut self) -> Result<()> {
        let key = self.object_by_handle(self.send_object_id)?;
        let index = self.storage_for(key)?;
        let path = self.db.name_of(key).to_owned();

        let Responder {
            pipe,
            storages,
            events,
            request,
            send_prop_list,
            ..
        } = self;
        let fs = &mut storages[index].fs;

        let mut dp = DataParser::new(pipe.as_mut());
        let header = dp.read_header()?;
        validate_data_header(&header, request)?;

        let file = fs.open_file(&path, open_mode::WRITE | open_mode::APPEND)?;
        events.emit(SessionEvent::WriteBegin { path: path.clone() });

        let written = AtomicU64::new(0);
        let result = (|| {
            // Without an announced size, fall back to the container length,
            // or to a 4 GiB ceiling when the host declared it unknown.
            let file_size = if let Some(pending) = send_prop_list {
                pending.size
            } else if header.length != u32::MAX
                && header.length as usize > CONTAINER_HEADER_SIZE
            {
                let size = (header.length as u64) - CONTAINER_HEADER_SIZE as u64;
                fs.set_file_size(file, size)?;
                size
            } else {
                fs.set_file_size(file, 0)?;
                FOUR_GIB
            };

            let mode = if fs.prefers_single_threaded(0, false) {
                Mode::SingleThreaded
            } else {
                Mode::MultiThreaded
            };

            let mut done = false;
            transfer(
                file_size,
                |buf, _offset| {
                    if done {
                        return Ok(0);
                    }
                    match dp.read_buffer(buf) {
                        Ok(n) => Ok(n),
                        Err(Error::EndOfTransmission) => {
                            done = true;
                            Ok(0)
                        }
                        Err(e) => Err(e),
                    }
                },
                |buf, offset| {
                    fs.write_file(file, offset, buf)?;
                    written.store(offset + buf.len() as u64, Ordering::Relaxed);
                    events.emit(SessionEvent::WriteProgress {
                        offset,
                        size: buf.len() as u64,
                    });
                    Ok(())
                },
                mode,
            )?;

            // Trim preallocation down to what actually arrived.
            let received = written.load(Ordering::Relaxed);
            if received != file_size {
                let _ = fs.set_file_size(file, received);
            }
            Ok(())
        })();

        fs.close_file(file);
        events.emit(SessionEvent::WriteEnd { path });
        result
    }

    // -----------------------------------------------------------------------
    // DeleteObject
    // -----------------------------------------------------------------------

    pub(super) fn delete_object(&mut self, cmd: &Command) -> Result<()> {
        let object_id = cmd.param(0);

        // Storage roots are not deletable.
        if self.storage_index(object_id).is_some() {
            return Err(Error::InvalidObjectId);
        }
        let key = self.object_by_handle(object_id)?;
        let index = self.storage_for(key)?;
        let path = self.db.name_of(key).to_owned();

        let entry_type = self.storages[index].fs.entry_type(&path)?;
        if entry_type == EntryType::Dir {
            self.events.emit(SessionEvent::DeleteFolder { path: path.clone() });
            self.storages[index].fs.delete_dir_recursive(&path)?;
        } else {
            self.events.emit(SessionEvent::DeleteFile { path: path.clone() });
            self.storages[index].fs.delete_file(&path)?;
        }

        self.db.delete(key);
        self.ok_response()
    }
}

// SendObjectPropList's big-file threshold lives here so the two creation
// paths share it.
pub(super) fn create_options_for(size: u64) -> u32 {
    if size >= FOUR_GIB {
        create_option::BIG_FILE
    } else {
        0
    }
}
