//! MTP object-property handlers.
//!
//! Six properties are served. The first five are read-only; only
//! ObjectFileName is writable, and writing it renames the object on disk.

use super::objects::{create_options_for, validate_data_header};
use super::{Command, PendingPropList, Responder};
use crate::codec::{DataBuilder, DataParser};
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::object::ObjKey;
use crate::protocol::*;
use crate::proxy::EntryType;

fn is_supported_property(code: u16) -> bool {
    SUPPORTED_OBJECT_PROPERTIES.contains(&code)
}

/// A fresh object name must be a single non-empty path component.
fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidPropertyValue);
    }
    Ok(())
}

impl Responder {
    pub(super) fn get_object_props_supported(&mut self) -> Result<()> {
        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        b.add_array(&SUPPORTED_OBJECT_PROPERTIES);
        b.commit_variable(self.pipe.as_mut())?;
        self.ok_response()
    }

    pub(super) fn get_object_prop_desc(&mut self, cmd: &Command) -> Result<()> {
        let property = cmd.param(0) as u16;
        let _object_format = cmd.param(1) as u16;

        if !is_supported_property(property) {
            return Err(Error::UnknownPropertyCode);
        }

        let default_storage = self.default_storage_id();

        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        b.add(property);

        // Each property code is described independently: data type, whether
        // the host may set it, and a default value.
        match property {
            PROP_PERSISTENT_UNIQUE_OBJECT_IDENTIFIER => {
                b.add(TYPE_U128);
                b.add(PROP_GET);
                b.add(0u128);
            }
            PROP_OBJECT_SIZE => {
                b.add(TYPE_U64);
                b.add(PROP_GET);
                b.add(0u64);
            }
            PROP_STORAGE_ID => {
                b.add(TYPE_U32);
                b.add(PROP_GET);
                b.add(default_storage);
            }
            PROP_PARENT_OBJECT => {
                b.add(TYPE_U32);
                b.add(PROP_GET);
                b.add(default_storage);
            }
            PROP_OBJECT_FORMAT => {
                b.add(TYPE_U16);
                b.add(PROP_GET);
                b.add(FMT_UNDEFINED);
            }
            PROP_OBJECT_FILE_NAME => {
                b.add(TYPE_STRING);
                b.add(PROP_GET_SET);
                b.add_string("");
            }
            _ => unreachable!("checked above"),
        }

        // Group code is required in the response but otherwise unused.
        b.add(PROP_GROUP_DEFAULT);
        b.add(PROP_FORM_NONE);
        b.commit_variable(self.pipe.as_mut())?;

        self.ok_response()
    }

    pub(super) fn get_object_prop_value(&mut self, cmd: &Command) -> Result<()> {
        let object_id = cmd.param(0);
        let property = cmd.param(1) as u16;

        if !is_supported_property(property) {
            return Err(Error::UnknownPropertyCode);
        }
        let key = self.object_by_handle(object_id)?;

        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        self.add_property_value(&mut b, key, object_id, property, false)?;
        b.commit_variable(self.pipe.as_mut())?;

        self.ok_response()
    }

    pub(super) fn get_object_prop_list(&mut self, cmd: &Command) -> Result<()> {
        let object_id = cmd.param(0);
        let object_format = cmd.param(1);
        let property = cmd.param(2) as i32;
        let group = cmd.param(3);
        let depth = cmd.param(4);

        if object_format != 0 {
            return Err(Error::InvalidArgument);
        }
        if property != -1 && !is_supported_property(property as u16) {
            return Err(Error::UnknownPropertyCode);
        }
        if group != PROP_GROUP_DEFAULT {
            return Err(Error::GroupSpecified);
        }
        if depth != 0 {
            return Err(Error::DepthSpecified);
        }
        let key = self.object_by_handle(object_id)?;

        let include = |code: u16| property == -1 || code as i32 == property;
        let count = SUPPORTED_OBJECT_PROPERTIES
            .iter()
            .filter(|&&code| include(code))
            .count() as u32;

        let mut b = DataBuilder::new();
        b.begin_variable(&self.request);
        b.add(count);
        for code in SUPPORTED_OBJECT_PROPERTIES {
            if !include(code) {
                continue;
            }
            b.add(object_id);
            b.add(code);
            self.add_property_value(&mut b, key, object_id, code, true)?;
        }
        b.commit_variable(self.pipe.as_mut())?;

        self.ok_response()
    }

    /// Append one property value, optionally preceded by its type code (the
    /// prop-list tuples carry types, single values do not).
    fn add_property_value(
        &mut self,
        b: &mut DataBuilder,
        key: ObjKey,
        object_id: u32,
        property: u16,
        with_type: bool,
    ) -> Result<()> {
        match property {
            PROP_PERSISTENT_UNIQUE_OBJECT_IDENTIFIER => {
                if with_type {
                    b.add(TYPE_U128);
                }
                b.add(object_id as u128);
            }
            PROP_OBJECT_SIZE => {
                let size = self.object_size(key)?;
                if with_type {
                    b.add(TYPE_U64);
                }
                b.add(size);
            }
            PROP_STORAGE_ID => {
                if with_type {
                    b.add(TYPE_U32);
                }
                b.add(self.db.storage_of(key));
            }
            PROP_PARENT_OBJECT => {
                if with_type {
                    b.add(TYPE_U32);
                }
                b.add(self.db.parent_of(key));
            }
            PROP_OBJECT_FORMAT => {
                let entry_type = self.object_entry_type(key)?;
                if with_type {
                    b.add(TYPE_U16);
                }
                b.add(if entry_type == EntryType::File {
                    FMT_UNDEFINED
                } else {
                    FMT_ASSOCIATION
                });
            }
            PROP_OBJECT_FILE_NAME => {
                if with_type {
                    b.add(TYPE_STRING);
                }
                let name = self.db.file_name(key).to_owned();
                b.add_string(&name);
            }
            _ => return Err(Error::UnknownPropertyCode),
        }
        Ok(())
    }

    fn object_entry_type(&mut self, key: ObjKey) -> Result<EntryType> {
        let index = self.storage_for(key)?;
        let path = self.db.name_of(key).to_owned();
        self.storages[index].fs.entry_type(&path)
    }

    /// Directories report size zero; files are sized via a short-lived
    /// read handle.
    fn object_size(&mut self, key: ObjKey) -> Result<u64> {
        if self.object_entry_type(key)? == EntryType::Dir {
            return Ok(0);
        }
        let index = self.storage_for(key)?;
        let path = self.db.name_of(key).to_owned();
        self.sized_file(index, &path)
    }

    // -----------------------------------------------------------------------
    // SendObjectPropList
    // -----------------------------------------------------------------------

    pub(super) fn send_object_prop_list(&mut self, cmd: &Command) -> Result<()> {
        self.send_prop_list = None;

        let storage_id = cmd.param(0);
        let mut parent = cmd.param(1);
        let format = cmd.param(2) as u16;
        let size = ((cmd.param(3) as u64) << 32) | cmd.param(4) as u64;

        if parent == ROOT_PARENT {
            parent = storage_id;
        }
        let parent_key = self.object_by_handle(parent)?;

        let filename = {
            let mut dp = DataParser::new(self.pipe.as_mut());
            let header = dp.read_header()?;
            validate_data_header(&header, &self.request)?;

            let count: u32 = dp.read()?;
            let mut filename = String::new();
            for _ in 0..count {
                let _object: u32 = dp.read()?;
                let property: u16 = dp.read()?;
                let value_type: u16 = dp.read()?;
                match property {
                    PROP_OBJECT_FILE_NAME => {
                        if value_type != TYPE_STRING {
                            return Err(Error::UnknownPropertyCode);
                        }
                        filename = dp.read_string()?;
                    }
                    _ => return Err(Error::UnknownPropertyCode),
                }
            }
            dp.finalize()?;
            filename
        };
        validate_file_name(&filename)?;

        let new_object = self.db.create_or_find_child(parent_key, &filename);
        let handle = match self.db.handle_of(new_object) {
            Some(handle) => handle,
            None => self.db.register(new_object),
        };

        self.send_prop_list = Some(PendingPropList { size });

        let result = self.create_on_backend(new_object, format, size, create_options_for(size));
        if let Err(e) = result {
            self.db.delete(new_object);
            return Err(e);
        }

        let parent_handle = self.db.handle_of(parent_key).unwrap_or(parent);
        let reported_parent = if parent == storage_id { 0 } else { parent };
        self.write_response(RSP_OK, &[parent_handle, reported_parent, handle])
    }

    // -----------------------------------------------------------------------
    // SetObjectPropValue (rename)
    // -----------------------------------------------------------------------

    pub(super) fn set_object_prop_value(&mut self, cmd: &Command) -> Result<()> {
        let object_id = cmd.param(0);
        let property = cmd.param(1) as u16;

        let name = {
            let mut dp = DataParser::new(self.pipe.as_mut());
            let header = dp.read_header()?;
            validate_data_header(&header, &self.request)?;
            if property != PROP_OBJECT_FILE_NAME {
                return Err(Error::UnknownPropertyCode);
            }
            let name = dp.read_string()?;
            dp.finalize()?;
            name
        };
        validate_file_name(&name)?;

        let key = self.object_by_handle(object_id)?;
        let index = self.storage_for(key)?;
        let old_path = self.db.name_of(key).to_owned();

        // The rename target joins the database provisionally; it only
        // assumes the old handle once the backend rename went through.
        let new_key = self.db.create_or_find_sibling(key, &name);
        let new_path = self.db.name_of(new_key).to_owned();

        let renamed = {
            let fs = &mut self.storages[index].fs;
            fs.entry_type(&old_path).and_then(|entry_type| {
                if entry_type == EntryType::Dir {
                    fs.rename_dir(&old_path, &new_path)?;
                    Ok(true)
                } else {
                    fs.rename_file(&old_path, &new_path)?;
                    Ok(false)
                }
            })
        };

        let was_dir = match renamed {
            Ok(was_dir) => was_dir,
            Err(e) => {
                // Drop the provisional entry, but never an object that is
                // already visible under a handle of its own.
                if !self.db.is_registered(new_key) {
                    self.db.delete(new_key);
                }
                return Err(e);
            }
        };

        if was_dir {
            self.events.emit(SessionEvent::RenameFolder {
                path: old_path,
                new_path,
            });
        } else {
            self.events.emit(SessionEvent::RenameFile {
                path: old_path,
                new_path,
            });
        }

        // The new entry assumes the old object's handle.
        self.db.delete(key);
        self.db.register_as(new_key, object_id);

        self.ok_response()
    }
}
