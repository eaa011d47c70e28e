//! The virtual "install" storage: a filesystem backend whose files are an
//! illusion. Creating a recognized archive name opens a stream install;
//! the bytes the host writes are fed to the demultiplexer instead of any
//! disk. A small in-memory list of recently created entries is all that
//! persists, and only until the session ends.

use std::collections::HashMap;
use std::sync::Arc;

use mtp_gadget::proxy::{
    open_mode, strip_storage_prefix, DirEntry, DirHandle, EntryType, FileHandle, FileSystemProxy,
};
use mtp_gadget::{Error, Result};

use crate::manager::InstallManager;

/// Extensions the install sink accepts.
const INSTALLABLE: [&str; 4] = ["nsp", "nsz", "xci", "xcz"];

struct VfsEntry {
    name: String,
    size: u64,
}

struct OpenFile {
    index: usize,
    mode: u32,
}

pub struct InstallFs {
    name: String,
    display_name: String,
    manager: Arc<InstallManager>,
    entries: Vec<VfsEntry>,
    files: HashMap<u64, OpenFile>,
    dirs: HashMap<u64, usize>,
    next_handle: u64,
    /// Handle currently streaming into the installer, if any.
    writing: Option<u64>,
}

impl InstallFs {
    pub fn new(name: &str, display_name: &str, manager: Arc<InstallManager>) -> Self {
        InstallFs {
            name: name.to_owned(),
            display_name: display_name.to_owned(),
            manager,
            entries: Vec::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_handle: 1,
            writing: None,
        }
    }

    fn file_name<'a>(&self, path: &'a str) -> Result<&'a str> {
        let rel = strip_storage_prefix(&self.name, path);
        let name = rel.rsplit('/').next().unwrap_or(rel);
        if name.is_empty() {
            Err(Error::InvalidArgument)
        } else {
            Ok(name)
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    fn installable(name: &str) -> bool {
        name.rfind('.')
            .map(|dot| {
                let ext = name[dot + 1..].to_ascii_lowercase();
                INSTALLABLE.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

fn already_exists() -> Error {
    Error::Fs(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "entry exists",
    ))
}

/// The sink's refusals surface to the host as a generic failed
/// transaction, not as a protocol-level "operation not supported".
fn not_supported() -> Error {
    Error::Fs(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

impl FileSystemProxy for InstallFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn total_space(&mut self, _path: &str) -> Result<u64> {
        self.manager
            .space()
            .map(|(total, _)| total)
            .map_err(|_| not_supported())
    }

    fn free_space(&mut self, _path: &str) -> Result<u64> {
        self.manager
            .space()
            .map(|(_, free)| free)
            .map_err(|_| not_supported())
    }

    fn entry_type(&mut self, path: &str) -> Result<EntryType> {
        let rel = strip_storage_prefix(&self.name, path);
        if rel.is_empty() || rel == "/" {
            return Ok(EntryType::Dir);
        }
        let name = self.file_name(path)?;
        Ok(if self.index_of(name).is_some() {
            EntryType::File
        } else {
            EntryType::Missing
        })
    }

    fn create_file(&mut self, path: &str, size: u64, _options: u32) -> Result<()> {
        let name = self.file_name(path)?;
        if !Self::installable(name) {
            return Err(not_supported());
        }
        if self.index_of(name).is_some() {
            return Err(already_exists());
        }
        self.entries.push(VfsEntry {
            name: name.to_owned(),
            size,
        });
        Ok(())
    }

    fn delete_file(&mut self, path: &str) -> Result<()> {
        let name = self.file_name(path)?;
        let index = self.index_of(name).ok_or(Error::InvalidArgument)?;
        self.entries.remove(index);
        Ok(())
    }

    fn rename_file(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let old_name = self.file_name(old_path)?;
        let new_name = self.file_name(new_path)?.to_owned();
        let index = self.index_of(old_name).ok_or(Error::InvalidArgument)?;
        if self.index_of(&new_name).is_some() {
            return Err(already_exists());
        }
        self.entries[index].name = new_name;
        Ok(())
    }

    fn open_file(&mut self, path: &str, mode: u32) -> Result<FileHandle> {
        let name = self.file_name(path)?;
        if !Self::installable(name) {
            return Err(not_supported());
        }
        let index = self.index_of(name).ok_or(Error::InvalidArgument)?;

        let handle = self.alloc_handle();
        if mode & open_mode::WRITE != 0 {
            // One install at a time.
            if self.writing.is_some() {
                return Err(not_supported());
            }
            let entry = &self.entries[index];
            if !self.manager.start(&entry.name, entry.size) {
                return Err(not_supported());
            }
            self.writing = Some(handle);
        }
        self.files.insert(handle, OpenFile { index, mode });
        Ok(handle)
    }

    fn file_size(&mut self, file: FileHandle) -> Result<u64> {
        let open = self.files.get(&file).ok_or(Error::InvalidArgument)?;
        Ok(self.entries[open.index].size)
    }

    fn set_file_size(&mut self, file: FileHandle, size: u64) -> Result<()> {
        let open = self.files.get(&file).ok_or(Error::InvalidArgument)?;
        self.entries[open.index].size = size;
        Ok(())
    }

    fn read_file(&mut self, _file: FileHandle, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(not_supported())
    }

    fn write_file(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<()> {
        let open = self.files.get(&file).ok_or(Error::InvalidArgument)?;
        if !self.manager.feed(buf, offset) {
            return Err(not_supported());
        }
        let entry = &mut self.entries[open.index];
        entry.size = entry.size.max(offset + buf.len() as u64);
        Ok(())
    }

    fn close_file(&mut self, file: FileHandle) {
        if let Some(open) = self.files.remove(&file) {
            if open.mode & open_mode::WRITE != 0 && self.writing == Some(file) {
                self.manager.close();
                self.writing = None;
            }
        }
    }

    fn create_dir(&mut self, _path: &str) -> Result<()> {
        Err(not_supported())
    }

    fn delete_dir_recursive(&mut self, _path: &str) -> Result<()> {
        Err(not_supported())
    }

    fn rename_dir(&mut self, _old_path: &str, _new_path: &str) -> Result<()> {
        Err(not_supported())
    }

    fn open_dir(&mut self, _path: &str) -> Result<DirHandle> {
        let handle = self.alloc_handle();
        self.dirs.insert(handle, 0);
        Ok(handle)
    }

    fn read_dir(&mut self, dir: DirHandle, max_entries: usize) -> Result<Vec<DirEntry>> {
        let pos = self.dirs.get_mut(&dir).ok_or(Error::InvalidArgument)?;
        let n = max_entries.min(self.entries.len().saturating_sub(*pos));
        let batch = self.entries[*pos..*pos + n]
            .iter()
            .map(|e| DirEntry {
                name: e.name.clone(),
                kind: EntryType::File,
                size: e.size,
            })
            .collect();
        *pos += n;
        Ok(batch)
    }

    fn dir_entry_count(&mut self, dir: DirHandle) -> Result<u64> {
        self.dirs
            .get(&dir)
            .map(|_| self.entries.len() as u64)
            .ok_or(Error::InvalidArgument)
    }

    fn close_dir(&mut self, dir: DirHandle) {
        self.dirs.remove(&dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ImageMode;
    use crate::store::{MemoryContentStore, MemoryTitleKeeper};

    fn install_fs() -> InstallFs {
        let manager = InstallManager::new(
            Box::new(MemoryContentStore::new()),
            Box::new(MemoryTitleKeeper::new()),
            ImageMode::Buffered,
        );
        InstallFs::new("install", "Install (NSP, XCI, NSZ, XCZ)", manager)
    }

    #[test]
    fn only_archive_extensions_can_be_created() {
        let mut fs = install_fs();
        assert!(fs.create_file("install/notes.txt", 10, 0).is_err());
        fs.create_file("install/game.nsp", 10, 0).unwrap();
        assert_eq!(fs.entry_type("install/game.nsp").unwrap(), EntryType::File);
        assert_eq!(fs.entry_type("install").unwrap(), EntryType::Dir);
        assert_eq!(fs.entry_type("install/other.nsp").unwrap(), EntryType::Missing);
    }

    #[test]
    fn duplicate_names_are_rejected_case_insensitively() {
        let mut fs = install_fs();
        fs.create_file("install/a.nsp", 0, 0).unwrap();
        assert!(fs.create_file("install/A.NSP", 0, 0).is_err());
    }

    #[test]
    fn second_concurrent_writer_is_refused() {
        let mut fs = install_fs();
        fs.create_file("install/a.nsp", 100, 0).unwrap();
        fs.create_file("install/b.nsp", 100, 0).unwrap();
        let _first = fs
            .open_file("install/a.nsp", open_mode::WRITE | open_mode::APPEND)
            .unwrap();
        assert!(fs.open_file("install/b.nsp", open_mode::WRITE).is_err());
    }

    #[test]
    fn reads_are_not_a_thing_here() {
        let mut fs = install_fs();
        fs.create_file("install/a.nsp", 4, 0).unwrap();
        let f = fs.open_file("install/a.nsp", open_mode::READ).unwrap();
        let mut buf = [0u8; 4];
        assert!(fs.read_file(f, 0, &mut buf).is_err());
    }

    #[test]
    fn directory_listing_reflects_created_entries() {
        let mut fs = install_fs();
        fs.create_file("install/a.nsp", 5, 0).unwrap();
        fs.create_file("install/b.xci", 6, 0).unwrap();
        let d = fs.open_dir("install").unwrap();
        assert_eq!(fs.dir_entry_count(d).unwrap(), 2);
        let batch = fs.read_dir(d, 32).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name, "a.nsp");
        assert_eq!(batch[1].size, 6);
        fs.close_dir(d);
    }
}
