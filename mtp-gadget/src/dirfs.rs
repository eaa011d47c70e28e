//! Directory-backed storage: serves a host directory tree as one MTP
//! storage. This is the "memory card" backend of a stock gadget setup.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::proxy::{
    open_mode, strip_storage_prefix, DirEntry, DirHandle, EntryType, FileHandle, FileSystemProxy,
};

/// Manages open file/directory handles over a root directory.
pub struct DirFs {
    name: String,
    display_name: String,
    root: PathBuf,
    next_handle: u64,
    files: HashMap<u64, File>,
    dirs: HashMap<u64, DirState>,
}

struct DirState {
    entries: Vec<DirEntry>,
    pos: usize,
}

impl DirFs {
    pub fn new(name: &str, display_name: &str, root: impl Into<PathBuf>) -> Self {
        DirFs {
            name: name.to_owned(),
            display_name: display_name.to_owned(),
            root: root.into(),
            next_handle: 1, // start at 1 so 0 is never a valid handle
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }

    /// Resolve a storage-relative path against the root directory.
    fn resolve(&self, path: &str) -> PathBuf {
        let rel = strip_storage_prefix(&self.name, path);
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn file(&mut self, handle: u64) -> Result<&mut File> {
        self.files.get_mut(&handle).ok_or(Error::InvalidArgument)
    }
}

fn fs_err(e: std::io::Error) -> Error {
    Error::Fs(e)
}

fn scan_dir(path: &Path) -> std::io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind: if meta.is_dir() {
                EntryType::Dir
            } else {
                EntryType::File
            },
            size: if meta.is_dir() { 0 } else { meta.len() },
        });
    }
    Ok(entries)
}

impl FileSystemProxy for DirFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn total_space(&mut self, _path: &str) -> Result<u64> {
        fs2::total_space(&self.root).map_err(fs_err)
    }

    fn free_space(&mut self, _path: &str) -> Result<u64> {
        fs2::available_space(&self.root).map_err(fs_err)
    }

    fn entry_type(&mut self, path: &str) -> Result<EntryType> {
        match fs::metadata(self.resolve(path)) {
            Ok(meta) if meta.is_dir() => Ok(EntryType::Dir),
            Ok(_) => Ok(EntryType::File),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EntryType::Missing),
            Err(e) => Err(fs_err(e)),
        }
    }

    fn create_file(&mut self, path: &str, size: u64, _options: u32) -> Result<()> {
        let local = self.resolve(path);
        log::debug!("create {} ({} bytes)", local.display(), size);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local)
            .map_err(fs_err)?;
        if size > 0 {
            file.set_len(size).map_err(fs_err)?;
        }
        Ok(())
    }

    fn delete_file(&mut self, path: &str) -> Result<()> {
        let local = self.resolve(path);
        log::debug!("delete {}", local.display());
        fs::remove_file(local).map_err(fs_err)
    }

    fn rename_file(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let old = self.resolve(old_path);
        let new = self.resolve(new_path);
        log::debug!("rename {} -> {}", old.display(), new.display());
        if new.exists() {
            return Err(fs_err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "rename target exists",
            )));
        }
        fs::rename(old, new).map_err(fs_err)
    }

    fn open_file(&mut self, path: &str, mode: u32) -> Result<FileHandle> {
        let local = self.resolve(path);
        let mut opts = OpenOptions::new();
        let writes = mode & (open_mode::WRITE | open_mode::APPEND) != 0;
        if mode & open_mode::READ != 0 || !writes {
            opts.read(true);
        }
        // "append" here means the file may be extended by positional
        // writes; O_APPEND would force every write to the end instead.
        if writes {
            opts.write(true);
        }
        let file = opts.open(&local).map_err(fs_err)?;
        let handle = self.alloc_handle();
        log::debug!("open {} (mode {:#x}) -> {}", local.display(), mode, handle);
        self.files.insert(handle, file);
        Ok(handle)
    }

    fn file_size(&mut self, handle: FileHandle) -> Result<u64> {
        let file = self.file(handle)?;
        file.metadata().map(|m| m.len()).map_err(fs_err)
    }

    fn set_file_size(&mut self, handle: FileHandle, size: u64) -> Result<()> {
        self.file(handle)?.set_len(size).map_err(fs_err)
    }

    fn read_file(&mut self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset)).map_err(fs_err)?;
        file.read(buf).map_err(fs_err)
    }

    fn write_file(&mut self, handle: FileHandle, offset: u64, buf: &[u8]) -> Result<()> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset)).map_err(fs_err)?;
        file.write_all(buf).map_err(fs_err)
    }

    fn close_file(&mut self, handle: FileHandle) {
        self.files.remove(&handle);
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        fs::create_dir(self.resolve(path)).map_err(fs_err)
    }

    fn delete_dir_recursive(&mut self, path: &str) -> Result<()> {
        fs::remove_dir_all(self.resolve(path)).map_err(fs_err)
    }

    fn rename_dir(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let new = self.resolve(new_path);
        if new.exists() {
            return Err(fs_err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "rename target exists",
            )));
        }
        fs::rename(self.resolve(old_path), new).map_err(fs_err)
    }

    fn open_dir(&mut self, path: &str) -> Result<DirHandle> {
        let local = self.resolve(path);
        let entries = scan_dir(&local).map_err(fs_err)?;
        let handle = self.alloc_handle();
        log::debug!("opendir {} -> {} ({} entries)", local.display(), handle, entries.len());
        self.dirs.insert(handle, DirState { entries, pos: 0 });
        Ok(handle)
    }

    fn read_dir(&mut self, dir: DirHandle, max_entries: usize) -> Result<Vec<DirEntry>> {
        let state = self.dirs.get_mut(&dir).ok_or(Error::InvalidArgument)?;
        let n = max_entries.min(state.entries.len() - state.pos);
        let batch = state.entries[state.pos..state.pos + n].to_vec();
        state.pos += n;
        Ok(batch)
    }

    fn dir_entry_count(&mut self, dir: DirHandle) -> Result<u64> {
        let state = self.dirs.get(&dir).ok_or(Error::InvalidArgument)?;
        Ok(state.entries.len() as u64)
    }

    fn close_dir(&mut self, dir: DirHandle) {
        self.dirs.remove(&dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::open_mode::{READ, WRITE};

    #[test]
    fn file_crud_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = DirFs::new("card", "Card", dir.path());

        fs.create_file("card/a.bin", 0, 0).unwrap();
        assert_eq!(fs.entry_type("card/a.bin").unwrap(), EntryType::File);

        let f = fs.open_file("card/a.bin", WRITE).unwrap();
        fs.write_file(f, 0, b"hello").unwrap();
        fs.close_file(f);

        let f = fs.open_file("card/a.bin", READ).unwrap();
        assert_eq!(fs.file_size(f).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(fs.read_file(f, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        fs.close_file(f);

        fs.rename_file("card/a.bin", "card/b.bin").unwrap();
        assert_eq!(fs.entry_type("card/a.bin").unwrap(), EntryType::Missing);
        fs.delete_file("card/b.bin").unwrap();
    }

    #[test]
    fn rename_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = DirFs::new("", "Card", dir.path());
        fs.create_file("a", 0, 0).unwrap();
        fs.create_file("b", 0, 0).unwrap();
        assert!(fs.rename_file("a", "b").is_err());
        assert_eq!(fs.entry_type("a").unwrap(), EntryType::File);
    }

    #[test]
    fn directory_enumeration_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = DirFs::new("", "Card", dir.path());
        for i in 0..5 {
            fs.create_file(&format!("f{i}"), 0, 0).unwrap();
        }
        let d = fs.open_dir("/").unwrap();
        assert_eq!(fs.dir_entry_count(d).unwrap(), 5);
        assert_eq!(fs.read_dir(d, 3).unwrap().len(), 3);
        assert_eq!(fs.read_dir(d, 3).unwrap().len(), 2);
        assert_eq!(fs.read_dir(d, 3).unwrap().len(), 0);
        fs.close_dir(d);
    }

    #[test]
    fn preallocated_create_sets_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = DirFs::new("", "Card", dir.path());
        fs.create_file("big", 4096, 0).unwrap();
        let f = fs.open_file("big", READ).unwrap();
        assert_eq!(fs.file_size(f).unwrap(), 4096);
        fs.close_file(f);
    }
}
