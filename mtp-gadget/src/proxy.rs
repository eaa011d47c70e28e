//! The polymorphic storage backend the responder drives.
//!
//! Backends see relative paths: the proxy strips the implicit leading '/'
//! before forwarding, and a backend whose `name` is non-empty additionally
//! strips its own prefix (see [`strip_storage_prefix`]). Every forwarded
//! call first observes the stop token, so a shutdown poisons in-flight
//! filesystem work the same way it poisons USB work.

use crate::error::Result;
use crate::usb::StopToken;

/// What a path resolves to on a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
    Missing,
}

/// Open-mode flags for `open_file`.
pub mod open_mode {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const APPEND: u32 = 1 << 2;
}

/// Option flags for `create_file`.
pub mod create_option {
    /// The file is expected to reach 4 GiB or more.
    pub const BIG_FILE: u32 = 1 << 0;
}

/// An opaque open-file token minted by a backend.
pub type FileHandle = u64;
/// An opaque open-directory token minted by a backend.
pub type DirHandle = u64;

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryType,
    pub size: u64,
}

/// Capability set every storage backend implements. All operations block;
/// failures surface as typed errors. Implementations receive at most one
/// call at a time per session and need not be internally thread-safe unless
/// they also serve other callers.
pub trait FileSystemProxy: Send {
    /// Prefix used in virtual paths; empty means "mounted at root".
    fn name(&self) -> &str;
    /// Human-readable storage description reported to the host.
    fn display_name(&self) -> &str;

    fn total_space(&mut self, path: &str) -> Result<u64>;
    fn free_space(&mut self, path: &str) -> Result<u64>;
    fn entry_type(&mut self, path: &str) -> Result<EntryType>;

    fn create_file(&mut self, path: &str, size: u64, options: u32) -> Result<()>;
    fn delete_file(&mut self, path: &str) -> Result<()>;
    fn rename_file(&mut self, old_path: &str, new_path: &str) -> Result<()>;
    fn open_file(&mut self, path: &str, mode: u32) -> Result<FileHandle>;
    fn file_size(&mut self, file: FileHandle) -> Result<u64>;
    fn set_file_size(&mut self, file: FileHandle, size: u64) -> Result<()>;
    fn read_file(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_file(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<()>;
    fn close_file(&mut self, file: FileHandle);

    fn create_dir(&mut self, path: &str) -> Result<()>;
    fn delete_dir_recursive(&mut self, path: &str) -> Result<()>;
    fn rename_dir(&mut self, old_path: &str, new_path: &str) -> Result<()>;
    fn open_dir(&mut self, path: &str) -> Result<DirHandle>;
    fn read_dir(&mut self, dir: DirHandle, max_entries: usize) -> Result<Vec<DirEntry>>;
    fn dir_entry_count(&mut self, dir: DirHandle) -> Result<u64>;
    fn close_dir(&mut self, dir: DirHandle);

    /// Transfer-mode hint: `true` forces the inline single-threaded loop
    /// for this backend.
    fn prefers_single_threaded(&mut self, _size: u64, _is_read: bool) -> bool {
        false
    }
}

/// Strip a backend's own `name` prefix from an already root-relative path.
pub fn strip_storage_prefix<'a>(name: &str, path: &'a str) -> &'a str {
    if name.is_empty() {
        return path;
    }
    match path.strip_prefix(name) {
        Some(rest) => rest.strip_prefix('/').unwrap_or(rest),
        None => path,
    }
}

/// Stop-aware wrapper the responder holds per storage.
pub struct ProxyFs {
    backend: Box<dyn FileSystemProxy>,
    stop: StopToken,
}

/// Remove the implicit leading '/' so backends see relative paths. A bare
/// "/" is forwarded as-is.
fn fix_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_prefix('/').unwrap_or(path)
    } else {
        path
    }
}

impl ProxyFs {
    pub fn new(backend: Box<dyn FileSystemProxy>, stop: StopToken) -> Self {
        ProxyFs { backend, stop }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn display_name(&self) -> &str {
        self.backend.display_name()
    }

    pub fn total_space(&mut self, path: &str) -> Result<u64> {
        self.stop.check()?;
        self.backend.total_space(fix_path(path))
    }

    pub fn free_space(&mut self, path: &str) -> Result<u64> {
        self.stop.check()?;
        self.backend.free_space(fix_path(path))
    }

    pub fn entry_type(&mut self, path: &str) -> Result<EntryType> {
        self.stop.check()?;
        self.backend.entry_type(fix_path(path))
    }

    pub fn create_file(&mut self, path: &str, size: u64, options: u32) -> Result<()> {
        self.stop.check()?;
        self.backend.create_file(fix_path(path), size, options)
    }

    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        self.stop.check()?;
        self.backend.delete_file(fix_path(path))
    }

    pub fn rename_file(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.stop.check()?;
        self.backend.rename_file(fix_path(old_path), fix_path(new_path))
    }

    pub fn open_file(&mut self, path: &str, mode: u32) -> Result<FileHandle> {
        self.stop.check()?;
        self.backend.open_file(fix_path(path), mode)
    }

    pub fn file_size(&mut self, file: FileHandle) -> Result<u64> {
        self.stop.check()?;
        self.backend.file_size(file)
    }

    pub fn set_file_size(&mut self, file: FileHandle, size: u64) -> Result<()> {
        self.stop.check()?;
        self.backend.set_file_size(file, size)
    }

    pub fn read_file(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.stop.check()?;
        self.backend.read_file(file, offset, buf)
    }

    pub fn write_file(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<()> {
        self.stop.check()?;
        self.backend.write_file(file, offset, buf)
    }

    pub fn close_file(&mut self, file: FileHandle) {
        self.backend.close_file(file)
    }

    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        self.stop.check()?;
        self.backend.create_dir(fix_path(path))
    }

    pub fn delete_dir_recursive(&mut self, path: &str) -> Result<()> {
        self.stop.check()?;
        self.backend.delete_dir_recursive(fix_path(path))
    }

    pub fn rename_dir(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.stop.check()?;
        self.backend.rename_dir(fix_path(old_path), fix_path(new_path))
    }

    pub fn open_dir(&mut self, path: &str) -> Result<DirHandle> {
        self.stop.check()?;
        self.backend.open_dir(fix_path(path))
    }

    pub fn read_dir(&mut self, dir: DirHandle, max_entries: usize) -> Result<Vec<DirEntry>> {
        self.stop.check()?;
        self.backend.read_dir(dir, max_entries)
    }

    pub fn dir_entry_count(&mut self, dir: DirHandle) -> Result<u64> {
        self.stop.check()?;
        self.backend.dir_entry_count(dir)
    }

    pub fn close_dir(&mut self, dir: DirHandle) {
        self.backend.close_dir(dir)
    }

    pub fn prefers_single_threaded(&mut self, size: u64, is_read: bool) -> bool {
        self.backend.prefers_single_threaded(size, is_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_path_strips_single_leading_slash() {
        assert_eq!(fix_path("/card/a.bin"), "card/a.bin");
        assert_eq!(fix_path("/"), "/");
        assert_eq!(fix_path("/x"), "x");
    }

    #[test]
    fn storage_prefix_stripping() {
        assert_eq!(strip_storage_prefix("install", "install/a.nsp"), "a.nsp");
        assert_eq!(strip_storage_prefix("install", "install"), "");
        assert_eq!(strip_storage_prefix("", "a.nsp"), "a.nsp");
    }
}
