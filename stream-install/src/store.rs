//! Content-store collaborators: the placeholder-based blob store and the
//! title registry the demultiplexer commits into.
//!
//! A [`ContentId`] is one 16-byte opaque id used in both the placeholder
//! and the registered-content call positions.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{InstallError, InstallResult};

/// 16-byte content id, parsed from the leading 32 hex digits of an archive
/// entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId([u8; 16]);

impl ContentId {
    pub fn new(bytes: [u8; 16]) -> Self {
        ContentId(bytes)
    }

    /// Parse the first 32 hex characters of `name`.
    pub fn from_hex_prefix(name: &str) -> Option<Self> {
        let prefix = name.get(..32)?;
        let bytes = hex::decode(prefix).ok()?;
        Some(ContentId(bytes.try_into().ok()?))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// What a content meta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMetaType {
    Application,
    Patch,
    AddOnContent,
    Unknown(u8),
}

impl ContentMetaType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x80 => ContentMetaType::Application,
            0x81 => ContentMetaType::Patch,
            0x82 => ContentMetaType::AddOnContent,
            other => ContentMetaType::Unknown(other),
        }
    }

    pub fn as_raw(&self) -> u8 {
        match self {
            ContentMetaType::Application => 0x80,
            ContentMetaType::Patch => 0x81,
            ContentMetaType::AddOnContent => 0x82,
            ContentMetaType::Unknown(other) => *other,
        }
    }
}

/// Identity of one content meta: the title it belongs to and its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentMetaKey {
    pub id: u64,
    pub version: u32,
    pub kind: ContentMetaType,
}

/// The application a title belongs to, derived from any related title id.
///
/// Updates zero their patch digits; add-on content backs off one slot in
/// the leading 13 hex digits and re-pads.
pub fn base_title_id(id: u64, kind: ContentMetaType) -> u64 {
    match kind {
        ContentMetaType::Application => id,
        ContentMetaType::Patch => id & !0xFFF,
        ContentMetaType::AddOnContent => ((id >> 12) - 1) << 12,
        ContentMetaType::Unknown(_) => id,
    }
}

/// A committed meta blob, queued for record installation.
#[derive(Debug, Clone)]
pub struct MetaRecord {
    pub key: ContentMetaKey,
    pub content_id: ContentId,
    pub size: u64,
}

/// Platform blob store: provisionally written placeholders are atomically
/// promoted to registered content, keyed by the same 16-byte id.
pub trait ContentStorage: Send {
    fn create_placeholder(&mut self, id: &ContentId, size: u64) -> InstallResult<()>;
    fn delete_placeholder(&mut self, id: &ContentId) -> InstallResult<()>;
    fn write_placeholder(&mut self, id: &ContentId, offset: u64, data: &[u8]) -> InstallResult<()>;
    fn register(&mut self, id: &ContentId) -> InstallResult<()>;
    fn path_of(&self, id: &ContentId) -> InstallResult<String>;
    /// Read the content-meta-key back out of a registered meta blob.
    fn read_meta_key(&self, id: &ContentId) -> InstallResult<ContentMetaKey>;
    fn total_space(&self) -> InstallResult<u64>;
    fn free_space(&self) -> InstallResult<u64>;
}

/// Title registry: entitlement import plus meta/application record
/// installation.
pub trait TitleKeeper: Send {
    fn import_ticket(&mut self, ticket: &[u8], cert: &[u8]) -> InstallResult<()>;
    fn install_content_meta(&mut self, record: &MetaRecord) -> InstallResult<()>;
    fn install_application_record(&mut self, title_id: u64) -> InstallResult<()>;
}

/// Registered meta blobs start with the packaged meta header; the key is
/// in its first 13 bytes.
pub fn parse_meta_header(blob: &[u8]) -> InstallResult<ContentMetaKey> {
    if blob.len() < 13 {
        return Err(InstallError::Store("meta blob too short".into()));
    }
    let id = u64::from_le_bytes(blob[0..8].try_into().unwrap());
    let version = u32::from_le_bytes(blob[8..12].try_into().unwrap());
    Ok(ContentMetaKey {
        id,
        version,
        kind: ContentMetaType::from_raw(blob[12]),
    })
}

// ---------------------------------------------------------------------------
// In-memory store (tests, demos)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStoreState {
    placeholders: HashMap<ContentId, Vec<u8>>,
    registered: HashMap<ContentId, Vec<u8>>,
}

/// In-memory content store. Clones share state, so a test can keep a view
/// onto a store it moved into the install manager.
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_ids(&self) -> Vec<ContentId> {
        self.state.lock().unwrap().registered.keys().copied().collect()
    }

    pub fn registered_blob(&self, id: &ContentId) -> Option<Vec<u8>> {
        self.state.lock().unwrap().registered.get(id).cloned()
    }

    pub fn placeholder_count(&self) -> usize {
        self.state.lock().unwrap().placeholders.len()
    }
}

impl ContentStorage for MemoryContentStore {
    fn create_placeholder(&mut self, id: &ContentId, size: u64) -> InstallResult<()> {
        let mut state = self.state.lock().unwrap();
        state.placeholders.insert(*id, vec![0u8; size as usize]);
        Ok(())
    }

    fn delete_placeholder(&mut self, id: &ContentId) -> InstallResult<()> {
        self.state.lock().unwrap().placeholders.remove(id);
        Ok(())
    }

    fn write_placeholder(&mut self, id: &ContentId, offset: u64, data: &[u8]) -> InstallResult<()> {
        let mut state = self.state.lock().unwrap();
        let blob = state
            .placeholders
            .get_mut(id)
            .ok_or_else(|| InstallError::Store(format!("no placeholder for {id}")))?;
        let end = offset as usize + data.len();
        if blob.len() < end {
            blob.resize(end, 0);
        }
        blob[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn register(&mut self, id: &ContentId) -> InstallResult<()> {
        let mut state = self.state.lock().unwrap();
        let blob = state
            .placeholders
            .get(id)
            .cloned()
            .ok_or_else(|| InstallError::Store(format!("no placeholder for {id}")))?;
        state.registered.insert(*id, blob);
        Ok(())
    }

    fn path_of(&self, id: &ContentId) -> InstallResult<String> {
        Ok(format!("mem:/{id}"))
    }

    fn read_meta_key(&self, id: &ContentId) -> InstallResult<ContentMetaKey> {
        let state = self.state.lock().unwrap();
        let blob = state
            .registered
            .get(id)
            .ok_or_else(|| InstallError::Store(format!("{id} not registered")))?;
        parse_meta_header(blob)
    }

    fn total_space(&self) -> InstallResult<u64> {
        Ok(u64::MAX / 2)
    }

    fn free_space(&self) -> InstallResult<u64> {
        Ok(u64::MAX / 2)
    }
}

/// In-memory title registry. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryTitleKeeper {
    state: Arc<Mutex<MemoryKeeperState>>,
}

#[derive(Default)]
struct MemoryKeeperState {
    tickets: Vec<(Vec<u8>, Vec<u8>)>,
    metas: Vec<MetaRecord>,
    applications: Vec<u64>,
}

impl MemoryTitleKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket_count(&self) -> usize {
        self.state.lock().unwrap().tickets.len()
    }

    pub fn installed_metas(&self) -> Vec<MetaRecord> {
        self.state.lock().unwrap().metas.clone()
    }

    pub fn application_records(&self) -> Vec<u64> {
        self.state.lock().unwrap().applications.clone()
    }
}

impl TitleKeeper for MemoryTitleKeeper {
    fn import_ticket(&mut self, ticket: &[u8], cert: &[u8]) -> InstallResult<()> {
        log::info!("importing ticket ({} + {} bytes)", ticket.len(), cert.len());
        self.state
            .lock()
            .unwrap()
            .tickets
            .push((ticket.to_vec(), cert.to_vec()));
        Ok(())
    }

    fn install_content_meta(&mut self, record: &MetaRecord) -> InstallResult<()> {
        log::info!(
            "installing meta record for {:016x} (v{})",
            record.key.id,
            record.key.version
        );
        self.state.lock().unwrap().metas.push(record.clone());
        Ok(())
    }

    fn install_application_record(&mut self, title_id: u64) -> InstallResult<()> {
        log::info!("installing application record for {title_id:016x}");
        self.state.lock().unwrap().applications.push(title_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Directory-backed store
// ---------------------------------------------------------------------------

/// Content store over a plain directory: placeholders are `<id>.tmp` files
/// promoted to `<id>.nca` on registration.
pub struct DirContentStore {
    root: PathBuf,
}

impl DirContentStore {
    pub fn new(root: impl Into<PathBuf>) -> InstallResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DirContentStore { root })
    }

    fn placeholder_path(&self, id: &ContentId) -> PathBuf {
        self.root.join(format!("{id}.tmp"))
    }

    fn content_path(&self, id: &ContentId) -> PathBuf {
        self.root.join(format!("{id}.nca"))
    }
}

impl ContentStorage for DirContentStore {
    fn create_placeholder(&mut self, id: &ContentId, size: u64) -> InstallResult<()> {
        let file = fs::File::create(self.placeholder_path(id))?;
        if size > 0 {
            file.set_len(size)?;
        }
        Ok(())
    }

    fn delete_placeholder(&mut self, id: &ContentId) -> InstallResult<()> {
        match fs::remove_file(self.placeholder_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_placeholder(&mut self, id: &ContentId, offset: u64, data: &[u8]) -> InstallResult<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.placeholder_path(id))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn register(&mut self, id: &ContentId) -> InstallResult<()> {
        fs::rename(self.placeholder_path(id), self.content_path(id))?;
        Ok(())
    }

    fn path_of(&self, id: &ContentId) -> InstallResult<String> {
        Ok(self.content_path(id).to_string_lossy().into_owned())
    }

    fn read_meta_key(&self, id: &ContentId) -> InstallResult<ContentMetaKey> {
        let blob = fs::read(self.content_path(id))?;
        parse_meta_header(&blob)
    }

    fn total_space(&self) -> InstallResult<u64> {
        Ok(fs2::total_space(&self.root)?)
    }

    fn free_space(&self) -> InstallResult<u64> {
        Ok(fs2::available_space(&self.root)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_parses_leading_hex() {
        let name = "d0e2b6eec32a45b4a2cd7a1a18dd6ea3.cnmt.nca";
        let id = ContentId::from_hex_prefix(name).unwrap();
        assert_eq!(id.to_string(), "d0e2b6eec32a45b4a2cd7a1a18dd6ea3");
        assert!(ContentId::from_hex_prefix("short.nca").is_none());
        assert!(ContentId::from_hex_prefix("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz.nca").is_none());
    }

    #[test]
    fn base_title_derivation_table() {
        let app = 0x0100_ABCD_EF01_2000;
        assert_eq!(base_title_id(app, ContentMetaType::Application), app);
        assert_eq!(
            base_title_id(0x0100_ABCD_EF01_2800, ContentMetaType::Patch),
            0x0100_ABCD_EF01_2000
        );
        assert_eq!(
            base_title_id(0x0100_ABCD_EF01_3001, ContentMetaType::AddOnContent),
            0x0100_ABCD_EF01_2000
        );
        assert_eq!(
            base_title_id(0x0100_0000_0000_4567, ContentMetaType::Unknown(0x90)),
            0x0100_0000_0000_4567
        );
    }

    #[test]
    fn placeholder_lifecycle_in_memory() {
        let mut store = MemoryContentStore::new();
        let view = store.clone();
        let id = ContentId::new([7u8; 16]);

        store.create_placeholder(&id, 4).unwrap();
        store.write_placeholder(&id, 0, b"ab").unwrap();
        store.write_placeholder(&id, 2, b"cd").unwrap();
        store.register(&id).unwrap();
        store.delete_placeholder(&id).unwrap();

        assert_eq!(view.placeholder_count(), 0);
        assert_eq!(view.registered_blob(&id).unwrap(), b"abcd");
    }

    #[test]
    fn dir_store_promotes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirContentStore::new(dir.path()).unwrap();
        let id = ContentId::new([1u8; 16]);

        store.create_placeholder(&id, 0).unwrap();
        store.write_placeholder(&id, 0, b"data").unwrap();
        store.register(&id).unwrap();

        let path = store.path_of(&id).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"data");
        // Deleting an absent placeholder is not an error.
        store.delete_placeholder(&id).unwrap();
    }

    #[test]
    fn meta_header_roundtrip() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&0x0100_1111_2222_3000u64.to_le_bytes());
        blob.extend_from_slice(&65536u32.to_le_bytes());
        blob.push(0x81);
        blob.extend_from_slice(&[0u8; 3]);
        let key = parse_meta_header(&blob).unwrap();
        assert_eq!(key.id, 0x0100_1111_2222_3000);
        assert_eq!(key.version, 65536);
        assert_eq!(key.kind, ContentMetaType::Patch);
    }
}
