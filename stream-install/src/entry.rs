//! Per-entry streaming writers and the state shared by one install.
//!
//! Each archive entry gets a writer chosen by name suffix: content blobs
//! stream into a content-store placeholder, meta blobs additionally commit
//! records on completion, tickets and certificates buffer in memory until
//! finalization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{InstallError, InstallResult};
use crate::store::{
    base_title_id, ContentId, ContentStorage, MetaRecord, TitleKeeper,
};

/// State one install's writers share: the opened store, the title keeper,
/// the pending meta commits, and the derived base title id.
pub struct InstallShared {
    store: Mutex<Box<dyn ContentStorage>>,
    keeper: Mutex<Box<dyn TitleKeeper>>,
    metas: Mutex<Vec<MetaRecord>>,
    title_id: AtomicU64,
}

impl InstallShared {
    pub fn new(store: Box<dyn ContentStorage>, keeper: Box<dyn TitleKeeper>) -> Arc<Self> {
        Arc::new(InstallShared {
            store: Mutex::new(store),
            keeper: Mutex::new(keeper),
            metas: Mutex::new(Vec::new()),
            title_id: AtomicU64::new(0),
        })
    }

    /// Clear per-install state for a fresh stream.
    pub fn reset(&self) {
        self.metas.lock().unwrap().clear();
        self.title_id.store(0, Ordering::Relaxed);
    }

    pub fn title_id(&self) -> Option<u64> {
        match self.title_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn space(&self) -> InstallResult<(u64, u64)> {
        let store = self.store.lock().unwrap();
        Ok((store.total_space()?, store.free_space()?))
    }

    pub fn with_store<T>(
        &self,
        f: impl FnOnce(&mut dyn ContentStorage) -> InstallResult<T>,
    ) -> InstallResult<T> {
        f(self.store.lock().unwrap().as_mut())
    }

    /// Install records for the most recently completed meta.
    fn commit_latest(&self) -> InstallResult<()> {
        let metas = self.metas.lock().unwrap();
        let Some(record) = metas.last() else {
            return Ok(());
        };
        let mut keeper = self.keeper.lock().unwrap();
        keeper.install_content_meta(record)?;
        keeper.install_application_record(base_title_id(record.key.id, record.key.kind))
    }

    /// Re-install records for every completed meta. Issued at end of
    /// stream so a multi-title archive commits everything it carried.
    pub fn commit_all(&self) -> InstallResult<()> {
        let metas = self.metas.lock().unwrap();
        let mut keeper = self.keeper.lock().unwrap();
        for record in metas.iter() {
            keeper.install_content_meta(record)?;
            keeper.install_application_record(base_title_id(record.key.id, record.key.kind))?;
        }
        Ok(())
    }

    pub fn import_ticket(&self, ticket: &[u8], cert: &[u8]) -> InstallResult<()> {
        self.keeper.lock().unwrap().import_ticket(ticket, cert)
    }
}

/// Writer role, decided once from the entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `.nca` / `.ncz` content blob.
    Content,
    /// `.cnmt.nca` / `.cnmt.ncz` content meta.
    Meta,
    Ticket,
    Certificate,
    Unknown,
}

pub fn classify_entry(name: &str) -> EntryKind {
    if name.contains(".cnmt.nca") || name.contains(".cnmt.ncz") {
        EntryKind::Meta
    } else if name.contains(".nca") || name.contains(".ncz") {
        EntryKind::Content
    } else if name.contains(".tik") {
        EntryKind::Ticket
    } else if name.contains(".cert") {
        EntryKind::Certificate
    } else {
        EntryKind::Unknown
    }
}

pub struct EntryWriter {
    name: String,
    /// Absolute archive offset where this entry's bytes begin.
    data_start: u64,
    size: u64,
    written: u64,
    started: bool,
    complete: bool,
    kind: EntryKind,
    content_id: Option<ContentId>,
    buffer: Vec<u8>,
    shared: Arc<InstallShared>,
}

impl EntryWriter {
    pub fn new(name: &str, data_start: u64, size: u64, shared: Arc<InstallShared>) -> Self {
        let kind = classify_entry(name);
        let content_id = match kind {
            EntryKind::Content | EntryKind::Meta => ContentId::from_hex_prefix(name),
            _ => None,
        };
        EntryWriter {
            name: name.to_owned(),
            data_start,
            size,
            written: 0,
            started: false,
            complete: false,
            kind,
            content_id,
            buffer: Vec::new(),
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Buffered bytes of a ticket or certificate entry.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Route the part of `[offset, offset+len)` that intersects this
    /// entry's data range into its writer. Non-intersecting chunks are
    /// ignored.
    pub fn feed_chunk(&mut self, data: &[u8], offset: u64) -> InstallResult<()> {
        let entry_start = self.data_start;
        let entry_end = self.data_start + self.size;
        let chunk_end = offset + data.len() as u64;
        if chunk_end <= entry_start || offset >= entry_end {
            return Ok(());
        }
        let write_start = offset.max(entry_start);
        let write_end = chunk_end.min(entry_end);
        let slice = &data[(write_start - offset) as usize..(write_end - offset) as usize];
        self.write(write_start - entry_start, slice)
    }

    /// Append `data` at entry-relative `offset`. Content writers demand
    /// strictly ascending, gap-free offsets.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> InstallResult<()> {
        match self.kind {
            EntryKind::Ticket | EntryKind::Certificate => {
                self.buffer.extend_from_slice(data);
                self.written += data.len() as u64;
                if self.written >= self.size {
                    self.complete = true;
                }
                Ok(())
            }
            EntryKind::Content | EntryKind::Meta => self.write_content(offset, data),
            EntryKind::Unknown => Err(InstallError::UnsupportedEntry {
                name: self.name.clone(),
            }),
        }
    }

    fn write_content(&mut self, offset: u64, data: &[u8]) -> InstallResult<()> {
        let id = self.content_id.ok_or_else(|| InstallError::Store(format!(
            "{} has no content id prefix",
            self.name
        )))?;

        if !self.started {
            // A failed earlier attempt may have left a stale placeholder.
            self.shared.with_store(|store| {
                let _ = store.delete_placeholder(&id);
                store.create_placeholder(&id, self.size)
            })?;
            self.started = true;
            log::debug!("streaming {} ({} bytes)", self.name, self.size);
        }

        if offset != self.written {
            return Err(InstallError::OutOfOrder {
                name: self.name.clone(),
                offset,
                expected: self.written,
            });
        }

        self.shared
            .with_store(|store| store.write_placeholder(&id, offset, data))?;
        self.written += data.len() as u64;

        if self.written >= self.size {
            self.shared.with_store(|store| {
                store.register(&id)?;
                let _ = store.delete_placeholder(&id);
                Ok(())
            })?;
            self.complete = true;
            log::info!("registered {}", self.name);
            if self.kind == EntryKind::Meta {
                self.commit_meta(&id)?;
            }
        }
        Ok(())
    }

    /// Read the meta's key back out of the store, publish the derived base
    /// title id, and install its records.
    fn commit_meta(&mut self, id: &ContentId) -> InstallResult<()> {
        let (path, key) = self
            .shared
            .with_store(|store| Ok((store.path_of(id)?, store.read_meta_key(id)?)))?;
        log::debug!("committing meta {} from {path}", self.name);

        let base = base_title_id(key.id, key.kind);
        self.shared.title_id.store(base, Ordering::Relaxed);

        self.shared.metas.lock().unwrap().push(MetaRecord {
            key,
            content_id: *id,
            size: self.size,
        });
        self.shared.commit_latest()
    }
}

/// End-of-stream: import ticket/certificate pairs in entry order, then
/// commit every registered meta.
pub fn finalize_entries(writers: &[EntryWriter], shared: &InstallShared) -> InstallResult<()> {
    let tickets: Vec<&EntryWriter> = writers
        .iter()
        .filter(|w| w.kind() == EntryKind::Ticket)
        .collect();
    let certs: Vec<&EntryWriter> = writers
        .iter()
        .filter(|w| w.kind() == EntryKind::Certificate)
        .collect();

    for (ticket, cert) in tickets.iter().zip(certs.iter()) {
        if !ticket.buffered().is_empty() && !cert.buffered().is_empty() {
            shared
                .import_ticket(ticket.buffered(), cert.buffered())
                .map_err(|e| InstallError::Ticket(e.to_string()))?;
        }
    }

    shared.commit_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryContentStore, MemoryTitleKeeper};

    fn shared() -> (Arc<InstallShared>, MemoryContentStore, MemoryTitleKeeper) {
        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store.clone()), Box::new(keeper.clone()));
        (shared, store, keeper)
    }

    #[test]
    fn classification_by_suffix() {
        assert_eq!(classify_entry("00112233445566778899aabbccddeeff.nca"), EntryKind::Content);
        assert_eq!(classify_entry("00112233445566778899aabbccddeeff.ncz"), EntryKind::Content);
        assert_eq!(
            classify_entry("00112233445566778899aabbccddeeff.cnmt.nca"),
            EntryKind::Meta
        );
        assert_eq!(classify_entry("title.tik"), EntryKind::Ticket);
        assert_eq!(classify_entry("title.cert"), EntryKind::Certificate);
        assert_eq!(classify_entry("readme.txt"), EntryKind::Unknown);
    }

    #[test]
    fn content_writer_registers_on_completion() {
        let (shared, store, _) = shared();
        let name = format!("{}.nca", hex::encode([3u8; 16]));
        let mut writer = EntryWriter::new(&name, 100, 6, shared);

        writer.feed_chunk(b"abc", 100).unwrap();
        assert!(!writer.is_complete());
        writer.feed_chunk(b"def", 103).unwrap();
        assert!(writer.is_complete());

        let id = ContentId::new([3u8; 16]);
        assert_eq!(store.registered_blob(&id).unwrap(), b"abcdef");
        assert_eq!(store.placeholder_count(), 0);
    }

    #[test]
    fn chunk_intersection_trims_both_ends() {
        let (shared, store, _) = shared();
        let name = format!("{}.nca", hex::encode([4u8; 16]));
        let mut writer = EntryWriter::new(&name, 10, 4, shared);

        // Covers [6, 18): only [10, 14) belongs to the entry.
        writer.feed_chunk(b"xxxxABCDyyyy", 6).unwrap();
        assert!(writer.is_complete());
        assert_eq!(
            store.registered_blob(&ContentId::new([4u8; 16])).unwrap(),
            b"ABCD"
        );
    }

    #[test]
    fn out_of_order_content_is_rejected() {
        let (shared, _, _) = shared();
        let name = format!("{}.nca", hex::encode([5u8; 16]));
        let mut writer = EntryWriter::new(&name, 0, 10, shared);

        writer.write(0, b"abc").unwrap();
        assert!(matches!(
            writer.write(5, b"zz"),
            Err(InstallError::OutOfOrder { expected: 3, .. })
        ));
    }

    #[test]
    fn meta_completion_commits_records_and_title() {
        let (shared, store, keeper) = shared();
        let id_bytes = [9u8; 16];
        let name = format!("{}.cnmt.nca", hex::encode(id_bytes));

        let mut blob = Vec::new();
        blob.extend_from_slice(&0x0100_2222_3333_4800u64.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.push(0x81); // patch
        blob.extend_from_slice(&[0; 3]);

        let mut writer = EntryWriter::new(&name, 0, blob.len() as u64, Arc::clone(&shared));
        writer.write(0, &blob).unwrap();
        assert!(writer.is_complete());

        assert!(store.registered_blob(&ContentId::new(id_bytes)).is_some());
        assert_eq!(shared.title_id(), Some(0x0100_2222_3333_4000));
        assert_eq!(keeper.installed_metas().len(), 1);
        assert_eq!(keeper.application_records(), vec![0x0100_2222_3333_4000]);
    }

    #[test]
    fn tickets_buffer_until_finalization() {
        let (shared, _, keeper) = shared();
        let mut tik = EntryWriter::new("title.tik", 0, 3, Arc::clone(&shared));
        let mut cert = EntryWriter::new("title.cert", 3, 3, Arc::clone(&shared));
        tik.write(0, b"TIK").unwrap();
        cert.write(0, b"CRT").unwrap();

        finalize_entries(&[tik, cert], &shared).unwrap();
        assert_eq!(keeper.ticket_count(), 1);
    }
}
