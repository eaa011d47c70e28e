//! Streaming demultiplexer for the flat package archive: one header, a
//! file table, then concatenated entry data. Chunks are expected in order;
//! the header is accumulated from the stream prefix until it parses.

use std::sync::Arc;

use crate::entry::{finalize_entries, EntryWriter, InstallShared};
use crate::error::{InstallError, InstallResult};
use crate::layout::{parse_partition, PACKAGE_ENTRY_SIZE, PACKAGE_MAGIC};
use crate::manager::StreamInstaller;

/// The variable-length header must fit this prefix window.
const HEADER_WINDOW: u64 = 0x20000;

pub struct PackageStream {
    shared: Arc<InstallShared>,
    header: Vec<u8>,
    parsed: bool,
    writers: Vec<EntryWriter>,
}

impl PackageStream {
    pub fn new(shared: Arc<InstallShared>) -> Self {
        PackageStream {
            shared,
            header: Vec::new(),
            parsed: false,
            writers: Vec::new(),
        }
    }

    fn accumulate_header(&mut self, data: &[u8], offset: u64) {
        if offset >= HEADER_WINDOW {
            return;
        }
        let end = (offset + data.len() as u64).min(HEADER_WINDOW);
        let len = (end - offset) as usize;
        let at = offset as usize;
        if self.header.len() < at + len {
            self.header.resize(at + len, 0);
        }
        self.header[at..at + len].copy_from_slice(&data[..len]);
    }

    fn parse_header_if_ready(&mut self) -> InstallResult<bool> {
        if self.parsed {
            return Ok(true);
        }
        let Some(partition) = parse_partition(&self.header, PACKAGE_ENTRY_SIZE, PACKAGE_MAGIC)?
        else {
            return Ok(false);
        };

        log::info!("package archive: {} entries", partition.entries.len());
        self.writers = partition
            .entries
            .iter()
            .map(|e| {
                // Entry data offsets are relative to the end of the header.
                EntryWriter::new(
                    &e.name,
                    partition.header_size + e.data_offset,
                    e.size,
                    Arc::clone(&self.shared),
                )
            })
            .collect();
        self.parsed = true;
        Ok(true)
    }
}

impl StreamInstaller for PackageStream {
    fn feed(&mut self, data: &[u8], offset: u64) -> InstallResult<()> {
        self.accumulate_header(data, offset);
        if !self.parse_header_if_ready()? {
            // Still collecting the header; nothing to route yet.
            return Ok(());
        }
        for writer in &mut self.writers {
            writer.feed_chunk(data, offset)?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> InstallResult<()> {
        if !self.parsed {
            return Err(InstallError::UnexpectedEof);
        }
        finalize_entries(&self.writers, &self.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::build::{partition, EntrySpec};
    use crate::store::{ContentId, MemoryContentStore, MemoryTitleKeeper};

    fn meta_blob(title_id: u64, kind: u8) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&title_id.to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.push(kind);
        blob.resize(64, 0xAA);
        blob
    }

    fn sample_archive() -> (Vec<u8>, [ContentId; 3]) {
        let meta_a = ContentId::new([0x11; 16]);
        let meta_b = ContentId::new([0x22; 16]);
        let content = ContentId::new([0x33; 16]);
        let raw = partition(
            PACKAGE_MAGIC,
            PACKAGE_ENTRY_SIZE,
            &[
                EntrySpec {
                    name: format!("{meta_a}.cnmt.nca"),
                    data: meta_blob(0x0100_0000_0000_3000, 0x80),
                },
                EntrySpec {
                    name: format!("{content}.nca"),
                    data: vec![0x5A; 5000],
                },
                EntrySpec {
                    name: format!("{meta_b}.cnmt.nca"),
                    data: meta_blob(0x0100_0000_0000_3800, 0x81),
                },
            ],
        );
        (raw, [meta_a, meta_b, content])
    }

    fn run(feeds: &[(&[u8], u64)]) -> (MemoryContentStore, MemoryTitleKeeper, Option<u64>) {
        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store.clone()), Box::new(keeper.clone()));
        let mut stream = PackageStream::new(Arc::clone(&shared));
        for &(chunk, offset) in feeds {
            stream.feed(chunk, offset).unwrap();
        }
        stream.finalize().unwrap();
        (store, keeper, shared.title_id())
    }

    #[test]
    fn single_chunk_install_registers_everything() {
        let (raw, ids) = sample_archive();
        let (store, keeper, title) = run(&[(&raw, 0)]);

        let mut registered = store.registered_ids();
        registered.sort_by_key(|id| *id.as_bytes());
        assert_eq!(registered, ids.to_vec());
        assert_eq!(store.placeholder_count(), 0);
        // Two metas commit once on completion, then once more at
        // finalization.
        assert_eq!(keeper.installed_metas().len(), 4);
        assert_eq!(title, Some(0x0100_0000_0000_3000));
    }

    #[test]
    fn split_chunks_produce_identical_writes() {
        let (raw, _) = sample_archive();
        let (whole, _, _) = run(&[(&raw, 0)]);

        // 64 KiB worth of header/start, then 4 KiB pieces.
        let mut feeds: Vec<(&[u8], u64)> = Vec::new();
        let first = raw.len().min(0x1000);
        feeds.push((&raw[..first], 0));
        let mut at = first;
        while at < raw.len() {
            let end = (at + 0x200).min(raw.len());
            feeds.push((&raw[at..end], at as u64));
            at = end;
        }
        let (split, _, _) = run(&feeds);

        let mut a = whole.registered_ids();
        let mut b = split.registered_ids();
        a.sort_by_key(|id| *id.as_bytes());
        b.sort_by_key(|id| *id.as_bytes());
        assert_eq!(a, b);
        for id in a {
            assert_eq!(whole.registered_blob(&id), split.registered_blob(&id));
        }
    }

    #[test]
    fn bad_magic_fails_the_feed() {
        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store), Box::new(keeper));
        let mut stream = PackageStream::new(shared);
        let bogus = vec![0xFFu8; 64];
        assert!(matches!(
            stream.feed(&bogus, 0),
            Err(InstallError::BadMagic { .. })
        ));
    }

    #[test]
    fn finalize_without_header_reports_truncation() {
        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store), Box::new(keeper));
        let mut stream = PackageStream::new(shared);
        stream.feed(&[0x50, 0x46], 0).unwrap(); // two bytes of magic
        assert!(matches!(
            stream.finalize(),
            Err(InstallError::UnexpectedEof)
        ));
    }
}
