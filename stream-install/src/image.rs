//! Streaming demultiplexer for the layered disk-image archive.
//!
//! A fixed card header precedes the root partition, whose header is probed
//! at both 0xF000 and 0x10000. The root's `secure` child is itself a
//! partition holding the content files; its entries' data offsets resolve
//! to absolute archive positions. Hosts may deliver chunks out of order,
//! so chunks buffer in an ordered map and drain contiguously from a
//! cursor.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::entry::{finalize_entries, EntryWriter, InstallShared};
use crate::error::{InstallError, InstallResult};
use crate::layout::{parse_partition, IMAGE_ENTRY_SIZE, IMAGE_MAGIC, PARTITION_HEADER_SIZE};
use crate::manager::StreamInstaller;

/// Candidate root-partition offsets, probed in order.
pub const ROOT_OFFSETS: [u64; 2] = [0xF000, 0x10000];
/// Each header (root and secure) must fit this window.
const HEADER_WINDOW: u64 = 0x20000;

/// A sliding accumulation window over `[base, base + HEADER_WINDOW)`.
#[derive(Default)]
struct HeaderWindow {
    bytes: Vec<u8>,
}

impl HeaderWindow {
    fn absorb(&mut self, base: u64, data: &[u8], offset: u64) {
        let chunk_end = offset + data.len() as u64;
        let window_end = base + HEADER_WINDOW;
        if chunk_end <= base || offset >= window_end {
            return;
        }
        let start = offset.max(base);
        let end = chunk_end.min(window_end);
        let at = (start - base) as usize;
        let len = (end - start) as usize;
        if self.bytes.len() < at + len {
            self.bytes.resize(at + len, 0);
        }
        self.bytes[at..at + len].copy_from_slice(&data[(start - offset) as usize..][..len]);
    }
}

pub struct ImageStream {
    shared: Arc<InstallShared>,
    /// Contiguous-drain cursor; chunks at other offsets wait their turn.
    next_offset: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    root_windows: [HeaderWindow; 2],
    secure_window: HeaderWindow,
    root_offset: Option<u64>,
    secure_offset: Option<u64>,
    parsed: bool,
    writers: Vec<EntryWriter>,
}

impl ImageStream {
    pub fn new(shared: Arc<InstallShared>) -> Self {
        ImageStream {
            shared,
            next_offset: 0,
            pending: BTreeMap::new(),
            root_windows: Default::default(),
            secure_window: HeaderWindow::default(),
            root_offset: None,
            secure_offset: None,
            parsed: false,
            writers: Vec::new(),
        }
    }

    fn process_chunk(&mut self, data: &[u8], offset: u64) -> InstallResult<()> {
        for (window, base) in self.root_windows.iter_mut().zip(ROOT_OFFSETS) {
            window.absorb(base, data, offset);
        }

        // Parsing the root header may reveal the secure offset while the
        // same chunk also carries secure-partition bytes; re-absorb and
        // re-parse until the view stops improving.
        loop {
            if let Some(secure) = self.secure_offset {
                self.secure_window.absorb(secure, data, offset);
            }
            let known_secure = self.secure_offset;
            if self.parse_headers_if_ready()? {
                break;
            }
            if self.secure_offset == known_secure {
                return Ok(());
            }
        }

        for writer in &mut self.writers {
            writer.feed_chunk(data, offset)?;
        }
        Ok(())
    }

    fn parse_headers_if_ready(&mut self) -> InstallResult<bool> {
        if self.parsed {
            return Ok(true);
        }

        // Probe for the root partition; whichever offset first presents
        // the magic wins.
        if self.root_offset.is_none() {
            let mut sized = 0;
            for (window, base) in self.root_windows.iter().zip(ROOT_OFFSETS) {
                if window.bytes.len() < PARTITION_HEADER_SIZE {
                    continue;
                }
                sized += 1;
                match parse_partition(&window.bytes, IMAGE_ENTRY_SIZE, IMAGE_MAGIC) {
                    Err(InstallError::BadMagic { .. }) => continue,
                    _ => {
                        self.root_offset = Some(base);
                        break;
                    }
                }
            }
            if self.root_offset.is_none() {
                if sized == ROOT_OFFSETS.len() {
                    let found = u32::from_le_bytes(
                        self.root_windows[0].bytes[..4].try_into().unwrap(),
                    );
                    return Err(InstallError::BadMagic { found });
                }
                return Ok(false);
            }
        }

        let root_offset = self.root_offset.unwrap();
        let window = if root_offset == ROOT_OFFSETS[0] {
            &self.root_windows[0]
        } else {
            &self.root_windows[1]
        };
        let Some(root) = parse_partition(&window.bytes, IMAGE_ENTRY_SIZE, IMAGE_MAGIC)? else {
            return Ok(false);
        };

        if self.secure_offset.is_none() {
            let secure = root
                .entry("secure")
                .ok_or(InstallError::MissingSecurePartition)?;
            self.secure_offset = Some(root_offset + root.header_size + secure.data_offset);
            // The secure window opens late; its bytes arrive after the
            // root header in a contiguous drain, so nothing was missed.
            return Ok(false);
        }

        let secure_offset = self.secure_offset.unwrap();
        let Some(secure) = parse_partition(&self.secure_window.bytes, IMAGE_ENTRY_SIZE, IMAGE_MAGIC)?
        else {
            return Ok(false);
        };

        log::info!("disk image: {} content entries", secure.entries.len());
        self.writers = secure
            .entries
            .iter()
            .map(|e| {
                // Secure-partition data offsets are absolute in the image.
                EntryWriter::new(
                    &e.name,
                    secure_offset + secure.header_size + e.data_offset,
                    e.size,
                    Arc::clone(&self.shared),
                )
            })
            .collect();
        self.parsed = true;
        Ok(true)
    }
}

impl StreamInstaller for ImageStream {
    fn feed(&mut self, data: &[u8], offset: u64) -> InstallResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        // Trim the part of the chunk the cursor already passed.
        let (data, offset) = if offset < self.next_offset {
            let skip = self.next_offset - offset;
            if skip >= data.len() as u64 {
                return Ok(());
            }
            (&data[skip as usize..], offset + skip)
        } else {
            (data, offset)
        };

        self.pending.entry(offset).or_insert_with(|| data.to_vec());

        while let Some(chunk) = self.pending.remove(&self.next_offset) {
            let at = self.next_offset;
            self.next_offset += chunk.len() as u64;
            self.process_chunk(&chunk, at)?;
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

/// Serialize a complete disk image for the test suites: card header,
/// root partition with a `secure` child, inner content partition.
pub mod build {
    use super::*;
    use crate::layout::build::{partition, EntrySpec};

    pub fn image(root_offset: u64, entries: &[EntrySpec]) -> Vec<u8> {
        let secure_raw = partition(IMAGE_MAGIC, IMAGE_ENTRY_SIZE, entries);

        // Root partition with one child: "secure", placed directly after
        // the root header in the root's data region.
        let root_raw = partition(
            IMAGE_MAGIC,
            IMAGE_ENTRY_SIZE,
            &[EntrySpec {
                name: "secure".into(),
                data: secure_raw,
            }],
        );

        let mut out = vec![0u8; root_offset as usize];
        out.extend_from_slice(&root_raw);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::build::image;
    use super::*;
    use crate::layout::build::EntrySpec;
    use crate::store::{ContentId, MemoryContentStore, MemoryTitleKeeper};

    fn content_name(byte: u8) -> String {
        format!("{}.nca", ContentId::new([byte; 16]))
    }

    fn sample_image(root_offset: u64) -> Vec<u8> {
        image(
            root_offset,
            &[
                EntrySpec {
                    name: content_name(0x44),
                    data: vec![0x44; 3000],
                },
                EntrySpec {
                    name: content_name(0x55),
                    data: vec![0x55; 1000],
                },
            ],
        )
    }

    fn run(raw: &[u8], feeds: &[(u64, usize)]) -> MemoryContentStore {
        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store.clone()), Box::new(keeper));
        let mut stream = ImageStream::new(shared);
        for &(offset, len) in feeds {
            stream.feed(&raw[offset as usize..offset as usize + len], offset).unwrap();
        }
        stream.finalize().unwrap();
        store
    }

    #[test]
    fn contiguous_image_installs_both_contents() {
        for root_offset in ROOT_OFFSETS {
            let raw = sample_image(root_offset);
            let store = run(&raw, &[(0, raw.len())]);
            let blob = store.registered_blob(&ContentId::new([0x44; 16])).unwrap();
            assert_eq!(blob.len(), 3000);
            assert!(blob.iter().all(|&b| b == 0x44));
            assert!(store.registered_blob(&ContentId::new([0x55; 16])).is_some());
        }
    }

    #[test]
    fn out_of_order_chunks_are_reassembled() {
        let raw = sample_image(0xF000);
        let half = raw.len() / 2;
        // Second half first; the parser must hold it until the gap fills.
        let store = run(&raw, &[(half as u64, raw.len() - half), (0, half)]);
        assert_eq!(store.registered_ids().len(), 2);
    }

    #[test]
    fn overlapping_resend_is_skipped() {
        let raw = sample_image(0xF000);
        let store = run(&raw, &[(0, raw.len()), (0, raw.len().min(4096))]);
        assert_eq!(store.registered_ids().len(), 2);
    }

    #[test]
    fn image_without_secure_child_fails() {
        let secureless = {
            let root = crate::layout::build::partition(
                IMAGE_MAGIC,
                IMAGE_ENTRY_SIZE,
                &[EntrySpec {
                    name: "update".into(),
                    data: vec![0; 64],
                }],
            );
            let mut out = vec![0u8; 0xF000];
            out.extend_from_slice(&root);
            out
        };

        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store), Box::new(keeper));
        let mut stream = ImageStream::new(shared);
        assert!(matches!(
            stream.feed(&secureless, 0),
            Err(InstallError::MissingSecurePartition)
        ));
    }
}
