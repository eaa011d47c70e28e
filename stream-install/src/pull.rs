//! Pull-mode disk-image install: the MTP write callback pushes bytes into
//! a bounded queue, and a consumer thread walks the partition structure
//! with positional reads against that queue, seeing the archive as a
//! forward-only stream starting at 0.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::entry::{EntryKind, EntryWriter, InstallShared};
use crate::error::{InstallError, InstallResult};
use crate::layout::{
    parse_partition, Partition, PartitionHeader, IMAGE_ENTRY_SIZE, IMAGE_MAGIC,
    PARTITION_HEADER_SIZE,
};
use crate::image::ROOT_OFFSETS;
use crate::manager::StreamInstaller;

/// Producer/consumer byte budget.
const QUEUE_CAPACITY: usize = 1024 * 1024;
/// Consumer-side read batch.
const READ_BATCH: usize = 0x40_0000;

/// Bounded FIFO of raw bytes. The producer blocks while full, the
/// consumer while empty; `disable` unblocks both for shutdown.
pub struct ChunkQueue {
    state: Mutex<QueueState>,
    can_read: Condvar,
    can_write: Condvar,
    capacity: usize,
}

struct QueueState {
    buf: VecDeque<u8>,
    active: bool,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        ChunkQueue {
            state: Mutex::new(QueueState {
                buf: VecDeque::new(),
                active: true,
            }),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
            capacity,
        }
    }

    /// Append all of `data`, blocking while the queue is full. Returns
    /// `false` once disabled.
    pub fn push(&self, mut data: &[u8]) -> bool {
        while !data.is_empty() {
            let mut state = self.state.lock().unwrap();
            while state.active && state.buf.len() >= self.capacity {
                state = self.can_write.wait(state).unwrap();
            }
            if !state.active {
                return false;
            }
            let writable = self.capacity - state.buf.len();
            let chunk = writable.min(data.len());
            state.buf.extend(&data[..chunk]);
            data = &data[chunk..];
            drop(state);
            self.can_read.notify_one();
        }
        true
    }

    /// Pop up to `out.len()` bytes, blocking while empty. `None` once
    /// disabled and drained.
    pub fn read_chunk(&self, out: &mut [u8]) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        while state.active && state.buf.is_empty() {
            state = self.can_read.wait(state).unwrap();
        }
        if state.buf.is_empty() {
            return None;
        }
        let n = out.len().min(state.buf.len());
        for (slot, byte) in out[..n].iter_mut().zip(state.buf.drain(..n)) {
            *slot = byte;
        }
        drop(state);
        self.can_write.notify_one();
        Some(n)
    }

    pub fn disable(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = false;
        self.can_read.notify_all();
        self.can_write.notify_all();
    }
}

/// Positional reader over the queue. Offsets must never move backwards;
/// skipped ranges are drained and discarded. Reads loop internally, so a
/// request larger than the queue capacity still completes.
pub struct StreamSource {
    queue: Arc<ChunkQueue>,
    offset: u64,
}

impl StreamSource {
    pub fn new(queue: Arc<ChunkQueue>) -> Self {
        StreamSource { queue, offset: 0 }
    }

    pub fn read_at(&mut self, offset: u64, out: &mut [u8]) -> InstallResult<()> {
        if offset < self.offset {
            return Err(InstallError::BackwardSeek);
        }

        let mut skip_buf = [0u8; 64 * 1024];
        while self.offset < offset {
            let want = ((offset - self.offset) as usize).min(skip_buf.len());
            let n = self
                .queue
                .read_chunk(&mut skip_buf[..want])
                .ok_or(InstallError::UnexpectedEof)?;
            self.offset += n as u64;
        }

        let mut filled = 0;
        while filled < out.len() {
            let n = self
                .queue
                .read_chunk(&mut out[filled..])
                .ok_or(InstallError::UnexpectedEof)?;
            filled += n;
            self.offset += n as u64;
        }
        Ok(())
    }
}

/// Read one partition header (plus tables) at `offset`. `None` when the
/// magic does not match — the probe moves on.
fn read_partition(source: &mut StreamSource, offset: u64) -> InstallResult<Option<Partition>> {
    let mut raw = vec![0u8; PARTITION_HEADER_SIZE];
    source.read_at(offset, &mut raw)?;

    let header = match PartitionHeader::parse(&raw, IMAGE_MAGIC) {
        Ok(Some(header)) => header,
        Ok(None) => return Err(InstallError::UnexpectedEof),
        Err(InstallError::BadMagic { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let full_size = header.full_size(IMAGE_ENTRY_SIZE);
    raw.resize(full_size, 0);
    source.read_at(
        offset + PARTITION_HEADER_SIZE as u64,
        &mut raw[PARTITION_HEADER_SIZE..],
    )?;

    parse_partition(&raw, IMAGE_ENTRY_SIZE, IMAGE_MAGIC)
}

fn run_install(mut source: StreamSource, shared: Arc<InstallShared>) -> InstallResult<()> {
    // Probe the two candidate root offsets; both probes move forward, so
    // no rewind is needed when the first misses.
    let mut root = None;
    let mut root_offset = 0;
    for offset in ROOT_OFFSETS {
        if let Some(partition) = read_partition(&mut source, offset)? {
            root = Some(partition);
            root_offset = offset;
            break;
        }
    }
    let root = root.ok_or(InstallError::BadMagic { found: 0 })?;

    let secure_entry = root
        .entry("secure")
        .ok_or(InstallError::MissingSecurePartition)?;
    let secure_offset = root_offset + root.header_size + secure_entry.data_offset;

    let secure = read_partition(&mut source, secure_offset)?
        .ok_or(InstallError::MissingSecurePartition)?;

    log::info!("disk image (pull): {} content entries", secure.entries.len());

    // Stream entries in archive order; each is read in large batches that
    // the queue serves incrementally.
    let mut entries: Vec<_> = secure.entries.clone();
    entries.sort_by_key(|e| e.data_offset);

    let mut writers = Vec::with_capacity(entries.len());
    let mut batch = vec![0u8; READ_BATCH];
    for entry in &entries {
        let data_start = secure_offset + secure.header_size + entry.data_offset;
        let mut writer = EntryWriter::new(&entry.name, data_start, entry.size, Arc::clone(&shared));

        let mut written = 0u64;
        while written < entry.size {
            let want = ((entry.size - written) as usize).min(batch.len());
            source.read_at(data_start + written, &mut batch[..want])?;
            writer.write(written, &batch[..want])?;
            written += want as u64;
        }
        writers.push(writer);
    }

    // Pull mode pairs tickets with certificates by basename.
    for ticket in writers.iter().filter(|w| w.kind() == EntryKind::Ticket) {
        let stem = ticket.name().trim_end_matches(".tik");
        let cert = writers
            .iter()
            .find(|w| w.kind() == EntryKind::Certificate && w.name().trim_end_matches(".cert") == stem);
        if let Some(cert) = cert {
            if !ticket.buffered().is_empty() && !cert.buffered().is_empty() {
                shared
                    .import_ticket(ticket.buffered(), cert.buffered())
                    .map_err(|e| InstallError::Ticket(e.to_string()))?;
            }
        }
    }

    shared.commit_all()
}

/// Disk-image installer running the demultiplexer on its own thread.
pub struct ImagePullStream {
    queue: Arc<ChunkQueue>,
    expected_offset: u64,
    thread: Option<JoinHandle<InstallResult<()>>>,
}

impl ImagePullStream {
    pub fn new(shared: Arc<InstallShared>) -> Self {
        let queue = Arc::new(ChunkQueue::new(QUEUE_CAPACITY));
        let consumer_queue = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name("image-pull".into())
            .spawn(move || {
                let result = run_install(StreamSource::new(Arc::clone(&consumer_queue)), shared);
                // Unblock the producer whether we finished or died.
                consumer_queue.disable();
                if let Err(e) = &result {
                    log::warn!("pull-mode install failed: {e}");
                }
                result
            })
            .expect("spawn pull-mode installer");
        ImagePullStream {
            queue,
            expected_offset: 0,
            thread: Some(thread),
        }
    }

    fn join(&mut self) -> InstallResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or(Err(InstallError::Store("install thread panicked".into()))),
            None => Ok(()),
        }
    }
}

impl StreamInstaller for ImagePullStream {
    fn feed(&mut self, data: &[u8], offset: u64) -> InstallResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        // The consumer sees a positional stream; the producer must keep
        // offsets monotonic and gap-free.
        if offset != self.expected_offset {
            return Err(InstallError::OutOfOrder {
                name: "image stream".into(),
                offset,
                expected: self.expected_offset,
            });
        }
        self.expected_offset += data.len() as u64;
        if !self.queue.push(data) {
            return Err(InstallError::Store("install thread stopped".into()));
        }
        Ok(())
    }

    fn finalize(&mut self) -> InstallResult<()> {
        self.queue.disable();
        self.join()
    }
}

impl Drop for ImagePullStream {
    fn drop(&mut self) {
        self.queue.disable();
        let _ = self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::build::image;
    use crate::layout::build::EntrySpec;
    use crate::store::{ContentId, MemoryContentStore, MemoryTitleKeeper};

    #[test]
    fn queue_round_trips_across_threads() {
        let queue = Arc::new(ChunkQueue::new(16));
        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            let data: Vec<u8> = (0..100u8).collect();
            assert!(producer_queue.push(&data));
            producer_queue.disable();
        });

        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        while let Some(n) = queue.read_chunk(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        producer.join().unwrap();
        assert_eq!(out, (0..100u8).collect::<Vec<u8>>());
    }

    #[test]
    fn source_reads_larger_than_queue_capacity() {
        let queue = Arc::new(ChunkQueue::new(64));
        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            let data = vec![0xABu8; 1000];
            assert!(producer_queue.push(&data));
            producer_queue.disable();
        });

        let mut source = StreamSource::new(queue);
        let mut out = vec![0u8; 1000];
        source.read_at(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xAB));
        producer.join().unwrap();
    }

    #[test]
    fn backward_seek_is_rejected() {
        let queue = Arc::new(ChunkQueue::new(64));
        queue.push(&[0u8; 32]);
        let mut source = StreamSource::new(Arc::clone(&queue));
        let mut buf = [0u8; 16];
        source.read_at(8, &mut buf).unwrap();
        assert!(matches!(
            source.read_at(0, &mut buf),
            Err(InstallError::BackwardSeek)
        ));
    }

    #[test]
    fn pull_mode_installs_a_disk_image() {
        let raw = image(
            0x10000,
            &[
                EntrySpec {
                    name: format!("{}.nca", ContentId::new([0x66; 16])),
                    data: vec![0x66; 2_500_000],
                },
                EntrySpec {
                    name: format!("{}.nca", ContentId::new([0x77; 16])),
                    data: vec![0x77; 123],
                },
            ],
        );

        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store.clone()), Box::new(keeper));
        let mut stream = ImagePullStream::new(shared);

        let mut offset = 0u64;
        for chunk in raw.chunks(64 * 1024) {
            stream.feed(chunk, offset).unwrap();
            offset += chunk.len() as u64;
        }
        stream.finalize().unwrap();

        let blob = store.registered_blob(&ContentId::new([0x66; 16])).unwrap();
        assert_eq!(blob.len(), 2_500_000);
        assert!(store.registered_blob(&ContentId::new([0x77; 16])).is_some());
    }

    #[test]
    fn non_monotonic_producer_offsets_fail() {
        let store = MemoryContentStore::new();
        let keeper = MemoryTitleKeeper::new();
        let shared = InstallShared::new(Box::new(store), Box::new(keeper));
        let mut stream = ImagePullStream::new(shared);

        stream.feed(&[0u8; 100], 0).unwrap();
        assert!(matches!(
            stream.feed(&[0u8; 100], 50),
            Err(InstallError::OutOfOrder { .. })
        ));
    }
}
