//! Bounded producer/consumer engine moving N bytes from a read callback to
//! a write callback.
//!
//! Large transfers run a reader thread and a writer thread around a
//! two-slot ring; small ones run an inline loop. Either side's failure (or
//! a stop request surfacing through a callback) cancels the other side, and
//! the coordinator reports the first failure it finds, read side first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Per-slot transfer granularity.
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Ring capacity. Must be a power of two: indices advance modulo twice the
/// capacity so a full ring and an empty ring remain distinguishable.
const RING_CAPACITY: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Always run the two-thread pipeline.
    MultiThreaded,
    /// Always run the inline loop.
    SingleThreaded,
    /// Inline if the whole payload fits one buffer, threaded otherwise.
    SingleThreadedIfSmaller,
}

/// Move `size` bytes from `read` to `write`.
///
/// `read(buf, offset)` fills `buf` and returns the byte count (0 means the
/// producer ran dry early); `write(buf, offset)` consumes it. Offsets are
/// consecutive and non-overlapping, covering `[0, size)` in order.
pub fn transfer<R, W>(size: u64, read: R, write: W, mode: Mode) -> Result<()>
where
    R: FnMut(&mut [u8], u64) -> Result<usize> + Send,
    W: FnMut(&[u8], u64) -> Result<()> + Send,
{
    let mode = match mode {
        Mode::SingleThreadedIfSmaller if size <= BUFFER_SIZE as u64 => Mode::SingleThreaded,
        Mode::SingleThreadedIfSmaller => Mode::MultiThreaded,
        other => other,
    };
    match mode {
        Mode::SingleThreaded => transfer_inline(size, read, write),
        _ => transfer_threaded(size, read, write),
    }
}

fn transfer_inline<R, W>(size: u64, mut read: R, mut write: W) -> Result<()>
where
    R: FnMut(&mut [u8], u64) -> Result<usize>,
    W: FnMut(&[u8], u64) -> Result<()>,
{
    let mut buf = vec![0u8; BUFFER_SIZE.min(size.max(1) as usize)];
    let mut offset = 0u64;
    while offset < size {
        let want = (buf.len() as u64).min(size - offset) as usize;
        let n = read(&mut buf[..want], offset)?;
        if n == 0 {
            break;
        }
        write(&buf[..n], offset)?;
        offset += n as u64;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Threaded path
// ---------------------------------------------------------------------------

/// Two-slot SPSC queue of filled buffers. Buffers move by swap, so neither
/// side allocates in steady state.
struct Ring {
    slots: [Vec<u8>; RING_CAPACITY as usize],
    r_index: u32,
    w_index: u32,
}

impl Ring {
    fn new() -> Self {
        Ring {
            slots: Default::default(),
            r_index: 0,
            w_index: 0,
        }
    }

    fn len(&self) -> u32 {
        self.w_index.wrapping_sub(self.r_index) % (RING_CAPACITY * 2)
    }

    fn is_full(&self) -> bool {
        self.len() == RING_CAPACITY
    }

    fn push(&mut self, buf: &mut Vec<u8>) {
        std::mem::swap(&mut self.slots[(self.w_index % RING_CAPACITY) as usize], buf);
        self.w_index = (self.w_index + 1) % (RING_CAPACITY * 2);
    }

    fn pop(&mut self, buf: &mut Vec<u8>) {
        std::mem::swap(&mut self.slots[(self.r_index % RING_CAPACITY) as usize], buf);
        self.r_index = (self.r_index + 1) % (RING_CAPACITY * 2);
    }
}

struct Shared {
    ring: Mutex<Ring>,
    /// Signaled when a slot frees up; the reader waits here while full.
    can_read: Condvar,
    /// Signaled when a buffer is published; the writer waits here while empty.
    can_write: Condvar,
    /// Signaled by a failing side, and by the writer on normal completion.
    done: (Mutex<bool>, Condvar),

    read_result: Mutex<Option<Error>>,
    write_result: Mutex<Option<Error>>,
    failed: AtomicBool,
    read_running: AtomicBool,
    write_running: AtomicBool,
    write_offset: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Shared {
            ring: Mutex::new(Ring::new()),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
            done: (Mutex::new(false), Condvar::new()),
            read_result: Mutex::new(None),
            write_result: Mutex::new(None),
            failed: AtomicBool::new(false),
            read_running: AtomicBool::new(true),
            write_running: AtomicBool::new(true),
            write_offset: AtomicU64::new(0),
        }
    }

    fn ok(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    fn signal_done(&self) {
        let mut flag = self.done.0.lock().unwrap();
        *flag = true;
        self.done.1.notify_all();
    }

    fn wait_done(&self) {
        let mut flag = self.done.0.lock().unwrap();
        while !*flag {
            flag = self.done.1.wait(flag).unwrap();
        }
    }

    fn wake_all(&self) {
        let _guard = self.ring.lock().unwrap();
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    /// Publish a filled buffer. Returns `false` when the transfer is
    /// aborting (peer exit or recorded failure).
    fn push(&self, buf: &mut Vec<u8>) -> bool {
        let mut ring: MutexGuard<'_, Ring> = self.ring.lock().unwrap();
        while ring.is_full() {
            if !self.write_running.load(Ordering::Acquire) || !self.ok() {
                return false;
            }
            ring = self.can_read.wait(ring).unwrap();
        }
        if !self.ok() {
            return false;
        }
        ring.push(buf);
        self.can_write.notify_one();
        true
    }

    /// Take the next filled buffer. Returns `false` when the ring drained
    /// and the reader is gone, or the transfer is aborting.
    fn pop(&self, buf: &mut Vec<u8>) -> bool {
        let mut ring = self.ring.lock().unwrap();
        while ring.len() == 0 {
            if !self.read_running.load(Ordering::Acquire) || !self.ok() {
                return false;
            }
            ring = self.can_write.wait(ring).unwrap();
        }
        if !self.ok() {
            return false;
        }
        ring.pop(buf);
        self.can_read.notify_one();
        true
    }
}

fn transfer_threaded<R, W>(size: u64, mut read: R, mut write: W) -> Result<()>
where
    R: FnMut(&mut [u8], u64) -> Result<usize> + Send,
    W: FnMut(&[u8], u64) -> Result<()> + Send,
{
    let shared = Shared::new();
    let shared = &shared;

    thread::scope(|s| {
        s.spawn(move || {
            let result = (|| {
                let mut buf: Vec<u8> = Vec::with_capacity(BUFFER_SIZE);
                let mut offset = 0u64;
                while offset < size && shared.ok() {
                    let want = (BUFFER_SIZE as u64).min(size - offset) as usize;
                    buf.resize(want, 0);
                    let n = read(&mut buf[..want], offset)?;
                    if n == 0 {
                        break;
                    }
                    buf.truncate(n);
                    offset += n as u64;
                    if !shared.push(&mut buf) {
                        break;
                    }
                }
                Ok(())
            })();
            shared.read_running.store(false, Ordering::Release);
            if let Err(e) = result {
                *shared.read_result.lock().unwrap() = Some(e);
                shared.failed.store(true, Ordering::Release);
                shared.signal_done();
            }
            shared.wake_all();
        });

        s.spawn(move || {
            let result = (|| {
                let mut buf: Vec<u8> = Vec::with_capacity(BUFFER_SIZE);
                loop {
                    let offset = shared.write_offset.load(Ordering::Relaxed);
                    if offset >= size || !shared.ok() {
                        break;
                    }
                    if !shared.pop(&mut buf) {
                        break;
                    }
                    if buf.is_empty() {
                        break;
                    }
                    write(&buf, offset)?;
                    shared
                        .write_offset
                        .store(offset + buf.len() as u64, Ordering::Relaxed);
                }
                Ok(())
            })();
            shared.write_running.store(false, Ordering::Release);
            if let Err(e) = result {
                *shared.write_result.lock().unwrap() = Some(e);
                shared.failed.store(true, Ordering::Release);
            }
            shared.signal_done();
            shared.wake_all();
        });

        // Wait until either a failure or the writer finishing, then keep
        // both sides awake until they have observed the outcome and exited.
        shared.wait_done();
        loop {
            shared.wake_all();
            if !shared.read_running.load(Ordering::Acquire)
                && !shared.write_running.load(Ordering::Acquire)
            {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }
    });

    if let Some(e) = shared.read_result.lock().unwrap().take() {
        return Err(e);
    }
    if let Some(e) = shared.write_result.lock().unwrap().take() {
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn run(size: u64, source_chunk: usize, mode: Mode) -> (Vec<(u64, usize)>, Vec<u8>) {
        let source: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let writes = StdMutex::new(Vec::new());
        let sink = StdMutex::new(vec![0u8; size as usize]);
        transfer(
            size,
            |buf, off| {
                let n = buf.len().min(source_chunk).min(source.len() - off as usize);
                buf[..n].copy_from_slice(&source[off as usize..off as usize + n]);
                Ok(n)
            },
            |buf, off| {
                writes.lock().unwrap().push((off, buf.len()));
                sink.lock().unwrap()[off as usize..off as usize + buf.len()].copy_from_slice(buf);
                Ok(())
            },
            mode,
        )
        .unwrap();
        let expected = source;
        let got = sink.into_inner().unwrap();
        assert_eq!(got, expected);
        (writes.into_inner().unwrap(), got)
    }

    #[test]
    fn three_mib_multi_threaded_writes_three_ordered_chunks() {
        let size = 3 * BUFFER_SIZE as u64;
        let (writes, _) = run(size, BUFFER_SIZE, Mode::MultiThreaded);
        assert_eq!(writes.len(), 3);
        let mut expect = 0u64;
        for (off, len) in writes {
            assert_eq!(off, expect);
            expect += len as u64;
        }
        assert_eq!(expect, size);
    }

    #[test]
    fn uneven_tail_is_covered() {
        let size = BUFFER_SIZE as u64 * 2 + 12345;
        let (writes, _) = run(size, BUFFER_SIZE, Mode::MultiThreaded);
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2].1, 12345);
    }

    #[test]
    fn small_transfer_stays_inline() {
        let (writes, _) = run(100, BUFFER_SIZE, Mode::SingleThreadedIfSmaller);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (0, 100));
    }

    #[test]
    fn short_reads_produce_consecutive_ranges() {
        let (writes, _) = run(10_000, 1000, Mode::MultiThreaded);
        assert_eq!(writes.len(), 10);
        let mut expect = 0u64;
        for (off, len) in writes {
            assert_eq!(off, expect);
            expect += len as u64;
        }
    }

    #[test]
    fn read_failure_propagates() {
        let result = transfer(
            BUFFER_SIZE as u64 * 4,
            |_buf, off| {
                if off >= BUFFER_SIZE as u64 {
                    Err(Error::StopRequested)
                } else {
                    Ok(BUFFER_SIZE)
                }
            },
            |_buf, _off| Ok(()),
            Mode::MultiThreaded,
        );
        assert!(matches!(result, Err(Error::StopRequested)));
    }

    #[test]
    fn write_failure_cancels_reader() {
        let reads = StdMutex::new(0u32);
        let result = transfer(
            BUFFER_SIZE as u64 * 100,
            |buf, _off| {
                *reads.lock().unwrap() += 1;
                buf.fill(0);
                Ok(buf.len())
            },
            |_buf, _off| Err(Error::InvalidArgument),
            Mode::MultiThreaded,
        );
        assert!(matches!(result, Err(Error::InvalidArgument)));
        // The reader stops within a couple of buffers of the failure.
        assert!(*reads.lock().unwrap() < 10);
    }

    #[test]
    fn early_producer_end_truncates_cleanly() {
        let result = transfer(
            1000,
            |buf, off| {
                if off >= 500 {
                    Ok(0)
                } else {
                    let n = buf.len().min(500);
                    buf[..n].fill(1);
                    Ok(n)
                }
            },
            |_buf, _off| Ok(()),
            Mode::MultiThreaded,
        );
        assert!(result.is_ok());
    }
}
