//! USB bulk pipe abstraction and the shared stop token.
//!
//! The responder only ever sees a [`BulkPipe`]: one bulk-in/bulk-out pair
//! that moves whole transfers. A short read marks the end of a transfer.
//! [`FunctionFsPipe`](crate::ffs::FunctionFsPipe) backs it with real gadget
//! endpoints; [`LoopbackPipe`] backs it with an in-memory duplex pair for
//! tests and same-process harnesses.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Bidirectional byte carrier on one pair of USB bulk endpoints.
pub trait BulkPipe: Send {
    /// Receive up to one bulk transfer. Blocks until data arrives or the
    /// stop token fires. Returns the number of bytes read; a read shorter
    /// than `buf` ends the current transfer.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Send one bulk transfer.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Attach to the host (bind the UDC). Used for forced re-enumeration.
    fn enable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Detach from the host.
    fn disable(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One-shot cancellation flag shared by the server, the pipe, and the
/// filesystem proxy. Once signaled, every subsequent blocking operation
/// reports [`Error::StopRequested`].
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap();
        self.inner.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Error::StopRequested)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Loopback pipe
// ---------------------------------------------------------------------------

/// One direction of the loopback: a queue of whole transfers.
struct Channel {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

#[derive(Default)]
struct ChannelState {
    packets: VecDeque<Vec<u8>>,
    /// Remainder of a transfer larger than the reader's buffer.
    partial: Option<(Vec<u8>, usize)>,
    closed: bool,
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Channel {
            state: Mutex::new(ChannelState::default()),
            cond: Condvar::new(),
        })
    }

    fn push(&self, data: Vec<u8>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
        }
        state.packets.push_back(data);
        self.cond.notify_all();
        Ok(())
    }

    /// Pop up to `buf.len()` bytes of the next transfer, waiting for one to
    /// arrive. `stop` aborts the wait when provided.
    fn pop(&self, buf: &mut [u8], stop: Option<&StopToken>) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(stop) = stop {
                stop.check()?;
            }
            if let Some((data, pos)) = state.partial.take() {
                return Ok(Self::copy_out(&mut state, data, pos, buf));
            }
            if let Some(data) = state.packets.pop_front() {
                return Ok(Self::copy_out(&mut state, data, 0, buf));
            }
            if state.closed {
                return Err(Error::UsbIo(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed",
                )));
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap();
            state = next;
        }
    }

    fn copy_out(state: &mut ChannelState, data: Vec<u8>, pos: usize, buf: &mut [u8]) -> usize {
        let n = (data.len() - pos).min(buf.len());
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        if pos + n < data.len() {
            state.partial = Some((data, pos + n));
        }
        n
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// Device end of an in-memory bulk pipe pair.
pub struct LoopbackPipe {
    to_device: Arc<Channel>,
    to_host: Arc<Channel>,
    stop: StopToken,
}

/// Host end of an in-memory bulk pipe pair. Sends command/data transfers
/// and receives the responder's output transfers.
pub struct LoopbackHost {
    to_device: Arc<Channel>,
    to_host: Arc<Channel>,
}

impl LoopbackPipe {
    /// Create a connected device/host pair sharing `stop`.
    pub fn pair(stop: StopToken) -> (LoopbackPipe, LoopbackHost) {
        let to_device = Channel::new();
        let to_host = Channel::new();
        (
            LoopbackPipe {
                to_device: Arc::clone(&to_device),
                to_host: Arc::clone(&to_host),
                stop,
            },
            LoopbackHost { to_device, to_host },
        )
    }
}

impl BulkPipe for LoopbackPipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.to_device.pop(buf, Some(&self.stop))
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stop.check()?;
        self.to_host.push(buf.to_vec()).map_err(Error::UsbIo)
    }
}

impl Drop for LoopbackPipe {
    fn drop(&mut self) {
        self.to_host.close();
        self.to_device.close();
    }
}

impl LoopbackHost {
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        self.to_device.push(data.to_vec())
    }

    /// Receive one transfer from the device, blocking until it arrives or
    /// the device end is dropped.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.to_host.pop(buf, None).map_err(|e| match e {
            Error::UsbIo(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        })
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        self.to_device.close();
        self.to_host.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn transfers_cross_the_pipe() {
        let (mut dev, host) = LoopbackPipe::pair(StopToken::new());
        host.send(b"abc").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(dev.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        dev.write(b"xy").unwrap();
        assert_eq!(host.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"xy");
    }

    #[test]
    fn oversized_transfer_is_split_across_reads() {
        let (mut dev, host) = LoopbackPipe::pair(StopToken::new());
        host.send(&[7u8; 10]).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(dev.read(&mut buf).unwrap(), 6);
        assert_eq!(dev.read(&mut buf).unwrap(), 4);
    }

    #[test]
    fn stop_token_aborts_blocked_read() {
        let stop = StopToken::new();
        let (mut dev, _host) = LoopbackPipe::pair(stop.clone());
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            dev.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        stop.signal();
        assert!(matches!(handle.join().unwrap(), Err(Error::StopRequested)));
    }
}
