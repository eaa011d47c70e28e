//! Encoder/decoder for the MTP wire primitives.
//!
//! Integers are little-endian. Strings are an 8-bit count of UTF-16LE code
//! units (including the terminating NUL; 0 means empty and no NUL follows)
//! and then the code units. Arrays are a u32 element count followed by the
//! elements back-to-back.

use crate::error::{Error, Result};
use crate::protocol::{ContainerHeader, CONTAINER_DATA, CONTAINER_HEADER_SIZE, CONTAINER_RESPONSE};
use crate::usb::BulkPipe;

/// Chunk size for outgoing bulk writes.
const WRITE_CHUNK: usize = 64 * 1024;
/// Internal receive buffer size.
const READ_CHUNK: usize = 64 * 1024;

/// A fixed-width unsigned wire integer.
pub trait Scalar: Copy {
    const SIZE: usize;
    fn put(self, out: &mut Vec<u8>);
    fn get(buf: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn put(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn get(buf: &[u8]) -> Self {
                let mut bytes = [0u8; Self::SIZE];
                bytes.copy_from_slice(&buf[..Self::SIZE]);
                <$t>::from_le_bytes(bytes)
            }
        }
    )*};
}

impl_scalar!(u8, u16, u32, u64, u128);

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Streaming decoder for one inbound container.
///
/// Create one per phase; `read_header` learns the container length and
/// subsequent reads count against it. `finalize` asserts the container was
/// fully consumed.
pub struct DataParser<'a, P: BulkPipe + ?Sized> {
    pipe: &'a mut P,
    chunk: Vec<u8>,
    pos: usize,
    /// Payload bytes left in the current container; `None` until the header
    /// is read, or when the host sent an unknown-length (0xFFFFFFFF) frame.
    remaining: Option<u64>,
    header_read: bool,
    ended: bool,
}

impl<'a, P: BulkPipe + ?Sized> DataParser<'a, P> {
    pub fn new(pipe: &'a mut P) -> Self {
        DataParser {
            pipe,
            chunk: Vec::new(),
            pos: 0,
            remaining: None,
            header_read: false,
            ended: false,
        }
    }

    /// Read the 12-byte bulk container header.
    pub fn read_header(&mut self) -> Result<ContainerHeader> {
        let mut raw = [0u8; CONTAINER_HEADER_SIZE];
        self.take_exact(&mut raw)?;
        let header = ContainerHeader::parse(&raw).ok_or(Error::UnknownRequestType)?;
        self.header_read = true;
        self.remaining = if header.length == u32::MAX {
            None
        } else {
            let len = header.length as u64;
            Some(len.saturating_sub(CONTAINER_HEADER_SIZE as u64))
        };
        Ok(header)
    }

    /// Read one fixed-width integer from the payload.
    pub fn read<T: Scalar>(&mut self) -> Result<T> {
        self.consume_budget(T::SIZE as u64)?;
        let mut raw = [0u8; 16];
        self.take_exact(&mut raw[..T::SIZE])?;
        Ok(T::get(&raw))
    }

    /// Read a length-prefixed UTF-16LE string.
    pub fn read_string(&mut self) -> Result<String> {
        let count = self.read::<u8>()? as usize;
        if count == 0 {
            return Ok(String::new());
        }
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(self.read::<u16>()?);
        }
        // Drop the terminating NUL (and anything after it).
        if let Some(nul) = units.iter().position(|&u| u == 0) {
            units.truncate(nul);
        }
        String::from_utf16(&units).map_err(|_| Error::InvalidPropertyValue)
    }

    /// Read payload bytes for a streaming data phase. Returns
    /// [`Error::EndOfTransmission`] once the container is exhausted.
    pub fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.remaining {
            Some(0) => return Err(Error::EndOfTransmission),
            _ if self.ended => return Err(Error::EndOfTransmission),
            _ => {}
        }

        let cap = match self.remaining {
            Some(rem) => (buf.len() as u64).min(rem) as usize,
            None => buf.len(),
        };

        // Drain what is already buffered before touching the pipe.
        let buffered = self.chunk.len() - self.pos;
        let n = if buffered > 0 {
            let n = buffered.min(cap);
            buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
            self.pos += n;
            n
        } else {
            let n = self.pipe.read(&mut buf[..cap])?;
            if n == 0 {
                // Zero-length transfer: the host ended an unknown-length phase.
                self.ended = true;
                return Err(Error::EndOfTransmission);
            }
            n
        };

        if let Some(rem) = self.remaining.as_mut() {
            *rem -= n as u64;
        }
        Ok(n)
    }

    /// Read and discard whatever is left of the container.
    pub fn discard_remaining(&mut self) -> Result<()> {
        let mut scratch = [0u8; 64];
        loop {
            match self.read_buffer(&mut scratch) {
                Ok(_) => {}
                Err(Error::EndOfTransmission) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Assert the container was fully consumed.
    pub fn finalize(&mut self) -> Result<()> {
        match self.remaining {
            Some(0) | None => Ok(()),
            Some(_) => Err(Error::InvalidArgument),
        }
    }

    fn consume_budget(&mut self, n: u64) -> Result<()> {
        match self.remaining.as_mut() {
            Some(rem) if self.header_read => {
                if *rem < n {
                    return Err(Error::InvalidArgument);
                }
                *rem -= n;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Copy exactly `out.len()` bytes from the pipe, refilling the internal
    /// buffer as transfers arrive.
    fn take_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.chunk.len() {
                self.chunk.resize(READ_CHUNK, 0);
                let n = self.pipe.read(&mut self.chunk)?;
                if n == 0 {
                    return Err(Error::UsbIo(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "short container",
                    )));
                }
                self.chunk.truncate(n);
                self.pos = 0;
            }
            let n = (out.len() - filled).min(self.chunk.len() - self.pos);
            out[filled..filled + n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Encoder for one outbound container.
///
/// For variable-length data, `begin_variable` reserves the 12-byte header,
/// the `add_*` calls append the payload, and `commit_variable` patches the
/// final length and flushes. For transfers whose size is known in advance,
/// `add_data_header` emits the header immediately and `add_buffer` streams
/// the body, flushing full chunks to the pipe as it goes.
#[derive(Default)]
pub struct DataBuilder {
    buf: Vec<u8>,
    variable: bool,
}

impl DataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_variable(&mut self, request: &ContainerHeader) {
        debug_assert!(self.buf.is_empty());
        let header = ContainerHeader::new(CONTAINER_DATA, request.code, request.trans_id, 0);
        header.emit(&mut self.buf);
        self.variable = true;
    }

    /// Patch the length field and send the whole container.
    pub fn commit_variable<P: BulkPipe + ?Sized>(&mut self, pipe: &mut P) -> Result<()> {
        debug_assert!(self.variable);
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        self.variable = false;
        self.flush(pipe)
    }

    /// Emit a data-phase header for a payload of known size.
    pub fn add_data_header<P: BulkPipe + ?Sized>(
        &mut self,
        pipe: &mut P,
        request: &ContainerHeader,
        payload_len: u64,
    ) -> Result<()> {
        let total = payload_len.saturating_add(CONTAINER_HEADER_SIZE as u64);
        let length = u32::try_from(total).unwrap_or(u32::MAX);
        let header = ContainerHeader {
            length,
            kind: CONTAINER_DATA,
            code: request.code,
            trans_id: request.trans_id,
        };
        header.emit(&mut self.buf);
        self.flush_full_chunks(pipe)
    }

    pub fn add<T: Scalar>(&mut self, value: T) {
        value.put(&mut self.buf);
    }

    pub fn add_array<T: Scalar>(&mut self, values: &[T]) {
        self.add(values.len() as u32);
        for &v in values {
            v.put(&mut self.buf);
        }
    }

    /// Append a length-prefixed UTF-16LE string. Longer strings are
    /// truncated to the 254 code units the 8-bit count can carry.
    pub fn add_string(&mut self, s: &str) {
        let mut units: Vec<u16> = s.encode_utf16().take(254).collect();
        if units.is_empty() {
            self.add(0u8);
            return;
        }
        units.push(0);
        self.add(units.len() as u8);
        for u in units {
            self.add(u);
        }
    }

    /// Append payload bytes, transparently flushing full chunks.
    pub fn add_buffer<P: BulkPipe + ?Sized>(&mut self, pipe: &mut P, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        self.flush_full_chunks(pipe)
    }

    /// Send everything still buffered.
    pub fn flush<P: BulkPipe + ?Sized>(&mut self, pipe: &mut P) -> Result<()> {
        for chunk in self.buf.chunks(WRITE_CHUNK) {
            pipe.write(chunk)?;
        }
        self.buf.clear();
        Ok(())
    }

    /// The encoded bytes, for callers that transmit out-of-band (tests and
    /// the host-side probe).
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn flush_full_chunks<P: BulkPipe + ?Sized>(&mut self, pipe: &mut P) -> Result<()> {
        while self.buf.len() >= WRITE_CHUNK {
            pipe.write(&self.buf[..WRITE_CHUNK])?;
            self.buf.drain(..WRITE_CHUNK);
        }
        Ok(())
    }
}

/// Write a response container with up to five u32 parameters.
pub fn write_response<P: BulkPipe + ?Sized>(
    pipe: &mut P,
    code: u16,
    trans_id: u32,
    params: &[u32],
) -> Result<()> {
    let mut out = Vec::with_capacity(CONTAINER_HEADER_SIZE + params.len() * 4);
    let header = ContainerHeader::new(
        CONTAINER_RESPONSE,
        code,
        trans_id,
        (params.len() * 4) as u32,
    );
    header.emit(&mut out);
    for &p in params {
        out.extend_from_slice(&p.to_le_bytes());
    }
    pipe.write(&out)
}
