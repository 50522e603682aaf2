//! Buffered stream over an OS pipe.
//!
//! A `PipeStream` owns both ends of one kernel pipe. Children get
//! duplicates of an end as their stdio; the parent reads and writes through
//! the stream itself. Reads go through a userspace buffer so a reader can
//! `mark()` a position, read ahead, and `reset()` back to it.
//!
//! ```text
//!   write() ──▶ [write fd] ══ kernel pipe ══ [read fd] ──▶ ReadBuffer ──▶ read()
//!                  │                            │              ├── mark/reset/unmark
//!                  ├── backpressure when full   │              └── survives close_write
//!                  └── close_write → EOF        └── close_read → reads return 0
//! ```
//!
//! Each end is `Raw` (a blocking fd, as created) until the parent first
//! uses it, at which point it becomes `Active`: non-blocking and registered
//! with the tokio reactor. Ends handed to children are switched back to
//! blocking first, since the flag is shared between duplicates.
//!
//! The buffer sits behind a `std::sync::Mutex` held only for `VecDeque`
//! operations. The ends sit behind tokio mutexes since reads and writes
//! await while holding them.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::pin::pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use pipewright_types::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::trace;

use super::limits::fd_error;

/// Bytes pulled from the kernel per read.
const READ_CHUNK: usize = 8 * 1024;

const OPEN: u8 = 0;
const ACTIVE: u8 = 1;
const CLOSED: u8 = 2;

fn state_name(state: u8) -> &'static str {
    match state {
        OPEN => "open",
        ACTIVE => "active",
        _ => "closed",
    }
}

/// Which end of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Read,
    Write,
}

enum End<T> {
    Raw(OwnedFd),
    Active(T),
    Closed,
}

impl<T> End<T> {
    fn take(&mut self) -> End<T> {
        std::mem::replace(self, End::Closed)
    }
}

/// Unread bytes plus whatever a mark still needs.
#[derive(Debug, Default)]
struct ReadBuffer {
    /// Bytes from absolute offset `base` onward.
    data: VecDeque<u8>,
    base: u64,
    /// Absolute read offset. `base <= mark <= pos`.
    pos: u64,
    mark: Option<u64>,
    eof: bool,
}

impl ReadBuffer {
    fn unread(&self) -> usize {
        (self.base + self.data.len() as u64 - self.pos) as usize
    }

    fn unread_slice_start(&self) -> usize {
        (self.pos - self.base) as usize
    }

    fn copy_out(&mut self, buf: &mut [u8]) -> usize {
        let start = self.unread_slice_start();
        let n = buf.len().min(self.unread());
        for (dst, src) in buf[..n].iter_mut().zip(self.data.range(start..start + n)) {
            *dst = *src;
        }
        self.advance(n);
        n
    }

    fn advance(&mut self, n: usize) {
        self.pos += n as u64;
        self.trim();
    }

    /// Drop bytes nobody can read again.
    fn trim(&mut self) {
        let keep = self.mark.unwrap_or(self.pos);
        let drop = (keep - self.base) as usize;
        self.data.drain(..drop);
        self.base = keep;
    }
}

/// A full-duplex buffered stream over one OS pipe.
pub struct PipeStream {
    write_fd: RawFd,
    read_fd: RawFd,
    write_state: AtomicU8,
    read_state: AtomicU8,
    writer: AsyncMutex<End<pipe::Sender>>,
    reader: AsyncMutex<End<pipe::Receiver>>,
    /// Wakes writers blocked on backpressure when the write side closes.
    write_closing: Notify,
    /// Wakes readers blocked on an empty pipe when the read side closes.
    read_closing: Notify,
    buffer: Mutex<ReadBuffer>,
}

impl PipeStream {
    /// Create a new OS pipe. Both ends are close-on-exec.
    pub fn new() -> Result<Self> {
        let (read, write) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| fd_error("creating a pipe", io::Error::from(e)))?;
        Ok(Self {
            write_fd: write.as_raw_fd(),
            read_fd: read.as_raw_fd(),
            write_state: AtomicU8::new(OPEN),
            read_state: AtomicU8::new(OPEN),
            writer: AsyncMutex::new(End::Raw(write)),
            reader: AsyncMutex::new(End::Raw(read)),
            write_closing: Notify::new(),
            read_closing: Notify::new(),
            buffer: Mutex::new(ReadBuffer::default()),
        })
    }

    /// Create a new OS pipe, ready to share between redirects.
    pub fn shared() -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new()?))
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, ReadBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_state.load(Ordering::Acquire) == CLOSED
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_state.load(Ordering::Acquire) == CLOSED
    }

    /// Unread bytes held in this stream's buffer.
    ///
    /// Bytes still in the kernel pipe are not counted.
    pub fn bytes_waiting(&self) -> usize {
        self.buffer().unread()
    }

    // ── Writing ──────────────────────────────────────────────────────────

    /// Write all of `data`, waiting while the pipe is full.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut closing = pin!(self.write_closing.notified());
        closing.as_mut().enable();
        if self.is_write_closed() {
            return Err(Error::WriteClosed);
        }

        let mut end = self.writer.lock().await;
        let tx = activate(&mut *end, &self.write_state, pipe::Sender::from_owned_fd)?
            .ok_or(Error::WriteClosed)?;
        if data.is_empty() {
            return Ok(());
        }

        tokio::select! {
            result = tx.write_all(data) => {
                result.map_err(|e| Error::io("writing to pipe", e))?;
                trace!(fd = self.write_fd, bytes = data.len(), "pipe write");
                Ok(())
            }
            _ = &mut closing => Err(Error::WriteClosed),
        }
    }

    /// Close the write side. Readers drain what was written, then see EOF
    /// once no child holds the write end either.
    pub async fn close_write(&self) {
        self.write_state.store(CLOSED, Ordering::Release);
        self.write_closing.notify_waiters();
        let mut end = self.writer.lock().await;
        drop(end.take());
    }

    // ── Reading ──────────────────────────────────────────────────────────

    /// Read into `buf`, waiting for data. Returns 0 at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(n) = self.take_buffered(buf) {
                return Ok(n);
            }
            self.fill().await?;
        }
    }

    /// Read without waiting. `None` means no data is available yet.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if let Some(n) = self.take_buffered(buf) {
            return Ok(Some(n));
        }
        // Somebody else is reading; nothing to take without waiting.
        let Ok(mut end) = self.reader.try_lock() else {
            return Ok(None);
        };
        let Some(rx) = activate(&mut *end, &self.read_state, pipe::Receiver::from_owned_fd)? else {
            return Ok(Some(0));
        };

        // Read through a duplicate so the attempt bypasses reactor
        // readiness, which lags behind a freshly registered fd.
        let mut file = File::from(
            rx.as_fd()
                .try_clone_to_owned()
                .map_err(|e| fd_error("duplicating the pipe read end", e))?,
        );
        let mut chunk = [0u8; READ_CHUNK];
        match file.read(&mut chunk) {
            Ok(n) => {
                self.push(&chunk[..n]);
                Ok(Some(self.take_buffered(buf).unwrap_or(0)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::io("reading from pipe", e)),
        }
    }

    /// Read until `n` bytes arrive or the stream ends.
    pub async fn read_exact_or_eof(&self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = self.read(&mut out[filled..]).await?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Read everything until end of stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn read_to_string(&self) -> Result<String> {
        utf8(self.read_to_end().await?)
    }

    /// Read one line, newline included. Returns an empty string at end of
    /// stream.
    pub async fn read_line(&self) -> Result<String> {
        loop {
            if let Some(line) = self.take_line() {
                return utf8(line);
            }
            self.fill().await?;
        }
    }

    /// Close the read side and discard anything buffered.
    pub async fn close_read(&self) {
        self.read_state.store(CLOSED, Ordering::Release);
        self.read_closing.notify_waiters();
        let mut end = self.reader.lock().await;
        drop(end.take());
        let mut buffer = self.buffer();
        buffer.data.clear();
        buffer.base = buffer.pos;
        buffer.mark = None;
        buffer.eof = true;
    }

    /// Close both sides. The stream is inert afterwards.
    pub async fn close(&self) {
        self.close_write().await;
        self.close_read().await;
    }

    // ── Mark / reset ─────────────────────────────────────────────────────

    /// Remember the current read offset and return it.
    ///
    /// Bytes read after a mark are kept until `reset()` or `unmark()`.
    pub fn mark(&self) -> u64 {
        let mut buffer = self.buffer();
        buffer.mark = Some(buffer.pos);
        buffer.pos
    }

    /// Rewind to the mark, consuming it.
    pub fn reset(&self) -> Result<u64> {
        let mut buffer = self.buffer();
        let mark = buffer.mark.take().ok_or(Error::NotMarked)?;
        buffer.pos = mark;
        Ok(mark)
    }

    /// Forget the mark. Returns whether one was set.
    pub fn unmark(&self) -> bool {
        let mut buffer = self.buffer();
        let had = buffer.mark.take().is_some();
        buffer.trim();
        had
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Serve from the buffer. `Some(0)` means end of stream.
    fn take_buffered(&self, buf: &mut [u8]) -> Option<usize> {
        let mut buffer = self.buffer();
        if buffer.unread() > 0 {
            return Some(buffer.copy_out(buf));
        }
        if buffer.eof || self.is_read_closed() {
            return Some(0);
        }
        None
    }

    fn take_line(&self) -> Option<Vec<u8>> {
        let mut buffer = self.buffer();
        let start = buffer.unread_slice_start();
        let newline = buffer.data.range(start..).position(|&b| b == b'\n');
        let len = match newline {
            Some(i) => i + 1,
            None if buffer.eof || self.is_read_closed() => buffer.unread(),
            None => return None,
        };
        let line: Vec<u8> = buffer.data.range(start..start + len).copied().collect();
        buffer.advance(len);
        Some(line)
    }

    fn push(&self, bytes: &[u8]) {
        let mut buffer = self.buffer();
        if bytes.is_empty() {
            buffer.eof = true;
        } else {
            buffer.data.extend(bytes);
        }
    }

    /// Pull one chunk from the kernel into the buffer.
    async fn fill(&self) -> Result<()> {
        let mut closing = pin!(self.read_closing.notified());
        closing.as_mut().enable();
        if self.is_read_closed() {
            return Ok(());
        }

        let mut end = self.reader.lock().await;
        // Another reader may have filled the buffer while we waited.
        {
            let buffer = self.buffer();
            if buffer.unread() > 0 || buffer.eof {
                return Ok(());
            }
        }
        let Some(rx) = activate(&mut *end, &self.read_state, pipe::Receiver::from_owned_fd)? else {
            return Ok(());
        };

        let mut chunk = [0u8; READ_CHUNK];
        tokio::select! {
            result = rx.read(&mut chunk) => {
                let n = result.map_err(|e| Error::io("reading from pipe", e))?;
                trace!(fd = self.read_fd, bytes = n, "pipe read");
                self.push(&chunk[..n]);
            }
            _ = &mut closing => {}
        }
        Ok(())
    }

    /// Duplicate one end as a blocking descriptor for a child's stdio.
    ///
    /// The parent keeps its own copy until [`release`](Self::release).
    pub(crate) async fn child_end(&self, side: Side) -> Result<OwnedFd> {
        match side {
            Side::Write => {
                let mut end = self.writer.lock().await;
                deactivate(&mut *end, &self.write_state, pipe::Sender::into_blocking_fd)?;
                match &*end {
                    End::Raw(fd) => fd
                        .try_clone()
                        .map_err(|e| fd_error("duplicating the pipe write end", e)),
                    _ => Err(Error::WriteClosed),
                }
            }
            Side::Read => {
                let mut end = self.reader.lock().await;
                deactivate(&mut *end, &self.read_state, pipe::Receiver::into_blocking_fd)?;
                match &*end {
                    End::Raw(fd) => fd
                        .try_clone()
                        .map_err(|e| fd_error("duplicating the pipe read end", e)),
                    _ => Err(Error::io(
                        "handing out the pipe read end",
                        io::Error::from(io::ErrorKind::BrokenPipe),
                    )),
                }
            }
        }
    }

    /// Drop the parent's copy of an end that was handed to children.
    pub(crate) async fn release(&self, side: Side) {
        match side {
            Side::Write => self.close_write().await,
            Side::Read => self.close_read().await,
        }
    }
}

/// Register a raw end with the reactor on first use.
fn activate<'a, T>(
    end: &'a mut End<T>,
    state: &AtomicU8,
    convert: fn(OwnedFd) -> io::Result<T>,
) -> Result<Option<&'a mut T>> {
    if let End::Raw(_) = end {
        let End::Raw(fd) = end.take() else {
            unreachable!("checked above")
        };
        match convert(fd) {
            Ok(active) => {
                *end = End::Active(active);
                state.store(ACTIVE, Ordering::Release);
            }
            Err(e) => {
                state.store(CLOSED, Ordering::Release);
                return Err(fd_error("registering pipe with the runtime", e));
            }
        }
    }
    match end {
        End::Active(active) => Ok(Some(active)),
        _ => Ok(None),
    }
}

/// Turn an active end back into a blocking raw descriptor.
fn deactivate<T>(
    end: &mut End<T>,
    state: &AtomicU8,
    convert: fn(T) -> io::Result<OwnedFd>,
) -> Result<()> {
    if let End::Active(_) = end {
        let End::Active(active) = end.take() else {
            unreachable!("checked above")
        };
        match convert(active) {
            Ok(fd) => {
                *end = End::Raw(fd);
                state.store(OPEN, Ordering::Release);
            }
            Err(e) => {
                state.store(CLOSED, Ordering::Release);
                return Err(Error::io("deregistering pipe from the runtime", e));
            }
        }
    }
    Ok(())
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| {
        Error::io(
            "decoding pipe output",
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })
}

impl fmt::Display for PipeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipe({} {} => {} {}, {} bytes waiting)",
            self.write_fd,
            state_name(self.write_state.load(Ordering::Acquire)),
            self.read_fd,
            state_name(self.read_state.load(Ordering::Acquire)),
            self.bytes_waiting()
        )
    }
}

impl fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeStream")
            .field("write_fd", &self.write_fd)
            .field("read_fd", &self.read_fd)
            .field("write_state", &state_name(self.write_state.load(Ordering::Acquire)))
            .field("read_state", &state_name(self.read_state.load(Ordering::Acquire)))
            .finish()
    }
}
