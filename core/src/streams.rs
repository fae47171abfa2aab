//! Redirected standard streams of one child process
//!
//! A [`StreamBundle`] owns the parent-side ends of the child's stdin, stdout
//! and stderr pipes. Output pipes are never read by the caller directly:
//! each one is drained by a background task into an in-process buffer, so a
//! child that floods stdout cannot block while the caller is busy writing to
//! its stdin. Callers consume the buffered bytes through [`OutputReader`].
//!
//! ## Buffer limit
//!
//! Each output buffer holds at most `max_buffered` bytes. Once it is full the
//! drain task stops reading until a reader makes room, and the child blocks
//! on its full pipe the way it would without redirection.
//!
//! ## End of stream
//!
//! A buffer reports [`PipeStatus::EndOfStream`] only once the child side of
//! the pipe is closed *and* every buffered byte has been read.
//! [`PipeStatus::Empty`] means "nothing right now, more may come".

use crate::{CoreError, Result};
use parking_lot::Mutex;
use schema::StreamKind;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Read side of a child output pipe
pub type PipeReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Write side of the child's stdin pipe
pub type PipeWriter = Pin<Box<dyn AsyncWrite + Send + Unpin>>;

/// Default read size of the drain tasks
pub const DEFAULT_DRAIN_CHUNK_SIZE: usize = 8 * 1024;

/// Default cap on bytes buffered per output stream
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 4 * 1024 * 1024;

/// Non-blocking view of an output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    /// This many bytes can be read without waiting
    Ready(usize),
    /// Nothing buffered yet, the child side is still open
    Empty,
    /// Child side closed and every byte consumed
    EndOfStream,
}

#[derive(Debug, Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

/// Bounded byte queue between one drain task and its readers
///
/// `notify` wakes readers when bytes arrive and the drain task when a read
/// frees room; both sides re-check their condition after waking.
#[derive(Debug)]
struct PipeBuffer {
    state: Mutex<PipeState>,
    notify: Notify,
    capacity: usize,
}

impl PipeBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PipeState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn room(&self) -> usize {
        self.capacity.saturating_sub(self.state.lock().data.len())
    }

    /// Wait until at least one byte fits; returns how many do
    async fn wait_for_room(&self) -> usize {
        loop {
            let notified = self.notify.notified();
            let room = self.room();
            if room > 0 {
                return room;
            }
            notified.await;
        }
    }

    fn push(&self, bytes: &[u8]) {
        self.state.lock().data.extend(bytes.iter().copied());
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn status(&self) -> PipeStatus {
        let state = self.state.lock();
        if !state.data.is_empty() {
            PipeStatus::Ready(state.data.len())
        } else if state.closed {
            PipeStatus::EndOfStream
        } else {
            PipeStatus::Empty
        }
    }

    /// `None` when nothing is buffered and the pipe is still open
    fn take_into(&self, buf: &mut [u8]) -> Option<usize> {
        let mut state = self.state.lock();
        if state.data.is_empty() {
            return if state.closed { Some(0) } else { None };
        }
        let n = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        drop(state);
        // Wake a drain task parked on a full buffer
        self.notify.notify_waiters();
        Some(n)
    }
}

/// Caller-side reader over a drained output pipe
///
/// Clones share the same buffer; bytes are consumed by whichever clone reads
/// them first.
#[derive(Debug, Clone)]
pub struct OutputReader {
    kind: StreamKind,
    buffer: Arc<PipeBuffer>,
}

impl OutputReader {
    /// Which child stream this reader consumes
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Current buffer status without waiting
    pub fn status(&self) -> PipeStatus {
        self.buffer.status()
    }

    /// True iff at least one byte can be read right now
    pub fn is_available(&self) -> bool {
        matches!(self.status(), PipeStatus::Ready(_))
    }

    /// True once the child side closed and the buffer was drained
    pub fn is_eof(&self) -> bool {
        self.status() == PipeStatus::EndOfStream
    }

    /// Read buffered bytes without waiting
    ///
    /// Returns `None` when nothing is buffered yet, `Some(0)` at end of
    /// stream, otherwise the number of bytes copied into `buf`.
    pub fn try_read(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return Some(0);
        }
        self.buffer.take_into(buf)
    }

    /// Read at least one byte, waiting for the child if necessary
    ///
    /// Returns 0 only at end of stream (or for an empty `buf`).
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            // Register before checking so a push between check and await is not lost
            let notified = self.buffer.notify.notified();
            if let Some(n) = self.buffer.take_into(buf) {
                return n;
            }
            notified.await;
        }
    }

    /// Read everything until end of stream
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

struct OutputPipe {
    reader: OutputReader,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct OutputPipes {
    bound: bool,
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
}

/// Parent-side endpoints of one child's redirected standard streams
pub struct StreamBundle {
    chunk_size: usize,
    max_buffered: usize,
    outputs: Mutex<OutputPipes>,
    stdin: tokio::sync::Mutex<Option<PipeWriter>>,
    input_open: AtomicBool,
}

impl fmt::Debug for StreamBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outputs = self.outputs.lock();
        f.debug_struct("StreamBundle")
            .field("bound", &outputs.bound)
            .field("stdout", &outputs.stdout.is_some())
            .field("stderr", &outputs.stderr.is_some())
            .field("input_open", &self.is_input_open())
            .finish()
    }
}

impl Default for StreamBundle {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_CHUNK_SIZE)
    }
}

impl StreamBundle {
    /// Create an unbound bundle whose drain tasks read `chunk_size` bytes at a time
    pub fn new(chunk_size: usize) -> Self {
        Self::with_limits(chunk_size, DEFAULT_MAX_BUFFERED_BYTES)
    }

    /// Like [`StreamBundle::new`], buffering at most `max_buffered` bytes per output
    pub fn with_limits(chunk_size: usize, max_buffered: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_buffered: max_buffered.max(1),
            outputs: Mutex::new(OutputPipes::default()),
            stdin: tokio::sync::Mutex::new(None),
            input_open: AtomicBool::new(false),
        }
    }

    /// Attach the pipes of a freshly spawned child and start draining them
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`CoreError::AlreadyBound`] when pipes were already attached.
    pub fn set_pipes(
        &self,
        stdout: Option<PipeReader>,
        stdin: Option<PipeWriter>,
        stderr: Option<PipeReader>,
    ) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CoreError::InitializationError(format!("stream drains need a tokio runtime: {}", e))
        })?;

        let mut outputs = self.outputs.lock();
        if outputs.bound {
            return Err(CoreError::AlreadyBound(
                "pipes are already attached to this stream bundle".to_string(),
            ));
        }
        outputs.bound = true;
        outputs.stdout = stdout.map(|r| self.start_drain(&runtime, StreamKind::Stdout, r));
        outputs.stderr = stderr.map(|r| self.start_drain(&runtime, StreamKind::Stderr, r));
        drop(outputs);

        if let Some(writer) = stdin {
            // Nobody else can hold the lock before the bundle is bound
            if let Ok(mut slot) = self.stdin.try_lock() {
                *slot = Some(writer);
                self.input_open.store(true, Ordering::SeqCst);
            }
        }

        debug!("Attached pipes to stream bundle: {:?}", self);
        Ok(())
    }

    fn start_drain(
        &self,
        runtime: &tokio::runtime::Handle,
        kind: StreamKind,
        reader: PipeReader,
    ) -> OutputPipe {
        let buffer = Arc::new(PipeBuffer::new(self.max_buffered));
        let task = runtime.spawn(drain_pipe(kind, reader, buffer.clone(), self.chunk_size));
        OutputPipe {
            reader: OutputReader { kind, buffer },
            task: Some(task),
        }
    }

    /// Whether pipes were attached
    pub fn is_bound(&self) -> bool {
        self.outputs.lock().bound
    }

    /// Reader over the child's stdout, if it was redirected
    pub fn stdout(&self) -> Option<OutputReader> {
        self.outputs.lock().stdout.as_ref().map(|p| p.reader.clone())
    }

    /// Reader over the child's stderr, if it was redirected
    pub fn stderr(&self) -> Option<OutputReader> {
        self.outputs.lock().stderr.as_ref().map(|p| p.reader.clone())
    }

    /// Buffer status of the child's stdout
    pub fn output_status(&self) -> PipeStatus {
        self.stdout()
            .map(|r| r.status())
            .unwrap_or(PipeStatus::EndOfStream)
    }

    /// Buffer status of the child's stderr
    pub fn error_status(&self) -> PipeStatus {
        self.stderr()
            .map(|r| r.status())
            .unwrap_or(PipeStatus::EndOfStream)
    }

    /// True iff stdout has at least one byte ready
    pub fn is_output_available(&self) -> bool {
        matches!(self.output_status(), PipeStatus::Ready(_))
    }

    /// True iff stderr has at least one byte ready
    pub fn is_error_available(&self) -> bool {
        matches!(self.error_status(), PipeStatus::Ready(_))
    }

    /// True while the child's stdin has not been closed
    pub fn is_input_open(&self) -> bool {
        self.input_open.load(Ordering::SeqCst)
    }

    /// Write `data` to the child's stdin and flush it
    pub async fn write_input(&self, data: &[u8]) -> Result<()> {
        if !self.is_input_open() {
            return Err(CoreError::InvalidState("child stdin is closed".to_string()));
        }
        let mut slot = self.stdin.lock().await;
        let result = match slot.as_mut() {
            Some(writer) => {
                let written = writer.write_all(data).await;
                match written {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                }
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "child stdin is closed")),
        };
        // close_output may have run while we were writing
        if !self.is_input_open() {
            slot.take();
        }
        result.map_err(CoreError::from)
    }

    /// Close the child's stdin so it observes end of input; idempotent
    pub fn close_output(&self) {
        let was_open = self.input_open.swap(false, Ordering::SeqCst);
        // A concurrent writer drops the pipe itself once it sees the flag
        if let Ok(mut slot) = self.stdin.try_lock() {
            slot.take();
        }
        if was_open {
            debug!("Closed child stdin");
        }
    }

    /// Release pipe resources after the child was reaped
    ///
    /// Stdin is closed immediately. Drain tasks get `grace` to read what the
    /// child left in the pipes before they are aborted; bytes already
    /// buffered stay readable.
    pub(crate) fn release(&self, grace: Duration) {
        self.close_output();

        let mut guard = self.outputs.lock();
        let outputs = &mut *guard;
        for pipe in [outputs.stdout.as_mut(), outputs.stderr.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Some(task) = pipe.task.take() {
                finish_drain(pipe.reader.clone(), task, grace);
            }
        }
    }
}

impl Drop for StreamBundle {
    fn drop(&mut self) {
        let outputs = self.outputs.get_mut();
        for pipe in [outputs.stdout.as_mut(), outputs.stderr.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Some(task) = pipe.task.take() {
                task.abort();
                pipe.reader.buffer.close();
            }
        }
    }
}

async fn drain_pipe(kind: StreamKind, mut reader: PipeReader, buffer: Arc<PipeBuffer>, chunk_size: usize) {
    let mut chunk = vec![0u8; chunk_size];
    loop {
        if buffer.room() == 0 {
            debug!("Child {} buffer full, waiting for a reader", kind);
        }
        let want = buffer.wait_for_room().await.min(chunk.len());
        match reader.read(&mut chunk[..want]).await {
            Ok(0) => break,
            Ok(n) => {
                trace!("Drained {} bytes from child {}", n, kind);
                buffer.push(&chunk[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading child {}: {}", kind, e);
                break;
            }
        }
    }
    buffer.close();
    debug!("Child {} reached end of stream", kind);
}

fn finish_drain(reader: OutputReader, mut task: JoinHandle<()>, grace: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    // Something else (e.g. a grandchild) still holds the pipe open
                    debug!("Child {} still open after {:?}, abandoning drain", reader.kind, grace);
                    task.abort();
                    reader.buffer.close();
                }
            });
        }
        Err(_) => {
            task.abort();
            reader.buffer.close();
        }
    }
}
