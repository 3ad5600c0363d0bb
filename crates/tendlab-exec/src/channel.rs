//! Bidirectional byte stream to a running shell

use std::fmt;
use std::time::Duration;

use russh::{Disconnect, client};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, trace, warn};

use crate::error::ExecError;
use crate::keys::ResolvedKey;
use crate::ssh::ClientHandler;

/// How long a child gets to exit on its own after its stdin was closed
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Bytes kept from the stream for error messages
const EOF_TAIL: usize = 256;

const READ_CHUNK: usize = 16 * 1024;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// Resource that has to be torn down together with the stream
enum Guard {
    /// Nothing beyond the stream itself
    Detached,
    /// Local child process (`sh`, `ssh`)
    Process(Child),
    /// Library-mediated SSH session
    Session(client::Handle<ClientHandler>),
}

/// A bidirectional byte stream to a shell or process
///
/// All I/O takes `&mut self`, so a channel can only ever have one user at a
/// time. Bytes read past a matched pattern stay buffered for the next read.
pub struct Channel {
    name: String,
    io: Option<(Reader, Writer)>,
    buffer: Vec<u8>,
    guard: Guard,
    keys: Vec<ResolvedKey>,
    state: ChannelState,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Wrap an arbitrary reader/writer pair
    pub fn from_io(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            io: Some((Box::new(reader), Box::new(writer))),
            buffer: Vec::new(),
            guard: Guard::Detached,
            keys: Vec::new(),
            state: ChannelState::Open,
        }
    }

    /// Wire a spawned child's stdin/stdout as the channel
    ///
    /// # Errors
    /// Returns `ExecError::SpawnError` if the child was not spawned with
    /// piped stdin and stdout. The child is killed in that case.
    pub(crate) async fn from_process(
        name: impl Into<String>,
        mut child: Child,
    ) -> Result<Self, ExecError> {
        let name = name.into();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(ExecError::SpawnError(format!(
                "{name}: child has no piped stdio"
            )));
        };

        Ok(Self::from_process_parts(name, stdout, stdin, child))
    }

    /// Like [`Channel::from_process`], with the child's streams already
    /// taken and possibly rewired
    pub(crate) fn from_process_parts(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        child: Child,
    ) -> Self {
        let mut channel = Self::from_io(name, reader, writer);
        channel.guard = Guard::Process(child);
        channel
    }

    /// Wrap the stream of an SSH session channel, owning the session
    pub(crate) fn from_session(
        name: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        session: client::Handle<ClientHandler>,
    ) -> Self {
        let mut channel = Self::from_io(name, reader, writer);
        channel.guard = Guard::Session(session);
        channel
    }

    /// Channel name used in logs and errors
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the channel (nested sessions take over their parent's stream)
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the channel is still usable
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Keep a temporary key file alive for as long as the channel is open
    pub(crate) fn attach_key(&mut self, key: ResolvedKey) {
        self.keys.push(key);
    }

    fn closed_error(&self) -> ExecError {
        ExecError::ChannelClosed {
            channel: self.name.clone(),
        }
    }

    fn io_error(&self, e: &std::io::Error) -> ExecError {
        ExecError::IoError {
            channel: self.name.clone(),
            reason: e.to_string(),
        }
    }

    /// Write all bytes and flush
    ///
    /// # Errors
    /// `ChannelClosed` after `close()`, `IoError` if the transport fails
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let Some((_, writer)) = self.io.as_mut() else {
            return Err(self.closed_error());
        };

        let written = match writer.write_all(data).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| self.io_error(&e))?;

        trace!(channel = %self.name, bytes = data.len(), "wrote");
        Ok(())
    }

    /// Read until `pattern` appears in the stream
    ///
    /// Returns everything received before the pattern; the pattern itself is
    /// consumed, anything after it stays buffered.
    ///
    /// # Errors
    /// `Timeout` if `timeout` elapses first, `UnexpectedEof` if the stream
    /// ends before a match, `ChannelClosed` after `close()`
    pub async fn read_until(
        &mut self,
        pattern: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, ExecError> {
        if pattern.is_empty() {
            return Err(ExecError::Protocol("empty read pattern".to_string()));
        }

        let position = match timeout {
            Some(limit) => {
                let name = self.name.clone();
                tokio::time::timeout(limit, self.fill_until(pattern))
                    .await
                    .map_err(|_| ExecError::Timeout {
                        what: format!("{:?} on {name}", String::from_utf8_lossy(pattern)),
                        timeout: limit,
                    })??
            }
            None => self.fill_until(pattern).await?,
        };

        let rest = self.buffer.split_off(position + pattern.len());
        let mut data = std::mem::replace(&mut self.buffer, rest);
        data.truncate(position);
        Ok(data)
    }

    /// Read from the transport until the buffer contains `pattern`,
    /// returning its offset
    async fn fill_until(&mut self, pattern: &[u8]) -> Result<usize, ExecError> {
        let mut searched = 0;
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if let Some(offset) = find(&self.buffer[searched..], pattern) {
                return Ok(searched + offset);
            }
            searched = self.buffer.len().saturating_sub(pattern.len() - 1);

            let Some((reader, _)) = self.io.as_mut() else {
                return Err(self.closed_error());
            };
            let n = match reader.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => return Err(self.io_error(&e)),
            };

            if n == 0 {
                let tail_start = self.buffer.len().saturating_sub(EOF_TAIL);
                return Err(ExecError::UnexpectedEof {
                    channel: self.name.clone(),
                    received: self.buffer.len(),
                    tail: String::from_utf8_lossy(&self.buffer[tail_start..]).into_owned(),
                });
            }

            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Close the channel and release the transport
    ///
    /// Safe to call repeatedly; only the first call releases anything.
    ///
    /// # Errors
    /// Returns `IoError` if the SSH session could not be disconnected
    /// cleanly. The channel is closed regardless.
    pub async fn close(&mut self) -> Result<(), ExecError> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        self.state = ChannelState::Closed;
        self.buffer.clear();

        if let Some((reader, mut writer)) = self.io.take() {
            // EOF on stdin makes a shell exit by itself
            if let Err(e) = writer.shutdown().await {
                debug!(channel = %self.name, error = %e, "shutdown of write half failed");
            }
            drop(writer);
            drop(reader);
        }

        let result = match std::mem::replace(&mut self.guard, Guard::Detached) {
            Guard::Detached => Ok(()),
            Guard::Process(mut child) => {
                match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(channel = %self.name, %status, "child exited");
                    }
                    Ok(Err(e)) => {
                        warn!(channel = %self.name, error = %e, "waiting for child failed");
                    }
                    Err(_) => {
                        debug!(channel = %self.name, "child did not exit, killing");
                        if let Err(e) = child.kill().await {
                            warn!(channel = %self.name, error = %e, "failed to kill child");
                        }
                    }
                }
                Ok(())
            }
            Guard::Session(session) => session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| self.io_error(&std::io::Error::other(e.to_string()))),
        };

        self.keys.clear();
        debug!(channel = %self.name, "channel closed");
        result
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
