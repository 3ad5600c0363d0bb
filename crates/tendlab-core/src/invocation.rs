//! Nested testcase invocation and the execution log
//!
//! A [`Ctx`] is handed to every testcase. Calling [`Ctx::testcase`] opens a
//! child frame one level deeper, runs the body with the child context and
//! records how it ended, on every exit path. Failures are wrapped once, by
//! the innermost frame, with a snapshot of the frame chain.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use tendlab_exec::{CommandLog, CommandResult, ExecError};

use crate::error::{Error, TestcaseFailure};

/// One testcase frame in the invocation chain
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FrameInfo {
    /// Log-unique frame id
    pub id: u64,
    /// Testcase name
    pub name: String,
    /// Nesting depth, 0 for a top-level testcase
    pub depth: usize,
    /// Arguments as given by the caller
    pub args: Vec<(String, String)>,
    /// When the frame was entered
    pub started: DateTime<Utc>,
}

/// How a testcase frame ended
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Ok,
    /// A command exited with a non-zero status
    NonZeroExit,
    /// Any other error
    Failed,
    /// Dropped before finishing, e.g. by a panic or cancellation
    Abandoned,
}

/// A record in the execution log
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    TestcaseBegin {
        id: u64,
        name: String,
        depth: usize,
        args: BTreeMap<String, String>,
        time: DateTime<Utc>,
    },
    TestcaseEnd {
        id: u64,
        name: String,
        depth: usize,
        /// Seconds
        duration: f64,
        status: FrameStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        time: DateTime<Utc>,
    },
    Command {
        machine: String,
        command: String,
        status: i32,
        /// Seconds
        duration: f64,
        time: DateTime<Utc>,
    },
    Message {
        depth: usize,
        text: String,
        time: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct SinkState {
    records: Vec<LogRecord>,
    next_id: u64,
    open_frames: usize,
}

/// Shared, thread-safe execution log
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    inner: Arc<Mutex<SinkState>>,
}

impl LogSink {
    /// Creates an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of all records so far
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.state().records.clone()
    }

    /// Number of frames entered but not yet ended
    #[must_use]
    pub fn open_frames(&self) -> usize {
        self.state().open_frames
    }

    /// Serialize the log as a JSON array
    ///
    /// # Errors
    /// Serialization failure
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.state().records)
    }

    /// Write the log as a JSON array to `path`
    ///
    /// # Errors
    /// Serialization or I/O failure
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    fn begin(&self, name: &str, depth: usize, args: &[(&str, String)]) -> FrameInfo {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.open_frames += 1;

        let frame = FrameInfo {
            id,
            name: name.to_string(),
            depth,
            args: args
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            started: Utc::now(),
        };

        state.records.push(LogRecord::TestcaseBegin {
            id,
            name: frame.name.clone(),
            depth,
            args: frame.args.iter().cloned().collect(),
            time: frame.started,
        });
        frame
    }

    fn end(&self, frame: &FrameInfo, duration: Duration, status: FrameStatus, error: Option<String>) {
        let mut state = self.state();
        state.open_frames = state.open_frames.saturating_sub(1);
        state.records.push(LogRecord::TestcaseEnd {
            id: frame.id,
            name: frame.name.clone(),
            depth: frame.depth,
            duration: duration.as_secs_f64(),
            status,
            error,
            time: Utc::now(),
        });
    }

    fn message(&self, depth: usize, text: &str) {
        self.state().records.push(LogRecord::Message {
            depth,
            text: text.to_string(),
            time: Utc::now(),
        });
    }
}

impl CommandLog for LogSink {
    fn command(&self, machine: &str, command: &str, result: &CommandResult) {
        self.state().records.push(LogRecord::Command {
            machine: machine.to_string(),
            command: command.to_string(),
            status: result.status,
            duration: result.duration.as_secs_f64(),
            time: Utc::now(),
        });
    }
}

fn indent(depth: usize) -> String {
    "│   ".repeat(depth)
}

/// Invocation context passed explicitly to every testcase
#[derive(Debug, Clone)]
pub struct Ctx {
    sink: LogSink,
    chain: Vec<FrameInfo>,
}

impl Ctx {
    /// Top-level context writing to `sink`
    #[must_use]
    pub fn root(sink: LogSink) -> Self {
        Self {
            sink,
            chain: Vec::new(),
        }
    }

    /// Number of enclosing testcase frames
    #[must_use]
    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    /// Enclosing frames, outermost first
    #[must_use]
    pub fn chain(&self) -> &[FrameInfo] {
        &self.chain
    }

    /// The execution log
    #[must_use]
    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// The execution log as a machine command log
    #[must_use]
    pub fn command_log(&self) -> Arc<dyn CommandLog> {
        Arc::new(self.sink.clone())
    }

    /// Log a free-form message at the current depth
    pub fn message(&self, text: &str) {
        info!(target: "tendlab::testcase", "{}├─ {text}", indent(self.depth()));
        self.sink.message(self.depth(), text);
    }

    /// Open a child frame
    ///
    /// The frame is recorded as ended when [`Frame::finish`] is called, or
    /// as abandoned when it is dropped unfinished.
    #[must_use]
    pub fn enter(&self, name: &str, args: &[(&str, String)]) -> Frame {
        let depth = self.depth();
        let frame = self.sink.begin(name, depth, args);
        info!(target: "tendlab::testcase", depth, "{}├─ calling {name}", indent(depth));

        let mut chain = self.chain.clone();
        chain.push(frame);

        Frame {
            ctx: Ctx {
                sink: self.sink.clone(),
                chain,
            },
            started: Instant::now(),
            finished: false,
        }
    }

    /// Run `body` as the testcase `name`
    ///
    /// # Errors
    /// Whatever `body` returns, wrapped with the frame chain unless an inner
    /// testcase already did so.
    pub async fn testcase<T>(
        &self,
        name: &str,
        args: &[(&str, String)],
        body: impl AsyncFnOnce(&Ctx) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let frame = self.enter(name, args);
        let result = body(frame.ctx()).await;
        frame.finish(result)
    }
}

/// An open testcase frame
#[derive(Debug)]
pub struct Frame {
    ctx: Ctx,
    started: Instant,
    finished: bool,
}

impl Frame {
    /// Context for code running inside this frame
    #[must_use]
    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    fn info(&self) -> Option<&FrameInfo> {
        self.ctx.chain.last()
    }

    /// Record the outcome and close the frame
    ///
    /// # Errors
    /// The error in `result`, wrapped with this frame's chain if it is not
    /// already a testcase failure.
    pub fn finish<T>(mut self, result: Result<T, Error>) -> Result<T, Error> {
        self.finished = true;
        let duration = self.started.elapsed();
        let Some(info) = self.info().cloned() else {
            return result;
        };
        let pad = indent(info.depth);

        match result {
            Ok(value) => {
                info!(
                    target: "tendlab::testcase",
                    depth = info.depth,
                    "{pad}│   └─ done ({:.3}s)",
                    duration.as_secs_f64()
                );
                self.ctx.sink.end(&info, duration, FrameStatus::Ok, None);
                Ok(value)
            }
            Err(err) => {
                error!(
                    target: "tendlab::testcase",
                    depth = info.depth,
                    "{pad}│   └─ {} failed ({:.3}s): {}",
                    info.name,
                    duration.as_secs_f64(),
                    err.root()
                );
                let status = match err.as_exec() {
                    Some(ExecError::CommandFailed { .. }) => FrameStatus::NonZeroExit,
                    _ => FrameStatus::Failed,
                };
                self.ctx
                    .sink
                    .end(&info, duration, status, Some(err.root().to_string()));

                match err {
                    Error::Testcase(_) => Err(err),
                    source => Err(Error::Testcase(Box::new(TestcaseFailure {
                        name: info.name,
                        trace: self.ctx.chain.clone(),
                        source,
                    }))),
                }
            }
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(info) = self.info().cloned() {
            let duration = self.started.elapsed();
            error!(target: "tendlab::testcase", name = %info.name, "testcase abandoned");
            self.ctx
                .sink
                .end(&info, duration, FrameStatus::Abandoned, None);
        }
    }
}
