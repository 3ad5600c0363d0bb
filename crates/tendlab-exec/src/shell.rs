//! Sentinel-based command execution over a [`Channel`]
//!
//! Every command is followed by a `printf` that emits a unique marker and
//! the command's `$?`. Output is whatever arrives before the marker. The
//! marker is printed from two separately quoted halves, so an echoing
//! terminal can never produce it by repeating the command line.
//!
//! This assumes a POSIX shell on the other end (`$?`, `printf`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::channel::Channel;
use crate::error::ExecError;
use crate::result::CommandResult;

const MARKER_HEAD: &str = "__TLM";

static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// End-of-command token, unique within the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Marker {
    tail: String,
}

impl Marker {
    pub(crate) fn next() -> Self {
        let seq = MARKER_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            tail: format!("{}x{seq}__", std::process::id()),
        }
    }

    fn token(&self) -> String {
        format!("{MARKER_HEAD}{}", self.tail)
    }

    /// Shell command printing the bare marker on its own line
    pub(crate) fn banner_command(&self) -> String {
        format!("printf '%s%s\\n' '{MARKER_HEAD}' '{}'", self.tail)
    }

    /// What [`Marker::banner_command`] prints
    pub(crate) fn banner_pattern(&self) -> Vec<u8> {
        format!("{}\n", self.token()).into_bytes()
    }

    /// Shell command printing the marker followed by the last exit status
    fn status_command(&self) -> String {
        format!("printf '\\n%s%s %d\\n' '{MARKER_HEAD}' '{}' \"$?\"", self.tail)
    }

    fn status_pattern(&self) -> Vec<u8> {
        format!("\n{} ", self.token()).into_bytes()
    }
}

/// Which shell runs on the far end of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    /// POSIX `sh`
    #[default]
    Sh,
    /// `bash` without rc files
    Bash,
}

impl Shell {
    /// Command line that replaces the current process with this shell,
    /// stderr folded into stdout
    #[must_use]
    pub fn launch_line(&self) -> &'static str {
        match self {
            Shell::Sh => "exec sh 2>&1",
            Shell::Bash => "exec bash --norc --noprofile 2>&1",
        }
    }

    /// Run `command` and wait for its exit status
    ///
    /// # Errors
    /// Transport errors from the channel, or `Protocol` if the status after
    /// the marker is not an integer
    pub async fn exec(
        &self,
        channel: &mut Channel,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();
        let marker = Marker::next();
        let status_command = marker.status_command();

        let mut payload = String::with_capacity(command.len() + status_command.len() + 2);
        payload.push_str(command);
        payload.push('\n');
        payload.push_str(&status_command);
        payload.push('\n');
        channel.write_all(payload.as_bytes()).await?;

        let raw = channel.read_until(&marker.status_pattern(), timeout).await?;
        let status_field = channel.read_until(b"\n", timeout).await?;
        let status = parse_status(&status_field)?;

        let output = strip_echo(raw, &[command, &status_command]);
        let output = match String::from_utf8(output) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };

        trace!(channel = %channel.name(), status, bytes = output.len(), "command finished");

        Ok(CommandResult {
            status,
            output,
            duration: start.elapsed(),
        })
    }
}

fn parse_status(field: &[u8]) -> Result<i32, ExecError> {
    let text = String::from_utf8_lossy(field);
    text.trim_end_matches('\r')
        .trim()
        .parse()
        .map_err(|_| ExecError::Protocol(format!("malformed exit status {text:?}")))
}

/// Remove lines a terminal echoed back and the trailing `\r` a pty adds in
/// front of the sentinel's newline
fn strip_echo(mut raw: Vec<u8>, sent: &[&str]) -> Vec<u8> {
    let mut start = 0;
    for line in sent.iter().flat_map(|s| s.lines()) {
        let rest = &raw[start..];
        if !rest.starts_with(line.as_bytes()) {
            break;
        }
        let after = &rest[line.len()..];
        if after.starts_with(b"\r\n") {
            start += line.len() + 2;
        } else if after.starts_with(b"\n") {
            start += line.len() + 1;
        } else {
            break;
        }
    }

    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    raw.split_off(start.min(raw.len()))
}

/// Quote a word for a POSIX shell
#[must_use]
pub fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Join words into a command line, quoting each one
#[must_use]
pub fn command_line<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_are_unique() {
        let a = Marker::next();
        let b = Marker::next();
        assert_ne!(a, b);
        assert!(!a.status_command().contains(&a.token()));
        assert!(!a.banner_command().contains(&a.token()));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"0").unwrap(), 0);
        assert_eq!(parse_status(b"127\r").unwrap(), 127);
        assert!(matches!(parse_status(b"zero"), Err(ExecError::Protocol(_))));
    }

    #[test]
    fn test_strip_echo() {
        let raw = b"echo hi\r\nprintf x\r\nhi\r\n\r".to_vec();
        assert_eq!(strip_echo(raw, &["echo hi", "printf x"]), b"hi\r\n");

        let untouched = b"hello\n".to_vec();
        assert_eq!(strip_echo(untouched, &["echo hello"]), b"hello\n");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain/path-1.txt"), "plain/path-1.txt");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(command_line(&["kill", "42"]), "kill 42");
    }

    #[tokio::test]
    async fn test_exec_over_local_shell() {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(Shell::Sh.launch_line())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut channel = Channel::from_process("sh", child).await.unwrap();

        let result = Shell::Sh
            .exec(&mut channel, "echo hello", None)
            .await
            .unwrap();
        assert_eq!(result.status, 0);
        assert_eq!(result.output, "hello\n");

        let result = Shell::Sh
            .exec(&mut channel, "printf 'no newline'; exit_code=3; (exit $exit_code)", None)
            .await
            .unwrap();
        assert_eq!(result.status, 3);
        assert_eq!(result.output, "no newline");

        let result = Shell::Sh
            .exec(&mut channel, "echo oops >&2", None)
            .await
            .unwrap();
        assert_eq!(result.output, "oops\n");

        channel.close().await.unwrap();
    }
}
