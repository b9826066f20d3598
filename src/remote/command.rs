use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RemoteError;

/// A program plus arguments to run on a remote host.
///
/// Arguments are kept separate and quoted one by one when the command line is
/// rendered for the remote shell, so paths and host-provided values are never
/// spliced into a shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Command line as the remote shell will see it.
    pub fn render(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn mkdir_p(path: &str) -> Self {
        Self::new("mkdir").arg("-p").arg(path)
    }

    pub fn remove_file(path: &str) -> Self {
        Self::new("rm").arg("-f").arg(path)
    }

    /// Removes `path` and everything below it.
    pub fn remove_dir_all(path: &str) -> Self {
        Self::new("rm").arg("-rf").arg(path)
    }

    pub fn make_read_only(path: &str) -> Self {
        Self::new("chmod").arg("444").arg(path)
    }

    /// Lists `dir` one entry per line; the entry count is the line count.
    pub fn list_dir(dir: &str) -> Self {
        Self::new("ls").arg("-1").arg(dir)
    }

    /// Prints `<lines> <path>`.
    pub fn line_count(path: &str) -> Self {
        Self::new("wc").arg("-l").arg(path)
    }

    /// Exit 0 when a process matching `pattern` is running, 1 when none is.
    pub fn process_running(pattern: &str) -> Self {
        Self::new("pgrep").arg("-f").arg(pattern)
    }

    pub fn terminate(pattern: &str) -> Self {
        Self::new("pkill").arg("-f").arg(pattern)
    }

    /// `<script> <rid file> <bulk store dir> <destination dir>`
    pub fn fetch(script: &str, rid_file: &str, bulk_store: &str, dest: &str) -> Self {
        Self::new(script).arg(rid_file).arg(bulk_store).arg(dest)
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote `s` for a POSIX shell. Plain words pass through untouched.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// `pgrep`/`pkill` pattern matching one fetch: the script by file name
/// followed by the assignment file it was started with.
///
/// The first character is wrapped in a bracket expression so the pattern
/// never matches the command line of the shell running `pgrep` itself.
/// Including `rid_file` keeps other runs of the same script on the worker,
/// under another shard root or phase, out of the match.
pub fn process_pattern(script: &str, rid_file: &str) -> String {
    let name = script.rsplit('/').next().unwrap_or(script);
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };

    let mut pattern = format!("[{first}]");
    escape_regex_into(&mut pattern, chars.as_str());
    if !rid_file.is_empty() {
        pattern.push(' ');
        escape_regex_into(&mut pattern, rid_file);
    }
    pattern
}

fn escape_regex_into(out: &mut String, s: &str) {
    for c in s.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Wait for the command and capture its output.
    Sync,
    /// Start the command in the background and return at once.
    Async,
}

/// A command bound to a host and an execution mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub host: String,
    pub command: RemoteCommand,
    pub mode: ExecMode,
}

impl Invocation {
    pub fn sync(host: impl Into<String>, command: RemoteCommand) -> Self {
        Self {
            host: host.into(),
            command,
            mode: ExecMode::Sync,
        }
    }

    pub fn background(host: impl Into<String>, command: RemoteCommand) -> Self {
        Self {
            host: host.into(),
            command,
            mode: ExecMode::Async,
        }
    }
}

/// Captured result of a synchronous remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub host: String,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into a classified [`RemoteError`].
    pub fn check(self) -> Result<Self, RemoteError> {
        if self.success() {
            Ok(self)
        } else {
            Err(classify_failure(&self.host, self.code, &self.stderr))
        }
    }
}

/// Handle to a command started in [`ExecMode::Async`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundHandle {
    pub host: String,
    /// Local pid of the transport process, when there is one.
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Result of [`Invocation`] execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Completed(RemoteOutput),
    Detached(BackgroundHandle),
}

const UNREACHABLE_MARKERS: &[&str] = &[
    "Could not resolve hostname",
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Connection closed by",
    "lost connection",
    "Network is unreachable",
];

/// Map a failed exit into the error taxonomy.
///
/// ssh reports its own failures with status 255; scp folds them into 1, so
/// stderr is inspected as well.
pub fn classify_failure(host: &str, code: Option<i32>, stderr: &str) -> RemoteError {
    let reason = stderr.trim().to_string();

    if reason.contains("No space left on device") {
        return RemoteError::DiskFull {
            host: host.to_string(),
            reason,
        };
    }
    if reason.contains("Permission denied") {
        return RemoteError::PermissionDenied {
            host: host.to_string(),
            reason,
        };
    }
    if code == Some(255) || UNREACHABLE_MARKERS.iter().any(|m| reason.contains(m)) {
        return RemoteError::Unreachable {
            host: host.to_string(),
            reason,
        };
    }
    RemoteError::CommandFailed {
        host: host.to_string(),
        code,
        stderr: reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_quotes_only_when_needed() {
        let cmd = RemoteCommand::new("ls").arg("-1").arg("/data/my shard/img");
        assert_eq!(cmd.render(), "ls -1 '/data/my shard/img'");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote("/a/b-c_d.txt"), "/a/b-c_d.txt");
    }

    #[test]
    fn fetch_command_orders_arguments() {
        let cmd = RemoteCommand::fetch(
            "/opt/bin/download.sh",
            "/data/train/rid.txt",
            "imagenet12/train",
            "/data/train/img",
        );
        assert_eq!(cmd.program(), "/opt/bin/download.sh");
        assert_eq!(
            cmd.args(),
            &["/data/train/rid.txt", "imagenet12/train", "/data/train/img"]
        );
    }

    #[test]
    fn process_pattern_brackets_first_char() {
        assert_eq!(process_pattern("fetch", ""), "[f]etch");
        assert_eq!(process_pattern("", "/data/rid.txt"), "");
    }

    #[test]
    fn process_pattern_is_scoped_to_the_assignment_file() {
        assert_eq!(
            process_pattern("/opt/bin/download.sh", "/data/lapis/train/rid.txt"),
            r"[d]ownload\.sh /data/lapis/train/rid\.txt"
        );
        // Another phase on the same worker must not match.
        let train = process_pattern("download.sh", "/data/lapis/train/rid.txt");
        let validation = process_pattern("download.sh", "/data/lapis/validation/rid.txt");
        assert_ne!(train, validation);
        assert!(!validation.contains("train"));
    }

    #[test]
    fn remove_dir_all_is_recursive_and_forced() {
        let cmd = RemoteCommand::remove_dir_all("/data/lapis/train/img");
        assert_eq!(cmd.render(), "rm -rf /data/lapis/train/img");
    }

    #[test]
    fn classify_failure_distinguishes_causes() {
        assert!(matches!(
            classify_failure("w", Some(255), "ssh: connect to host w port 22: Connection refused"),
            RemoteError::Unreachable { .. }
        ));
        assert!(matches!(
            classify_failure("w", Some(1), "scp: /data/rid.txt: Permission denied"),
            RemoteError::PermissionDenied { .. }
        ));
        assert!(matches!(
            classify_failure("w", Some(1), "scp: write: No space left on device"),
            RemoteError::DiskFull { .. }
        ));
        assert!(matches!(
            classify_failure("w", Some(2), "ls: cannot access"),
            RemoteError::CommandFailed { code: Some(2), .. }
        ));
    }

    #[test]
    fn check_passes_success_through() {
        let out = RemoteOutput {
            host: "w".to_string(),
            code: Some(0),
            stdout: "ok".to_string(),
            stderr: String::new(),
        };
        assert_eq!(out.clone().check().unwrap(), out);
    }
}
