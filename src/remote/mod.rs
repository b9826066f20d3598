//! Remote execution on worker hosts.
//!
//! - [`RemoteCommand`]: a program and its arguments, quoted per argument
//! - [`Invocation`]: a command bound to a host and an [`ExecMode`]
//! - [`RemoteExecutor`]: the seam everything above talks to
//! - [`SshExecutor`]: the `ssh`/`scp` implementation
//!
//! # Failure reporting
//!
//! Every step returns a [`RemoteError`](crate::error::RemoteError) that tells
//! an unreachable host apart from a permission problem, a full disk, a timeout
//! or an ordinary non-zero exit.

pub mod command;
pub mod executor;

pub use command::{
    process_pattern, shell_quote, BackgroundHandle, ExecMode, Execution, Invocation,
    RemoteCommand, RemoteOutput,
};
pub use executor::{RemoteExecutor, SshExecutor};
