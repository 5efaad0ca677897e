//! Error types for the daemon library.
//!
//! `anyhow` is only used at the binary edge; everything below `main` returns
//! one of these enums so callers can tell a failed spawn (isolated, reported
//! to one client) from a failure that has to stop the loop.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use nix::errno::Errno;

/// Configuration could not be loaded or is unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("malformed config {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config: {field} must be greater than zero")]
    Zero { field: &'static str },
}

/// A command line the tokenizer refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty pipeline stage")]
    EmptyStage,

    #[error("missing file name after `{0}`")]
    MissingTarget(char),

    #[error("duplicate `{0}` redirection")]
    DuplicateRedirect(char),

    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
}

/// Setting up a pipeline failed. Everything opened by the attempt has been
/// closed by the time one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("argument contains a NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("cannot open input file {path}: {source}")]
    OpenInput { path: PathBuf, source: io::Error },

    #[error("cannot open output file {path}: {source}")]
    OpenOutput { path: PathBuf, source: io::Error },

    #[error("cannot create pipe: {0}")]
    Pipe(Errno),

    #[error("cannot fork: {0}")]
    Fork(Errno),

    #[error("cannot register pipeline output: {0}")]
    Register(Errno),
}

/// Failures that stop the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("cannot create epoll instance: {0}")]
    Epoll(Errno),

    #[error("cannot register {what}: {source}")]
    Register { what: &'static str, source: Errno },

    #[error("cannot set up signal handling: {0}")]
    Signals(Errno),

    #[error("error waiting for events: {0}")]
    Wait(Errno),

    #[error("signal descriptor failed: {0}")]
    SignalRead(Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}
