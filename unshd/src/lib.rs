//! unshd: a TCP daemon that runs one shell-style pipeline per client line
//! and streams the pipeline's output back over the connection.
//!
//! Everything runs on one thread around a single epoll instance; see
//! [`dispatcher`] for the loop and [`pipeline`] for how stages are wired.

pub mod client;
pub mod cmdline;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod proxy;
pub mod reaper;
pub mod registry;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, DaemonError, ParseError, SpawnError};
