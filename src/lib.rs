//! # jailrun
//!
//! **Run a command inside a filesystem jail, without being root.**
//!
//! A task is one command bound to one image URL. The image — a plain or
//! gzip-compressed tar — is fetched, validated by magic bytes, and
//! extracted into an owned temp directory. That directory then becomes
//! the command's `/` through a two-phase self-reexec: the parent clones
//! into fresh user/PID/mount namespaces, maps the host user to uid 0
//! inside, and the re-exec'd stage performs `pivot_root` before exec'ing
//! the command. A local HTTP supervisor on `127.0.0.1` answers status
//! queries and delivers signals while the task runs.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          jailrun                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  image       retrieve URL → temp file, sniff tar/gzip magic  │
//! │  rootfs      expand tar → temp dir, anchor symlinks          │
//! │  container   clone(NEWUSER|NEWPID|NEWNS) → re-exec →         │
//! │              pivot_root → exec                               │
//! │  task        Task + Status projection over /proc/<pid>/stat  │
//! │  supervisor  GET /ps, POST /kill on 127.0.0.1:<port>         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jailrun::{Supervisor, Task};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use tokio::sync::oneshot;
//!
//! #[tokio::main]
//! async fn main() -> jailrun::Result<()> {
//!     let task = Arc::new(Task::new("https://example.com/alpine.tar.gz", "sh", &[])?);
//!
//!     let (tx, rx) = oneshot::channel();
//!     tokio::spawn(async move {
//!         Supervisor::new(rx, 6969).await?.listen_and_serve().await
//!     });
//!     let _ = tx.send(task.clone());
//!
//!     task.start_jailed(None, &HashMap::new()).await?;
//!     let code = task.wait().await?;
//!     std::process::exit(code);
//! }
//! ```
//!
//! Linux-only: user/PID/mount namespaces and `pivot_root` have no
//! portable equivalent.

pub mod constants;
pub mod container;
mod error;
pub mod image;
pub mod rootfs;
pub mod supervisor;
pub mod task;

pub use error::{Error, Result};
pub use supervisor::{build_router, Supervisor};
pub use task::{Signal, Status, Task};
