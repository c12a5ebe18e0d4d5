//! # Task Lifecycle
//!
//! A [`Task`] is one command bound to one image URL. It owns every resource
//! it creates — the raw image temp file and the extracted root directory —
//! and tracks the spawned child through a status projection over
//! `/proc/<pid>/stat`.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted ── retrieve ──► Retrieved ── extract ──► Extracted
//!                                                         │ start
//!                                                         ▼
//!                          Running / Sleeping / Stopped / Zombie
//!                                                         │ wait
//!                                                         ▼
//!                                                      Finished
//! ```
//!
//! The status never regresses: each material (image file, root directory,
//! child handle, exit code) is written exactly once.
//!
//! ## Sharing
//!
//! One writer (the foreground run pipeline) and many readers (the
//! supervisor's HTTP handlers) share the task. Mutable state sits behind a
//! `RwLock` whose write sections are narrow — only the publication of a
//! freshly produced material. `status()` and `signal()` take the read
//! lock, so queries never observe a torn state.
//!
//! Dropping a task releases its temp file and temp directory; both removals
//! are best-effort and idempotent.

use crate::container;
use crate::error::{Error, Result};
use crate::image;
use crate::rootfs;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{geteuid, Pid};
use std::collections::HashMap;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info};
use url::Url;

// =============================================================================
// Status
// =============================================================================

/// Observable lifecycle state of a task.
///
/// The live states (`Running`, `Stopped`, `Sleeping`, `Zombie`) come from
/// the first character of field 3 of `/proc/<pid>/stat`; the others from
/// which materials the task has produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing fetched yet.
    NotStarted,
    /// Image downloaded and validated.
    Retrieved,
    /// Root directory extracted.
    Extracted,
    /// Child scheduled or in an unrecognized proc state.
    Running,
    /// Child stopped by a signal (`T`).
    Stopped,
    /// Child in (un)interruptible sleep (`S` or `D`).
    Sleeping,
    /// Child exited but not yet reaped (`Z`).
    Zombie,
    /// Child reaped; exit code recorded.
    Finished,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NotStarted",
            Self::Retrieved => "Retrieved",
            Self::Extracted => "Extracted",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Sleeping => "Sleeping",
            Self::Zombie => "Zombie",
            Self::Finished => "Finished",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signals a supervisor may deliver to a task. The set is closed; anything
/// else is rejected with the enumerated choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Term,
    Int,
    Stop,
    Cont,
    Usr1,
    Usr2,
}

impl Signal {
    /// Accepted signal names, for error messages.
    pub const CHOICES: &'static str =
        "SIGKILL, SIGINT, SIGSTOP, SIGCONT, SIGTERM, SIGUSR1, SIGUSR2";

    /// Parses an exact signal name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SIGKILL" => Some(Self::Kill),
            "SIGTERM" => Some(Self::Term),
            "SIGINT" => Some(Self::Int),
            "SIGSTOP" => Some(Self::Stop),
            "SIGCONT" => Some(Self::Cont),
            "SIGUSR1" => Some(Self::Usr1),
            "SIGUSR2" => Some(Self::Usr2),
            _ => None,
        }
    }

    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as Nix;
        match self {
            Self::Kill => Nix::SIGKILL,
            Self::Term => Nix::SIGTERM,
            Self::Int => Nix::SIGINT,
            Self::Stop => Nix::SIGSTOP,
            Self::Cont => Nix::SIGCONT,
            Self::Usr1 => Nix::SIGUSR1,
            Self::Usr2 => Nix::SIGUSR2,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Kill => "SIGKILL",
            Self::Term => "SIGTERM",
            Self::Int => "SIGINT",
            Self::Stop => "SIGSTOP",
            Self::Cont => "SIGCONT",
            Self::Usr1 => "SIGUSR1",
            Self::Usr2 => "SIGUSR2",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Task
// =============================================================================

/// Materials a task produces, each written exactly once.
#[derive(Default)]
struct TaskState {
    /// Raw image, unlinked on drop.
    image: Option<NamedTempFile>,
    /// Whether the image needs gzip decompression.
    compressed: bool,
    /// Extracted root, removed recursively on drop.
    root: Option<TempDir>,
    /// Host-side PID of the spawned child.
    child_pid: Option<i32>,
    /// Exit code recorded by `wait()`.
    exit_code: Option<i32>,
}

/// One-shot handle used to reap the child, consumed by [`Task::wait`].
enum Reaper {
    /// Directly spawned child (unchrooted or root-chroot path).
    Spawned(tokio::process::Child),
    /// Child created with `clone(2)` for the namespaced path.
    Cloned(Pid),
}

/// A command plus the URL of the image it runs in.
pub struct Task {
    url: Url,
    program: String,
    args: Vec<String>,
    state: RwLock<TaskState>,
    reaper: Mutex<Option<Reaper>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("url", &self.url)
            .field("program", &self.program)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Creates a task from a raw URL and a command vector.
    ///
    /// Accepted schemes are `file`, `http`, and `https`; a bare path (empty
    /// scheme) is promoted to a `file` URL. Anything else fails with
    /// [`Error::InvalidScheme`].
    pub fn new(rawurl: &str, program: &str, args: &[String]) -> Result<Self> {
        let url = match Url::parse(rawurl) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let path = std::path::absolute(rawurl)?;
                Url::from_file_path(&path)
                    .map_err(|()| Error::InvalidScheme(String::new()))?
            }
            Err(e) => return Err(e.into()),
        };
        if !image::supported_scheme(url.scheme()) {
            return Err(Error::InvalidScheme(url.scheme().to_string()));
        }

        Ok(Self {
            url,
            program: program.to_string(),
            args: args.to_vec(),
            state: RwLock::new(TaskState::default()),
            reaper: Mutex::new(None),
        })
    }

    /// The parsed image URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Path of the downloaded image temp file, once retrieved.
    pub fn image_path(&self) -> Option<PathBuf> {
        self.read_state()
            .image
            .as_ref()
            .map(|f| f.path().to_path_buf())
    }

    /// Path of the extracted root directory, once extracted.
    pub fn rootfs_path(&self) -> Option<PathBuf> {
        self.read_state()
            .root
            .as_ref()
            .map(|d| d.path().to_path_buf())
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    /// Fetches the image URL into an owned temp file and records the
    /// compression flag. A second call replaces the previous download.
    pub async fn retrieve(&self) -> Result<()> {
        let (file, compressed) = image::retrieve(&self.url).await?;
        let mut state = self.write_state()?;
        state.image = Some(file);
        state.compressed = compressed;
        Ok(())
    }

    /// Expands the retrieved image into an owned temp directory.
    pub fn extract(&self) -> Result<()> {
        let (path, compressed) = {
            let state = self.read_state();
            let image = state
                .image
                .as_ref()
                .ok_or_else(|| Error::Internal("image not retrieved yet".to_string()))?;
            (image.path().to_path_buf(), state.compressed)
        };
        let root = rootfs::extract(&path, compressed)?;
        self.write_state()?.root = Some(root);
        Ok(())
    }

    /// Starts the command without any jail, with the extracted root as
    /// working directory unless `wd` overrides it. Test and diagnostic
    /// path only.
    pub async fn start(
        &self,
        wd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        self.start_inner(false, wd, env).await
    }

    /// Starts the command inside the jail.
    ///
    /// Running as root this is a plain `chroot(2)`; unprivileged it goes
    /// through the namespaced re-exec path (see [`crate::container`]).
    pub async fn start_jailed(
        &self,
        wd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        self.start_inner(true, wd, env).await?;
        if let Some(pid) = self.read_state().child_pid {
            info!("Container PID: {pid}");
        }
        Ok(())
    }

    async fn start_inner(
        &self,
        chrooted: bool,
        wd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        if self.read_state().image.is_none() {
            self.retrieve().await?;
        }
        if self.read_state().root.is_none() {
            self.extract()?;
        }
        let root = self
            .rootfs_path()
            .ok_or_else(|| Error::Internal("extracted root disappeared".to_string()))?;

        if chrooted && !geteuid().is_root() {
            let pid = container::spawn_jailed(&root, wd, &self.program, &self.args, env)?;
            self.publish_child(pid.as_raw(), Reaper::Cloned(pid))?;
            return Ok(());
        }

        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        if !env.is_empty() {
            command.env_clear().envs(env);
        }

        if chrooted {
            let chroot_dir = root.clone();
            let jail_wd = wd.map(Path::to_path_buf);
            // SAFETY: chroot and chdir are async-signal-safe.
            unsafe {
                command.pre_exec(move || {
                    nix::unistd::chroot(&chroot_dir)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    let target = jail_wd.as_deref().unwrap_or(Path::new("/"));
                    nix::unistd::chdir(target)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    Ok(())
                });
            }
        } else {
            command.current_dir(wd.unwrap_or(&root));
        }

        let child = command.spawn().map_err(|e| Error::Spawn {
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| Error::Spawn {
            reason: "child exited before its pid could be read".to_string(),
        })? as i32;
        self.publish_child(pid, Reaper::Spawned(child))?;
        Ok(())
    }

    fn publish_child(&self, pid: i32, reaper: Reaper) -> Result<()> {
        self.write_state()?.child_pid = Some(pid);
        *self
            .reaper
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))? = Some(reaper);
        debug!(pid, "child published");
        Ok(())
    }

    /// Waits for the child to exit and records its exit code. Exits by
    /// signal are reported as `128 + signum`, the shell convention.
    ///
    /// Consumes the reap handle: a second call (or a call before `start`)
    /// fails with [`Error::NoProcess`].
    pub async fn wait(&self) -> Result<i32> {
        let reaper = self
            .reaper
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?
            .take();
        let Some(reaper) = reaper else {
            return Err(Error::NoProcess);
        };

        let code = match reaper {
            Reaper::Spawned(mut child) => {
                let status = child.wait().await?;
                status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
            }
            Reaper::Cloned(pid) => {
                let status = tokio::task::spawn_blocking(move || loop {
                    match waitpid(pid, None) {
                        Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                        Ok(WaitStatus::Signaled(_, signal, _)) => {
                            return Ok(128 + signal as i32)
                        }
                        Ok(_) => continue,
                        Err(e) => return Err(e),
                    }
                })
                .await
                .map_err(|e| Error::Internal(format!("waiter task: {e}")))?;
                status.map_err(|e| Error::Internal(format!("waitpid: {e}")))?
            }
        };

        self.write_state()?.exit_code = Some(code);
        debug!(code, "child reaped");
        Ok(code)
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Projects the current status from the produced materials and, when a
    /// child exists, its `/proc/<pid>/stat` state. Transient proc read
    /// failures report `Running` rather than flapping.
    pub fn status(&self) -> Status {
        let state = self.read_state();
        let Some(pid) = state.child_pid else {
            return if state.root.is_some() {
                Status::Extracted
            } else if state.image.is_some() {
                Status::Retrieved
            } else {
                Status::NotStarted
            };
        };
        if state.exit_code.is_some() {
            return Status::Finished;
        }
        match proc_pid_stat(pid) {
            Some('T') => Status::Stopped,
            Some('S') | Some('D') => Status::Sleeping,
            Some('Z') => Status::Zombie,
            _ => Status::Running,
        }
    }

    /// Delivers a signal to the child process.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let state = self.read_state();
        let Some(pid) = state.child_pid else {
            return Err(Error::NoProcess);
        };
        kill(Pid::from_raw(pid), signal.as_nix()).map_err(|e| Error::SignalDelivery {
            reason: e.to_string(),
        })
    }

    // =========================================================================
    // Locking
    // =========================================================================

    fn read_state(&self) -> RwLockReadGuard<'_, TaskState> {
        // A poisoned lock means a panicked writer; reads stay best-effort.
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, TaskState>> {
        self.state
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }
}

/// Reads the process state character from `/proc/<pid>/stat` (field 3,
/// `man 5 proc`). The comm field may contain spaces, so parsing starts
/// after the closing parenthesis.
fn proc_pid_stat(pid: i32) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.trim_start().chars().next()
}
