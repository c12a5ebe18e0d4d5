//! # Unprivileged Namespaced Launch
//!
//! Two-phase launch of a command inside a mount/PID/user namespace without
//! elevated privileges.
//!
//! ## Phase 1 — parent side ([`spawn_jailed`])
//!
//! `clone(2)` with `CLONE_NEWUSER | CLONE_NEWPID | CLONE_NEWNS`. The child
//! wakes up as PID 1 of the new PID namespace but blocks on a pipe until
//! the parent has written the 1:1 uid/gid mappings (`setgroups` must be
//! denied before `gid_map`, a kernel requirement). Once released, the
//! child chdirs into the extracted root and execs `/proc/self/exe` with
//! argv `[tfork, "-wd", <wd>?, <program>, <args>...]`.
//!
//! Everything the child touches after `clone` (CStrings, pointer arrays,
//! raw fds) is prepared up front: the parent is a multithreaded process,
//! so the child must not allocate.
//!
//! ## Phase 2 — child side ([`run`])
//!
//! Entered from `main` when `argv[0]` equals the sentinel, before any flag
//! parsing. The current working directory is the already-extracted root.
//! The mount view is rebuilt with `pivot_root`:
//!
//! 1. remount `/` recursively private (shared propagation would leak the
//!    pivot to the host);
//! 2. bind-mount the root onto itself so source and target are separate
//!    mount entries on one filesystem;
//! 3. `pivot_root(root, root/.pivot_root)`;
//! 4. `chdir /`;
//! 5. lazily detach `/.pivot_root` and remove it.
//!
//! Then the optional working directory is entered and the user command is
//! exec'd with the inherited environment (already merged by phase 1).

use crate::constants::{CHILD_STACK_SIZE, PIVOT_ROOT_DIR, TASK_FORK_NAME};
use crate::error::{Error, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, execvp, getegid, geteuid, pipe, Pid};
use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{self, Permissions};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

/// Spawns the re-exec stage inside fresh user/PID/mount namespaces.
///
/// Returns the host-side PID of the child. Stdio is inherited. The
/// environment handed to the child is the override map when non-empty,
/// otherwise the parent's environment.
pub fn spawn_jailed(
    root: &Path,
    wd: Option<&Path>,
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<Pid> {
    let exe = CString::new("/proc/self/exe")?;
    let root_c = CString::new(root.as_os_str().as_bytes())?;

    let mut argv: Vec<CString> = Vec::with_capacity(args.len() + 4);
    argv.push(CString::new(TASK_FORK_NAME)?);
    if let Some(wd) = wd {
        argv.push(CString::new("-wd")?);
        argv.push(CString::new(wd.as_os_str().as_bytes())?);
    }
    argv.push(CString::new(program)?);
    for arg in args {
        argv.push(CString::new(arg.as_str())?);
    }

    let envp: Vec<CString> = if env.is_empty() {
        std::env::vars()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<std::result::Result<_, _>>()?
    } else {
        env.iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<std::result::Result<_, _>>()?
    };

    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp_ptrs: Vec<*const libc::c_char> = envp
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    // Rendezvous pipe: the child blocks until the parent has written the
    // id mappings and closed the write end.
    let (sync_read, sync_write) = pipe().map_err(|e| Error::Spawn {
        reason: format!("pipe: {e}"),
    })?;
    let read_fd = sync_read.as_raw_fd();
    let write_fd = sync_write.as_raw_fd();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS;

    let child = Box::new(|| {
        child_entry(
            read_fd,
            write_fd,
            &root_c,
            exe.as_ptr(),
            &argv_ptrs,
            &envp_ptrs,
        )
    });

    // SAFETY: the child callback only calls async-signal-safe functions
    // (close, read, chdir, execve) on pre-built data.
    let pid = unsafe { clone(child, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(|e| {
        Error::Spawn {
            reason: format!("clone: {e}"),
        }
    })?;
    drop(sync_read);

    if let Err(e) = write_id_maps(pid.as_raw()) {
        // The child never leaves the pipe read; collect it before failing.
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        return Err(e);
    }
    drop(sync_write);

    debug!(pid = pid.as_raw(), "jailed child released");
    Ok(pid)
}

/// Child-side trampoline run on the fresh stack. Must not allocate.
fn child_entry(
    read_fd: i32,
    write_fd: i32,
    root: &CString,
    exe: *const libc::c_char,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> isize {
    unsafe {
        libc::close(write_fd);
        let mut byte = 0u8;
        loop {
            let n = libc::read(read_fd, std::ptr::addr_of_mut!(byte).cast(), 1);
            if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break;
        }
        libc::close(read_fd);

        if libc::chdir(root.as_ptr()) != 0 {
            return 127;
        }
        libc::execve(exe, argv.as_ptr(), envp.as_ptr());
    }
    127
}

/// Maps uid/gid 0 inside the child's user namespace to the parent's
/// effective ids. `setgroups` must be denied before `gid_map` is written.
fn write_id_maps(pid: i32) -> Result<()> {
    let euid = geteuid().as_raw();
    let egid = getegid().as_raw();

    let write = |file: &str, content: String| -> Result<()> {
        fs::write(format!("/proc/{pid}/{file}"), content)
            .map_err(|source| Error::IdMapSetup { pid, source })
    };
    write("setgroups", "deny\n".to_string())?;
    write("uid_map", format!("0 {euid} 1\n"))?;
    write("gid_map", format!("0 {egid} 1\n"))
}

/// Second-stage entry point: pivot into the extracted root (the current
/// working directory) and exec the user command.
///
/// On success the exec replaces the process image and this function never
/// returns.
pub fn run(wd: Option<&Path>, command: &[String]) -> Result<Infallible> {
    let Some(program) = command.first() else {
        return Err(Error::Spawn {
            reason: "missing command after sentinel".to_string(),
        });
    };

    let root = std::env::current_dir()?;
    enter_root(&root)?;

    if let Some(wd) = wd {
        chdir(wd).map_err(|errno| Error::NamespaceSetup {
            step: "chdir working directory",
            errno,
        })?;
    }

    info!(program = %program, args = ?&command[1..], "launching");
    let filename = CString::new(program.as_str())?;
    let argv: Vec<CString> = command
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()?;

    match execvp(&filename, &argv) {
        Ok(infallible) => match infallible {},
        Err(errno) => Err(Error::Spawn {
            reason: format!("exec {program}: {errno}"),
        }),
    }
}

/// Swaps the mount-namespace root for `root` using `pivot_root`.
fn enter_root(root: &Path) -> Result<()> {
    // Shared propagation on / would make the kernel refuse the pivot.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|errno| Error::NamespaceSetup {
        step: "make rootfs mounts private",
        errno,
    })?;

    // new_root and put_old must not be on the same mount as the current
    // root, so the root becomes a mount point of itself first.
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|errno| Error::NamespaceSetup {
        step: "Mount rootfs to itself error",
        errno,
    })?;

    let pivot_dir = root.join(PIVOT_ROOT_DIR);
    fs::create_dir(&pivot_dir)?;
    fs::set_permissions(&pivot_dir, Permissions::from_mode(0o777))?;

    nix::unistd::pivot_root(root, &pivot_dir).map_err(|errno| Error::NamespaceSetup {
        step: "pivot_root",
        errno,
    })?;

    chdir("/").map_err(|errno| Error::NamespaceSetup {
        step: "chdir /",
        errno,
    })?;

    // The old root is now visible at /.pivot_root; detach and remove it so
    // only the image's mounts remain.
    let old_root = Path::new("/").join(PIVOT_ROOT_DIR);
    umount2(&old_root, MntFlags::MNT_DETACH).map_err(|errno| Error::NamespaceSetup {
        step: "unmount pivot_root dir",
        errno,
    })?;
    fs::remove_dir(&old_root)?;

    Ok(())
}
