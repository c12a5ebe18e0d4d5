//! Constants for the jail runner.
//!
//! All fixed names, magic numbers, and limits live here so the wire
//! surface and the re-exec protocol stay consistent across modules.

// =============================================================================
// Task Resources
// =============================================================================

/// Prefix for the temp file holding the raw image and the temp directory
/// holding the extracted root.
pub const TASK_FILE_PREFIX: &str = "task";

/// argv[0] sentinel that diverts startup into the second-stage container
/// entry point. Checked before any flag or subcommand parsing.
pub const TASK_FORK_NAME: &str = "tfork";

/// Directory created inside the new root to receive the old root during
/// `pivot_root`, lazily detached and removed afterwards.
pub const PIVOT_ROOT_DIR: &str = ".pivot_root";

// =============================================================================
// Supervisor
// =============================================================================

/// Default supervisor listening port. Distinct ports allow several tasks
/// to run at the same time.
pub const DEFAULT_LISTENING_PORT: u16 = 6969;

// =============================================================================
// Image Format Detection
// =============================================================================

/// Leading bytes of a gzip stream (deflate method).
pub const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

// =============================================================================
// Namespaced Spawn
// =============================================================================

/// Stack size handed to `clone(2)` for the re-exec stage. The child only
/// blocks on the sync pipe, chdirs, and execs, so 1 MiB is generous.
pub const CHILD_STACK_SIZE: usize = 1024 * 1024;
