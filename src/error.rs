//! Error types for the jail runner.

/// Result type alias for jail runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while fetching, extracting, launching, or
/// supervising a jailed task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Image Errors
    // =========================================================================
    /// URL scheme outside the supported set (file, http, https).
    #[error("Invalid scheme {0}")]
    InvalidScheme(String),

    /// Remote server answered with a non-200 status.
    #[error("Impossible to get {url}: {status}")]
    FetchFailed { url: String, status: String },

    /// The fetched file is neither a tar nor a gzipped tar.
    #[error("Unknown archive")]
    UnknownArchive,

    // =========================================================================
    // Extraction Errors
    // =========================================================================
    /// An archive entry could not be placed in the extraction root.
    #[error("failed to extract {path}: {reason}")]
    ExtractFailure { path: String, reason: String },

    /// Archive entry type outside {directory, regular file, symlink}.
    #[error("Unknown type flag {flag} for path {path}")]
    UnknownTypeFlag { flag: char, path: String },

    // =========================================================================
    // Launch Errors
    // =========================================================================
    /// A step of the namespace/pivot_root protocol failed. The step string
    /// identifies which one.
    #[error("{step}: {errno}")]
    NamespaceSetup {
        step: &'static str,
        errno: nix::Error,
    },

    /// Writing the uid/gid mappings for the cloned child failed.
    #[error("failed to set up id mappings for pid {pid}: {source}")]
    IdMapSetup { pid: i32, source: std::io::Error },

    /// The child process could not be created or exec'd.
    #[error("failed to spawn jailed process: {reason}")]
    Spawn { reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Signal requested but the task has no child process.
    #[error("Impossible to send a signal to a non-running process")]
    NoProcess,

    /// `kill(2)` on the child PID failed.
    #[error("failed to deliver signal: {reason}")]
    SignalDelivery { reason: String },

    /// Signal name outside the accepted set.
    #[error("Invalid signal {name}. Choices: {choices}")]
    UnknownSignal {
        name: String,
        choices: &'static str,
    },

    // =========================================================================
    // Supervisor Errors
    // =========================================================================
    /// The supervisor endpoint could not be reached or its answer decoded.
    #[error("cannot reach task supervisor: {reason}")]
    SupervisorConnect { reason: String },

    /// The supervisor answered with a non-200 status.
    #[error("supervisor returned {status}: {body}")]
    SupervisorHttp { status: String, body: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Command string contained an interior NUL byte.
    #[error("embedded NUL in command string: {0}")]
    Nul(#[from] std::ffi::NulError),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}
