//! Error handling for minisysd.
use std::io;
use thiserror::Error;

/// Errors produced while parsing unit files and duration strings.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A duration string that does not match the grammar.
    #[error("invalid duration \"{0}\"")]
    InvalidDuration(String),

    /// A duration component with a unit the grammar does not know.
    #[error("unknown unit \"{unit}\" in duration \"{input}\"")]
    UnknownDurationUnit {
        /// The offending unit token.
        unit: String,
        /// The full duration string as written.
        input: String,
    },

    /// A duration whose value does not fit the internal representation.
    #[error("duration \"{0}\" overflows")]
    DurationOverflow(String),

    /// A `Type=` value outside the supported service types.
    #[error("unknown service type \"{0}\"")]
    UnknownServiceType(String),

    /// A `Restart=` value outside the supported restart policies.
    #[error("unknown restart policy \"{0}\"")]
    UnknownRestartPolicy(String),

    /// Error reading the unit file stream.
    #[error("failed to read unit file: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by unit lifecycle operations and graph lookups.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The requested unit is not loaded and a reload did not surface it.
    #[error("unit not found")]
    NotFound,

    /// The unit is masked; every lifecycle operation except unmask refuses.
    #[error("service is masked")]
    Masked,

    /// The unit record exists but its definition was removed.
    #[error("service definition was removed")]
    Removed,

    /// The unit has no source file on disk.
    #[error("service path not found")]
    NoSourcePath,

    /// A required, requisite, bound or conflicting neighbour failed.
    #[error("{dependency}: {reason}")]
    Dependency {
        /// The dependency as written in the unit file.
        dependency: String,
        /// What went wrong with it.
        reason: String,
    },

    /// Spawning an `Exec*` line failed.
    #[error("failed to launch \"{line}\": {source}")]
    Launch {
        /// The command line that could not be spawned.
        line: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A fail-significant `Exec*` line exited non-zero.
    #[error("\"{line}\" exited with status {code}")]
    Exec {
        /// The command line that failed.
        line: String,
        /// Its exit status.
        code: i32,
    },

    /// A mandatory `EnvironmentFile` could not be read.
    #[error("env file {path} not found: {source}")]
    EnvFile {
        /// The environment file path as written.
        path: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// `User=` or `Group=` did not resolve to a known account.
    #[error("failed to find {kind} {name}")]
    Credential {
        /// "user" or "group".
        kind: &'static str,
        /// The account name as written.
        name: String,
    },

    /// SIGTERM did not terminate every process within the stop timeout.
    #[error("failed to exit using SIGTERM, applied SIGKILL")]
    TimeoutFallback,

    /// Masking refused because a unit file is already present.
    #[error("masking failed: {path} exists")]
    MaskExists {
        /// The path that is in the way.
        path: String,
    },

    /// Instance creation on a unit without `@` in its source paths.
    #[error("not an instance")]
    NotInstance,

    /// The per-unit log file could not be opened.
    #[error("could not open log file: {0}")]
    LogFile(#[source] io::Error),

    /// `ExecReload` ran but failed; its output is preserved.
    #[error("failed reload: {output}")]
    Reload {
        /// Exit status and captured command output.
        output: String,
    },

    /// Error parsing a unit file during reload.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Filesystem error from enable/disable/mask and friends.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised by the control-socket wire layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the stream before a complete frame arrived.
    #[error("control frame truncated")]
    Truncated,

    /// A frame that can never become valid.
    #[error("control frame malformed: {0}")]
    Malformed(&'static str),

    /// An argument that is not valid UTF-8.
    #[error("argument is not valid UTF-8")]
    BadEncoding,

    /// The response trailer did not carry the expected magic bytes.
    #[error("response trailer missing magic")]
    BadTrailer,

    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
}
