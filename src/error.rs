use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the supervisor core. Tracee-local variants are fatal only
/// to the tracee that triggered them; setup variants are fatal to the whole
/// supervisor and cause a fallback to an untraced `/init`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("could not access tracee memory for pid {pid}: {reason}")]
    TraceeMemory { pid: i32, reason: String },

    #[error("path argument exceeds PATH_MAX ({len} bytes)")]
    PathTooLong { len: usize },

    #[error("target registry is full")]
    RegistryFull,

    #[error("duplicate target registration for {path}")]
    DuplicateTarget { path: PathBuf },

    #[error("helper {program} exited with status {status}")]
    Helper { program: String, status: i32 },

    #[error("unparsable kernel cmdline value for {key}: {value}")]
    Cmdline { key: String, value: String },

    #[error("stage transition failed: {reason}")]
    StageTransition { reason: String },

    #[error("fcntl on tracked fd {fd} would change access mode, unsupported")]
    UnsupportedFcntl { fd: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
