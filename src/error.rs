use caps::errors::CapsError;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Every way a launch can fail. There is no recovery path: each variant ends the launch.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The request violates the caller contract.
    #[error("invalid launch request: {0}")]
    InvalidRequest(String),

    /// fork, pipe or another kernel resource could not be allocated.
    #[error("{op} failed: {source}")]
    Resource { op: &'static str, source: Errno },

    /// A uid/gid/rlimit change was refused.
    #[error("{op} failed: {source}")]
    Privilege { op: &'static str, source: Errno },

    /// Creating or joining a namespace failed.
    #[error("{op} failed: {source}")]
    Namespace { op: &'static str, source: Errno },

    /// A mount, bind, pivot or directory operation failed.
    #[error("{op} {} failed: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        source: Errno,
    },

    /// A user or group name did not resolve.
    #[error("failed to look up {kind} {name:?}")]
    Lookup { kind: IdentityKind, name: String },

    #[error("{op} failed: {source}")]
    Capability { op: &'static str, source: CapsError },

    /// The effective set read back after applying capabilities is not the requested one.
    #[error("effective capabilities differ from the requested set: {0}")]
    CapabilityMismatch(String),

    /// The uid/gid map helper did not complete.
    #[error("uid/gid map helper {0}")]
    Helper(String),

    /// The container reported a failure before becoming ready.
    #[error("container failed before becoming ready: {0}")]
    ChildReported(ChildFailure),

    #[error("failed to exec {command}: {source}")]
    Exec { command: String, source: Errno },

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        source: std::io::Error,
    },
}

impl LaunchError {
    pub(crate) fn resource(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Resource { op, source }
    }

    pub(crate) fn privilege(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Privilege { op, source }
    }

    pub(crate) fn namespace(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Namespace { op, source }
    }

    pub(crate) fn filesystem(
        op: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(Errno) -> Self {
        let path = path.into();
        move |source| Self::Filesystem { op, path, source }
    }

    pub(crate) fn capability(op: &'static str) -> impl FnOnce(CapsError) -> Self {
        move |source| Self::Capability { op, source }
    }

    pub(crate) fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { op, source }
    }

    /// The originating system error, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Resource { source, .. }
            | Self::Privilege { source, .. }
            | Self::Namespace { source, .. }
            | Self::Filesystem { source, .. }
            | Self::Exec { source, .. } => Some(*source),
            Self::Io { source, .. } => source.raw_os_error().map(Errno::from_raw),
            Self::ChildReported(failure) => failure.errno.map(Errno::from_raw),
            _ => None,
        }
    }

    /// Short name of the error class, carried across the readiness channel.
    pub fn class(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "request",
            Self::Resource { .. } => "resource",
            Self::Privilege { .. } => "privilege",
            Self::Namespace { .. } => "namespace",
            Self::Filesystem { .. } => "filesystem",
            Self::Lookup { .. } => "lookup",
            Self::Capability { .. } | Self::CapabilityMismatch(_) => "capability",
            Self::Helper(_) => "helper",
            Self::ChildReported(_) => "child",
            Self::Exec { .. } => "exec",
            Self::Io { .. } => "io",
        }
    }
}

/// The errno behind an I/O error, `EIO` when it did not come from the kernel.
pub(crate) fn errno_of(error: &std::io::Error) -> Errno {
    Errno::from_raw(error.raw_os_error().unwrap_or(nix::libc::EIO))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    User,
    Group,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Group => f.write_str("group"),
        }
    }
}

/// Failure payload written by the container process before it becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildFailure {
    pub class: String,
    pub errno: Option<i32>,
    pub message: String,
}

impl From<&LaunchError> for ChildFailure {
    fn from(error: &LaunchError) -> Self {
        Self {
            class: error.class().to_string(),
            errno: error.errno().map(|errno| errno as i32),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}
