//! Second stage of a container launch: takes a fully described [`LaunchRequest`], isolates the
//! calling process step by step and execs the container's program.

mod barrier;
mod capabilities;
mod checks;
mod error;
mod host;
mod identity;
mod idmap;
mod launcher;
pub mod logging;
mod namespace;
mod process;
mod readiness;
mod request;
mod rootfs;

pub use barrier::StopBarrier;
pub use capabilities::{CapSet, Capability, CapabilitySnapshot, CapabilityState, CapabilityText};
pub use checks::is_namespace_supported;
pub use error::{ChildFailure, IdentityKind, LaunchError, Result};
pub use host::{Host, LinuxHost, MapKind};
pub use identity::{CallerIdentity, PrivilegeLevel};
pub use idmap::IdMap;
pub use launcher::{ContainerStep, LaunchOutcome, LaunchState, Launcher, Step, launch};
pub use namespace::{NamespaceKind, NamespacePlan, NamespaceSetting};
pub use process::{ExitStatus, wait_for_exit};
pub use readiness::{ReadinessChannel, ReadinessReceiver, ReadinessSender};
pub use request::{FilesystemPlan, LaunchRequest, LaunchRequestBuilder, ResourceLimits, StdioFds};
pub use rootfs::{NewRoot, RootBuilder, mount_proc, privatize_mounts};
