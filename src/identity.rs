use crate::error::{LaunchError, Result};
use nix::{
    errno::Errno,
    unistd::{Gid, Uid, geteuid, getgid, getuid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Root,
    Setuid,
    Rootless,
}

/// Who invoked the launcher, captured before any identity change.
#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity {
    ruid: Uid,
    euid: Uid,
    gid: Gid,
    level: PrivilegeLevel,
}

impl CallerIdentity {
    pub fn capture() -> Result<Self> {
        let ruid = getuid();
        let euid = geteuid();
        let gid = getgid();

        let level = if ruid != euid {
            if !euid.is_root() {
                // A setuid launcher that does not elevate to root cannot do anything useful.
                return Err(LaunchError::privilege("setuid elevation")(Errno::EPERM));
            }
            PrivilegeLevel::Setuid
        } else if euid.is_root() {
            PrivilegeLevel::Root
        } else {
            PrivilegeLevel::Rootless
        };

        Ok(Self {
            ruid,
            euid,
            gid,
            level,
        })
    }

    #[inline]
    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    #[inline]
    pub fn euid(&self) -> Uid {
        self.euid
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    #[inline]
    pub fn root(&self) -> bool {
        self.euid.is_root()
    }

    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.level
    }
}
