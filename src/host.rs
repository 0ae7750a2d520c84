use crate::{
    capabilities::{CapabilityManager, CapabilityState},
    error::{IdentityKind, LaunchError, Result, errno_of},
    idmap::IdMap,
    request::StdioFds,
};
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, fcntl},
    libc,
    sched::{CloneFlags, setns},
    unistd::{Gid, Group, Pid, Uid, User, close, dup2_stderr, dup2_stdin, dup2_stdout, getpid},
};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Which `/proc/<pid>/*_map` file a map is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Uid,
    Gid,
}

impl MapKind {
    fn file_name(self) -> &'static str {
        match self {
            MapKind::Uid => "uid_map",
            MapKind::Gid => "gid_map",
        }
    }
}

/// Primitives the launcher relies on but does not own.
pub trait Host {
    /// Duplicate the caller's descriptors onto 0, 1 and 2.
    fn dup_std_fds(&self, stdio: StdioFds) -> Result<()>;

    /// Close every descriptor above 2.
    fn close_all_other_fds(&self) -> Result<()>;

    /// Write the calling process's PID into each cgroup tasks file.
    fn join_cgroups(&self, tasks_files: &[PathBuf]) -> Result<()>;

    /// Join the namespace behind `path`.
    fn join_namespace(&self, path: &Path) -> Result<()>;

    fn uid_for_user(&self, name: &str) -> Result<Uid>;

    fn gid_for_group(&self, name: &str) -> Result<Gid>;

    /// Remove every bounding capability that `target` does not permit.
    fn drop_bounding_capabilities(&self, target: &CapabilityState) -> Result<()>;

    /// Write an id map for `pid`. Must run outside of the target's new user namespace.
    fn write_map(&self, pid: Pid, kind: MapKind, map: &IdMap) -> Result<()>;
}

/// The host primitives backed by the running Linux kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl LinuxHost {
    /// Copy `raw` to a close-on-exec descriptor above 2.
    fn dup_above_stdio(raw: RawFd) -> Result<OwnedFd> {
        // SAFETY: the descriptor is only borrowed for the duration of the fcntl call.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        let copy = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(libc::STDERR_FILENO + 1))
            .map_err(LaunchError::resource("fcntl(F_DUPFD_CLOEXEC)"))?;

        // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(copy) })
    }

    fn close_range_above_stdio() -> std::result::Result<(), Errno> {
        // SAFETY: close_range(2) closes descriptors 3..=MAX and touches no memory.
        let ret = unsafe { libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, 0u32) };
        Errno::result(ret).map(drop)
    }

    fn close_listed_fds() -> Result<()> {
        let fds: Vec<RawFd> = fs::read_dir("/proc/self/fd")
            .map_err(LaunchError::io("listing /proc/self/fd"))?
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
            .filter(|fd| *fd > libc::STDERR_FILENO)
            .collect();

        for fd in fds {
            // SAFETY: nothing above 2 is used past this point. EBADF is expected for the
            // directory handle used while listing.
            match close(unsafe { OwnedFd::from_raw_fd(fd) }) {
                Ok(_) | Err(Errno::EBADF) => {}
                Err(errno) => return Err(LaunchError::resource("close")(errno)),
            }
        }

        Ok(())
    }

    fn lookup_numeric<T>(name: &str, kind: IdentityKind, raw: impl FnOnce(u32) -> T) -> Result<T> {
        name.parse::<u32>().map(raw).map_err(|_| LaunchError::Lookup {
            kind,
            name: name.to_string(),
        })
    }
}

impl Host for LinuxHost {
    fn dup_std_fds(&self, stdio: StdioFds) -> Result<()> {
        // Every source is copied out of 0..=2 first, so a source that is itself a standard
        // descriptor is read before it gets replaced.
        let stdin = Self::dup_above_stdio(stdio.stdin)?;
        let stdout = Self::dup_above_stdio(stdio.stdout)?;
        let stderr = Self::dup_above_stdio(stdio.stderr)?;

        dup2_stdin(&stdin).map_err(LaunchError::resource("dup2"))?;
        dup2_stdout(&stdout).map_err(LaunchError::resource("dup2"))?;
        dup2_stderr(&stderr).map_err(LaunchError::resource("dup2"))
    }

    fn close_all_other_fds(&self) -> Result<()> {
        match Self::close_range_above_stdio() {
            Ok(()) => Ok(()),
            Err(Errno::ENOSYS) | Err(Errno::EINVAL) => Self::close_listed_fds(),
            Err(errno) => Err(LaunchError::resource("close_range")(errno)),
        }
    }

    fn join_cgroups(&self, tasks_files: &[PathBuf]) -> Result<()> {
        let pid = getpid();

        for tasks_file in tasks_files {
            debug!(tasks_file = %tasks_file.display(), %pid, "joining cgroup");
            OpenOptions::new()
                .write(true)
                .open(tasks_file)
                .and_then(|mut file| file.write_all(pid.to_string().as_bytes()))
                .map_err(|error| {
                    LaunchError::filesystem("joining cgroup", tasks_file)(errno_of(&error))
                })?;
        }

        Ok(())
    }

    fn join_namespace(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|error| {
            LaunchError::filesystem("opening namespace", path)(errno_of(&error))
        })?;

        setns(&file, CloneFlags::empty()).map_err(LaunchError::namespace("setns"))
    }

    fn uid_for_user(&self, name: &str) -> Result<Uid> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(user.uid),
            Ok(None) => Self::lookup_numeric(name, IdentityKind::User, Uid::from_raw),
            Err(_) => Err(LaunchError::Lookup {
                kind: IdentityKind::User,
                name: name.to_string(),
            }),
        }
    }

    fn gid_for_group(&self, name: &str) -> Result<Gid> {
        match Group::from_name(name) {
            Ok(Some(group)) => Ok(group.gid),
            Ok(None) => Self::lookup_numeric(name, IdentityKind::Group, Gid::from_raw),
            Err(_) => Err(LaunchError::Lookup {
                kind: IdentityKind::Group,
                name: name.to_string(),
            }),
        }
    }

    fn drop_bounding_capabilities(&self, target: &CapabilityState) -> Result<()> {
        CapabilityManager.drop_bounding_except(target)
    }

    fn write_map(&self, pid: Pid, kind: MapKind, map: &IdMap) -> Result<()> {
        let path = PathBuf::from(format!("/proc/{pid}/{}", kind.file_name()));
        debug!(path = %path.display(), "writing id map");

        fs::write(&path, map.to_string())
            .map_err(|error| LaunchError::filesystem("writing id map", &path)(errno_of(&error)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExitStatus, wait_for_exit};
    use nix::{
        sys::stat::fstat,
        unistd::{ForkResult, fork, pipe},
    };
    use std::os::fd::AsFd;

    #[test]
    fn test_resolves_root_by_name_and_number() {
        let host = LinuxHost;
        assert_eq!(host.uid_for_user("root").unwrap(), Uid::from_raw(0));
        assert_eq!(host.uid_for_user("0").unwrap(), Uid::from_raw(0));
        assert_eq!(host.gid_for_group("4242").unwrap(), Gid::from_raw(4242));
    }

    #[test]
    fn test_unknown_names_are_lookup_errors() {
        let host = LinuxHost;
        let error = host.uid_for_user("no-such-user-for-spawner").unwrap_err();
        assert!(matches!(
            error,
            LaunchError::Lookup {
                kind: IdentityKind::User,
                ..
            }
        ));

        let error = host.gid_for_group("no-such-group-for-spawner").unwrap_err();
        assert!(matches!(
            error,
            LaunchError::Lookup {
                kind: IdentityKind::Group,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_cgroup_tasks_file_is_fatal() {
        let error = LinuxHost
            .join_cgroups(&[PathBuf::from("/nonexistent/spawner/tasks")])
            .unwrap_err();
        assert_eq!(error.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn test_swapped_standard_descriptors_are_both_kept() {
        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                let swap = || -> Result<bool> {
                    let (_a_read, a_write) = pipe().map_err(LaunchError::resource("pipe"))?;
                    let (_b_read, b_write) = pipe().map_err(LaunchError::resource("pipe"))?;
                    dup2_stdin(&a_write).map_err(LaunchError::resource("dup2"))?;
                    dup2_stdout(&b_write).map_err(LaunchError::resource("dup2"))?;

                    LinuxHost.dup_std_fds(StdioFds {
                        stdin: libc::STDOUT_FILENO,
                        stdout: libc::STDIN_FILENO,
                        stderr: libc::STDERR_FILENO,
                    })?;

                    let inode = |fd: BorrowedFd<'_>| fstat(fd).map(|stat| stat.st_ino);
                    // SAFETY: 0 and 1 were just installed above and stay open.
                    let (stdin, stdout) = unsafe {
                        (
                            BorrowedFd::borrow_raw(libc::STDIN_FILENO),
                            BorrowedFd::borrow_raw(libc::STDOUT_FILENO),
                        )
                    };
                    let swapped = inode(stdin) == inode(b_write.as_fd())
                        && inode(stdout) == inode(a_write.as_fd());
                    Ok(swapped)
                };

                let code = match swap() {
                    Ok(true) => 0,
                    _ => 1,
                };
                unsafe { libc::_exit(code) }
            }
        };

        assert_eq!(wait_for_exit(pid).unwrap(), ExitStatus::Code(0));
    }
}
