use crate::error::{LaunchError, Result, errno_of};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    mount::{MntFlags, MsFlags, mount, umount2},
    pty::{PtyMaster, grantpt, posix_openpt, ptsname_r, unlockpt},
    sys::stat::{Mode, umask},
    unistd::{chdir, mkdir, mkdtemp, pivot_root},
};
use std::{
    fs::{self, OpenOptions},
    os::unix::fs::{OpenOptionsExt, symlink},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Host device nodes bound into an unprivileged `/dev`.
const DEVICE_NODES: [&str; 6] = ["full", "null", "random", "tty", "urandom", "zero"];

/// `(link, target)` pairs created in an unprivileged `/dev`.
const DEVICE_LINKS: [(&str, &str); 7] = [
    ("ptmx", "pts/ptmx"),
    ("core", "/proc/kcore"),
    ("fd", "/proc/self/fd"),
    ("kmsg", "console"),
    ("stdin", "fd/0"),
    ("stdout", "fd/1"),
    ("stderr", "fd/2"),
];

const DEV_TMPFS_OPTIONS: &str = "mode=0755";
const DEVPTS_OPTIONS: &str = "newinstance,ptmxmode=0666";
const SHM_OPTIONS: &str = "mode=1777,size=65536k";
const TMP_OPTIONS: &str = "mode=0755";

/// Name of the directory, relative to the new root, that receives the old root on pivot.
const OLD_ROOT: &str = "host";

/// Sets the file creation mask for as long as it lives.
struct UmaskGuard {
    previous: Mode,
}

impl UmaskGuard {
    fn set(mask: Mode) -> Self {
        Self {
            previous: umask(mask),
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.previous);
    }
}

/// Recursively mark every mount as private so nothing set up for the container propagates back
/// to the host.
pub fn privatize_mounts() -> Result<()> {
    debug!("making mounts private");
    mount::<str, str, str, str>(None, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None)
        .map_err(LaunchError::filesystem("making mounts private", "/"))
}

/// Builds a container root: a bind mount of a source tree with a minimal `/dev`, `/dev/pts`,
/// `/dev/shm` and `/tmp`.
#[derive(Debug, Clone)]
pub struct RootBuilder {
    source: PathBuf,
    privileged: bool,
    mount_point: Option<PathBuf>,
}

impl RootBuilder {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            privileged: false,
            mount_point: None,
        }
    }

    /// Mount a live devtmpfs instead of the device allow-list, and keep the old root at `/host`.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Bind the source here instead of a fresh `/tmp/XXXXXX` directory.
    pub fn mount_point(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(dir.into());
        self
    }

    /// Bind the source, change into it and populate the device tree.
    pub fn build(self) -> Result<NewRoot> {
        let path = {
            let _mask = UmaskGuard::set(Mode::empty());

            let path = match self.mount_point {
                Some(dir) => {
                    make_dir(&dir, 0o755)?;
                    dir
                }
                None => mkdtemp("/tmp/XXXXXX")
                    .map_err(LaunchError::filesystem("creating temporary directory", "/tmp"))?,
            };

            debug!(source = %self.source.display(), root = %path.display(), "binding new root");
            mount::<Path, Path, str, str>(
                Some(self.source.as_path()),
                &path,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None,
            )
            .map_err(LaunchError::filesystem("binding new root", &path))?;
            chdir(&path).map_err(LaunchError::filesystem("entering new root", &path))?;

            populate_dev(&path, self.privileged)?;

            let tmp = path.join("tmp");
            make_dir(&tmp, 0o777)?;
            mount_fs("tmpfs", &tmp, "tmpfs", TMP_OPTIONS)?;

            path
        };

        let console = open_console()?;
        let slave = ptsname_r(&console).map_err(LaunchError::resource("ptsname"))?;
        bind_node(Path::new(&slave), &path.join("dev/console"))?;

        Ok(NewRoot {
            path,
            privileged: self.privileged,
            console,
        })
    }
}

/// A constructed root that has not been entered yet.
#[derive(Debug)]
pub struct NewRoot {
    path: PathBuf,
    privileged: bool,
    console: PtyMaster,
}

impl NewRoot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pivot into the root, leaving the old one at `/host`. Unprivileged roots detach and remove
    /// `/host` afterwards.
    ///
    /// Returns the console's pseudo-terminal master, which must stay open for as long as the
    /// container uses `/dev/console`.
    pub fn enter(self) -> Result<PtyMaster> {
        debug!(root = %self.path.display(), "pivoting into new root");
        chdir(&self.path).map_err(LaunchError::filesystem("entering new root", &self.path))?;
        make_dir(Path::new(OLD_ROOT), 0o755)?;

        pivot_root(".", OLD_ROOT)
            .map_err(LaunchError::filesystem("pivoting into new root", &self.path))?;
        chdir("/").map_err(LaunchError::filesystem("entering new root", "/"))?;

        if !self.privileged {
            let host = Path::new("/").join(OLD_ROOT);
            umount2(&host, MntFlags::MNT_DETACH)
                .map_err(LaunchError::filesystem("detaching old root", &host))?;
            fs::remove_dir(&host).map_err(|error| {
                LaunchError::filesystem("removing old root", &host)(errno_of(&error))
            })?;
        }

        Ok(self.console)
    }
}

/// Mount a fresh `proc` at `<at>/proc`.
pub fn mount_proc(at: &Path) -> Result<()> {
    let target = at.join("proc");
    debug!(target = %target.display(), "mounting proc");

    {
        let _mask = UmaskGuard::set(Mode::empty());
        make_dir(&target, 0o755)?;
    }

    mount::<str, Path, str, str>(Some("proc"), &target, Some("proc"), MsFlags::empty(), None)
        .map_err(LaunchError::filesystem("mounting proc", &target))
}

fn populate_dev(root: &Path, privileged: bool) -> Result<()> {
    let dev = root.join("dev");
    make_dir(&dev, 0o755)?;

    if privileged {
        mount_fs("devtmpfs", &dev, "devtmpfs", "")?;
    } else {
        mount_fs("tmpfs", &dev, "tmpfs", DEV_TMPFS_OPTIONS)?;

        for node in DEVICE_NODES {
            bind_node(&Path::new("/dev").join(node), &dev.join(node))?;
        }

        for (link, target) in DEVICE_LINKS {
            let link = dev.join(link);
            match symlink(target, &link) {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(error) => {
                    return Err(LaunchError::filesystem("creating device link", &link)(
                        errno_of(&error),
                    ));
                }
            }
        }
    }

    let pts = dev.join("pts");
    make_dir(&pts, 0o755)?;
    mount_fs("devpts", &pts, "devpts", DEVPTS_OPTIONS)?;

    let shm = dev.join("shm");
    make_dir(&shm, 0o755)?;
    mount_fs("tmpfs", &shm, "tmpfs", SHM_OPTIONS)
}

fn mount_fs(source: &str, target: &Path, fstype: &str, options: &str) -> Result<()> {
    debug!(fstype, target = %target.display(), options, "mounting");
    mount(Some(source), target, Some(fstype), MsFlags::empty(), Some(options))
        .map_err(LaunchError::filesystem("mounting", target))
}

/// Bind a single device node (or file) over a placeholder file.
fn bind_node(source: &Path, target: &Path) -> Result<()> {
    // A failure here surfaces as a failed bind below.
    let _ = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(target);

    mount::<Path, Path, str, str>(Some(source), target, None, MsFlags::MS_BIND, None)
        .map_err(LaunchError::filesystem("binding device node", target))
}

fn make_dir(path: &Path, mode: u32) -> Result<()> {
    match mkdir(path, Mode::from_bits_truncate(mode)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => Err(LaunchError::filesystem("creating directory", path)(errno)),
    }
}

/// Allocate a pseudo-terminal pair. The master stays open across exec.
fn open_console() -> Result<PtyMaster> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(LaunchError::resource("posix_openpt"))?;
    grantpt(&master).map_err(LaunchError::resource("grantpt"))?;
    unlockpt(&master).map_err(LaunchError::resource("unlockpt"))?;
    Ok(master)
}
