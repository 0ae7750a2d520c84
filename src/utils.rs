use anyhow::{Result, anyhow};
use nix::fcntl::{FcntlArg, fcntl};
use std::os::fd::{BorrowedFd, RawFd};

/// Checks whether a given FD is open in this process.
pub fn is_fd_valid(raw_fd: RawFd) -> Result<RawFd> {
    if raw_fd < 0 {
        return Err(anyhow!("Invalid file descriptor ({raw_fd})"));
    }

    // SAFETY: This call doesn't dereference or take ownership, just validates via `fcntl`.
    let fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };

    fcntl(fd, FcntlArg::F_GETFD)
        .map_err(|error| anyhow!("Invalid file descriptor {error} ({raw_fd})"))?;
    Ok(raw_fd)
}
