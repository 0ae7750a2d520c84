use crate::error::{ChildFailure, LaunchError, Result};
use nix::{fcntl::OFlag, unistd::pipe2};
use std::{
    fs::File,
    io::{Read, Write},
    os::fd::OwnedFd,
};

/// One-shot channel from the container process back to the launcher.
///
/// Closing the sender without writing means ready. Writing a [`ChildFailure`] means the
/// container gave up before exec.
#[derive(Debug)]
pub struct ReadinessChannel {
    /// Read end of the pipe
    reader: OwnedFd,

    /// Write end of the pipe
    writer: OwnedFd,
}

impl ReadinessChannel {
    pub fn new() -> Result<Self> {
        let (reader, writer) =
            pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::resource("pipe2"))?;

        Ok(Self { reader, writer })
    }

    /// Consumes the channel, handing out the two ends. Each process keeps only one of them.
    pub fn split(self) -> (ReadinessReceiver, ReadinessSender) {
        (
            ReadinessReceiver {
                reader: self.reader,
            },
            ReadinessSender {
                writer: self.writer,
            },
        )
    }
}

#[derive(Debug)]
pub struct ReadinessSender {
    writer: OwnedFd,
}

impl ReadinessSender {
    /// Signal readiness by closing the write end.
    pub fn ready(self) {
        drop(self.writer);
    }

    /// Report `error` and close the write end.
    pub fn fail(self, error: &LaunchError) -> Result<()> {
        let failure = ChildFailure::from(error);
        let payload = bincode::serde::encode_to_vec(&failure, bincode::config::standard())
            .unwrap_or_else(|_| failure.to_string().into_bytes());

        File::from(self.writer)
            .write_all(&payload)
            .map_err(LaunchError::io("writing readiness failure"))
    }
}

#[derive(Debug)]
pub struct ReadinessReceiver {
    reader: OwnedFd,
}

impl ReadinessReceiver {
    /// Block until every sender is closed.
    ///
    /// EOF with no data is success. Any data is a failure reported by the container, and a
    /// failed read is an error of the channel itself.
    pub fn wait(self) -> Result<()> {
        let mut payload = Vec::new();
        File::from(self.reader)
            .read_to_end(&mut payload)
            .map_err(LaunchError::io("reading readiness channel"))?;

        if payload.is_empty() {
            return Ok(());
        }

        let failure = bincode::serde::decode_from_slice::<ChildFailure, _>(
            &payload,
            bincode::config::standard(),
        )
        .map(|(failure, _)| failure)
        .unwrap_or_else(|_| ChildFailure {
            class: "unknown".to_string(),
            errno: None,
            message: String::from_utf8_lossy(&payload).into_owned(),
        });

        Err(LaunchError::ChildReported(failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_closed_sender_means_ready() {
        let (receiver, sender) = ReadinessChannel::new().unwrap().split();
        sender.ready();

        receiver.wait().unwrap();
    }

    #[test]
    fn test_reported_failure_reaches_receiver() {
        let (receiver, sender) = ReadinessChannel::new().unwrap().split();
        sender
            .fail(&LaunchError::namespace("unshare")(Errno::EPERM))
            .unwrap();

        match receiver.wait() {
            Err(LaunchError::ChildReported(failure)) => {
                assert_eq!(failure.class, "namespace");
                assert_eq!(failure.errno, Some(Errno::EPERM as i32));
                assert!(failure.message.contains("unshare"));
            }
            other => panic!("unexpected readiness result: {other:?}"),
        }
    }

    #[test]
    fn test_undecodable_data_is_still_a_failure() {
        let (receiver, sender) = ReadinessChannel::new().unwrap().split();
        File::from(sender.writer).write_all(&[0xff; 3]).unwrap();

        assert!(matches!(
            receiver.wait(),
            Err(LaunchError::ChildReported(ChildFailure { ref class, .. })) if class == "unknown"
        ));
    }
}
