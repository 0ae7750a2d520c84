use crate::{
    capabilities::CapabilityText,
    error::{LaunchError, Result},
    idmap::IdMap,
    namespace::{NamespaceKind, NamespacePlan, NamespaceSetting},
};
use nix::libc;
use std::{ffi::CString, os::fd::RawFd, path::PathBuf};

/// Descriptors that become the container's stdin, stdout and stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioFds {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

impl Default for StdioFds {
    fn default() -> Self {
        Self {
            stdin: libc::STDIN_FILENO,
            stdout: libc::STDOUT_FILENO,
            stderr: libc::STDERR_FILENO,
        }
    }
}

/// Ceilings applied with `setrlimit(2)`; zero leaves a limit untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_open_files: u64,
    pub max_processes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemPlan {
    /// Directory holding the container's root filesystem.
    pub root: Option<PathBuf>,

    /// Where the root is bind mounted; a fresh `/tmp/XXXXXX` directory when unset.
    pub mount_point: Option<PathBuf>,

    /// Mount a live devtmpfs and keep the old root reachable at `/host`.
    pub privileged: bool,

    pub mount_proc: bool,

    /// Pivot into the new root before exec.
    pub pivot: bool,
}

/// Everything needed to start one container. Built once, consumed by the launcher.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub(crate) command: CString,
    pub(crate) args: Vec<CString>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) stdio: StdioFds,
    pub(crate) namespaces: NamespacePlan,
    pub(crate) uid_map: Option<IdMap>,
    pub(crate) gid_map: Option<IdMap>,
    pub(crate) limits: ResourceLimits,
    pub(crate) filesystem: FilesystemPlan,
    pub(crate) user: Option<String>,
    pub(crate) group: Option<String>,
    pub(crate) capabilities: Option<CapabilityText>,
    pub(crate) cgroups: Vec<PathBuf>,
    pub(crate) detach: bool,
}

impl LaunchRequest {
    pub fn builder(command: impl Into<String>) -> LaunchRequestBuilder {
        LaunchRequestBuilder::new(command)
    }

    pub fn command(&self) -> &str {
        self.command.to_str().unwrap_or_default()
    }

    pub fn namespaces(&self) -> &NamespacePlan {
        &self.namespaces
    }

    pub fn detach(&self) -> bool {
        self.detach
    }

    pub(crate) fn creates_user_namespace(&self) -> bool {
        self.namespaces.creates(NamespaceKind::User)
    }

    /// `KEY=VALUE` entries, in insertion order.
    pub(crate) fn envp(&self) -> Vec<CString> {
        self.env
            .iter()
            .filter_map(|(key, value)| CString::new(format!("{key}={value}")).ok())
            .collect()
    }

    pub(crate) fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequestBuilder {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdio: StdioFds,
    namespaces: NamespacePlan,
    uid_map: Option<String>,
    gid_map: Option<String>,
    limits: ResourceLimits,
    filesystem: FilesystemPlan,
    user: Option<String>,
    group: Option<String>,
    capabilities: Option<String>,
    cgroups: Vec<PathBuf>,
    detach: bool,
}

impl LaunchRequestBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            args: vec![command.clone()],
            command,
            env: Vec::new(),
            stdio: StdioFds::default(),
            namespaces: NamespacePlan::default(),
            uid_map: None,
            gid_map: None,
            limits: ResourceLimits::default(),
            filesystem: FilesystemPlan::default(),
            user: None,
            group: None,
            capabilities: None,
            cgroups: Vec::new(),
            detach: false,
        }
    }

    /// Replace `argv[0]`, which defaults to the command.
    pub fn argv0(mut self, argv0: impl Into<String>) -> Self {
        self.args[0] = argv0.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable. Setting a key twice keeps its first position.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        match self.env.iter_mut().find(|(name, _)| *name == key) {
            Some((_, existing)) => *existing = value,
            None => self.env.push((key, value)),
        }
        self
    }

    pub fn stdio(mut self, stdin: RawFd, stdout: RawFd, stderr: RawFd) -> Self {
        self.stdio = StdioFds {
            stdin,
            stdout,
            stderr,
        };
        self
    }

    pub fn namespace(mut self, kind: NamespaceKind, setting: NamespaceSetting) -> Self {
        self.namespaces.set(kind, setting);
        self
    }

    pub fn uid_map(mut self, map: impl Into<String>) -> Self {
        self.uid_map = Some(map.into());
        self
    }

    pub fn gid_map(mut self, map: impl Into<String>) -> Self {
        self.gid_map = Some(map.into());
        self
    }

    pub fn max_open_files(mut self, limit: u64) -> Self {
        self.limits.max_open_files = limit;
        self
    }

    pub fn max_processes(mut self, limit: u64) -> Self {
        self.limits.max_processes = limit;
        self
    }

    pub fn root(mut self, source: impl Into<PathBuf>) -> Self {
        self.filesystem.root = Some(source.into());
        self
    }

    pub fn mount_point(mut self, dir: impl Into<PathBuf>) -> Self {
        self.filesystem.mount_point = Some(dir.into());
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.filesystem.privileged = privileged;
        self
    }

    pub fn mount_proc(mut self, mount_proc: bool) -> Self {
        self.filesystem.mount_proc = mount_proc;
        self
    }

    pub fn pivot(mut self, pivot: bool) -> Self {
        self.filesystem.pivot = pivot;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn capabilities(mut self, text: impl Into<String>) -> Self {
        self.capabilities = Some(text.into());
        self
    }

    /// Join the cgroup owning this tasks file.
    pub fn cgroup(mut self, tasks_file: impl Into<PathBuf>) -> Self {
        self.cgroups.push(tasks_file.into());
        self
    }

    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn build(self) -> Result<LaunchRequest> {
        if self.command.is_empty() {
            return Err(invalid("command is empty"));
        }
        if self.args[0].is_empty() {
            return Err(invalid("argv[0] is empty"));
        }

        let command = c_string(self.command, "command")?;
        let args = self
            .args
            .into_iter()
            .map(|arg| c_string(arg, "argument"))
            .collect::<Result<Vec<_>>>()?;

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') {
                return Err(invalid(format!("environment key {key:?} is not valid")));
            }
            if key.contains('\0') || value.contains('\0') {
                return Err(invalid(format!(
                    "environment variable {key:?} contains a NUL byte"
                )));
            }
        }

        let creates_user = self.namespaces.creates(NamespaceKind::User);
        if !creates_user && (self.uid_map.is_some() || self.gid_map.is_some()) {
            return Err(invalid("uid/gid maps require a new user namespace"));
        }

        let uid_map = self.uid_map.as_deref().map(str::parse::<IdMap>).transpose()?;
        let gid_map = self.gid_map.as_deref().map(str::parse::<IdMap>).transpose()?;

        if self.filesystem.pivot && self.filesystem.root.is_none() {
            return Err(invalid("pivoting requires a root directory"));
        }
        if self.filesystem.mount_point.is_some() && self.filesystem.root.is_none() {
            return Err(invalid("a mount point requires a root directory"));
        }

        let capabilities = self
            .capabilities
            .as_deref()
            .map(str::parse::<CapabilityText>)
            .transpose()?;

        Ok(LaunchRequest {
            command,
            args,
            env: self.env,
            stdio: self.stdio,
            namespaces: self.namespaces,
            uid_map,
            gid_map,
            limits: self.limits,
            filesystem: self.filesystem,
            user: self.user,
            group: self.group,
            capabilities,
            cgroups: self.cgroups,
            detach: self.detach,
        })
    }
}

fn c_string(value: String, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| invalid(format!("{what} contains a NUL byte")))
}

fn invalid(message: impl Into<String>) -> LaunchError {
    LaunchError::InvalidRequest(message.into())
}
