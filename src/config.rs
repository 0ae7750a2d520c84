use crate::utils::is_fd_valid;
use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser};
use nix::{
    libc,
    unistd::{getgid, getuid},
};
use spawner::{IdMap, LaunchRequest, NamespaceKind, NamespaceSetting};
use std::{os::fd::RawFd, path::PathBuf};

const HEADING_GENERAL: &str = "General";
const HEADING_NAMESPACES: &str = "Namespaces";
const HEADING_USER: &str = "User";
const HEADING_FILESYSTEM: &str = "Filesystem";
const HEADING_LIMITS: &str = "Limits";
const HEADING_ENVIRONMENT: &str = "Environment";
const HEADING_DEBUG: &str = "Debug";

#[derive(Parser, Debug)]
#[command(
    name = "spawner",
    version,
    about = "Launch a program inside a freshly isolated container"
)]
pub struct Config {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(flatten)]
    pub namespace: NamespaceOptions,

    #[command(flatten)]
    pub user: UserOptions,

    #[command(flatten)]
    pub filesystem: FilesystemOptions,

    #[command(flatten)]
    pub limits: LimitOptions,

    #[command(flatten)]
    pub env: EnvOptions,

    #[command(flatten)]
    pub debug: DebugOptions,

    /// Program to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl Config {
    /// Turn the parsed arguments into a validated launch request.
    pub fn to_request(&self) -> Result<LaunchRequest> {
        let (command, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("No command given"))?;

        let mut builder = LaunchRequest::builder(command.as_str())
            .args(args.iter().map(String::as_str))
            .stdio(self.env.stdin_fd, self.env.stdout_fd, self.env.stderr_fd)
            .max_open_files(self.limits.max_open_files)
            .max_processes(self.limits.max_processes)
            .privileged(self.filesystem.privileged)
            .mount_proc(self.filesystem.mount_proc)
            .pivot(self.filesystem.pivot)
            .detach(self.general.detach);

        if let Some(argv0) = &self.general.argv0 {
            builder = builder.argv0(argv0.as_str());
        }

        for (kind, setting) in self.namespace.settings() {
            builder = builder.namespace(kind, setting);
        }

        let (uid_map, gid_map) = self.user.maps();
        if let Some(map) = uid_map {
            builder = builder.uid_map(map);
        }
        if let Some(map) = gid_map {
            builder = builder.gid_map(map);
        }
        if let Some(user) = &self.user.user {
            builder = builder.user(user.as_str());
        }
        if let Some(group) = &self.user.group {
            builder = builder.group(group.as_str());
        }
        if let Some(capabilities) = &self.user.capabilities {
            builder = builder.capabilities(capabilities.as_str());
        }

        if let Some(root) = &self.filesystem.root {
            builder = builder.root(root);
        }
        if let Some(dir) = &self.filesystem.mount_point {
            builder = builder.mount_point(dir);
        }

        for tasks_file in &self.limits.cgroup_tasks {
            builder = builder.cgroup(tasks_file);
        }

        for (key, value) in &self.env.env {
            builder = builder.env(key.as_str(), value.as_str());
        }

        builder.build().context("Invalid launch request")
    }
}

#[derive(Args, Debug)]
pub struct GeneralOptions {
    #[arg(
        long,
        help = "Return once the container is set up instead of waiting for it to exit",
        help_heading = HEADING_GENERAL
    )]
    pub detach: bool,

    #[arg(
        long,
        value_name = "NAME",
        help = "Use <NAME> as argv[0] instead of the command",
        help_heading = HEADING_GENERAL
    )]
    pub argv0: Option<String>,
}

#[derive(Args, Debug)]
pub struct NamespaceOptions {
    #[arg(
        long,
        help = "Create new user namespace",
        conflicts_with = "user_ns",
        help_heading = HEADING_NAMESPACES
    )]
    pub new_user: bool,

    #[arg(
        long,
        help = "Create new IPC namespace",
        conflicts_with = "ipc_ns",
        help_heading = HEADING_NAMESPACES
    )]
    pub new_ipc: bool,

    #[arg(
        long,
        help = "Create new UTS namespace",
        conflicts_with = "uts_ns",
        help_heading = HEADING_NAMESPACES
    )]
    pub new_uts: bool,

    #[arg(
        long,
        help = "Create new network namespace",
        conflicts_with = "net_ns",
        help_heading = HEADING_NAMESPACES
    )]
    pub new_net: bool,

    #[arg(
        long,
        help = "Create new PID namespace",
        conflicts_with = "pid_ns",
        help_heading = HEADING_NAMESPACES
    )]
    pub new_pid: bool,

    #[arg(
        long,
        help = "Create new mount namespace",
        conflicts_with = "mount_ns",
        help_heading = HEADING_NAMESPACES
    )]
    pub new_mount: bool,

    #[arg(long, value_name = "PATH", help = "Join this user namespace", help_heading = HEADING_NAMESPACES)]
    pub user_ns: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Join this IPC namespace", help_heading = HEADING_NAMESPACES)]
    pub ipc_ns: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Join this UTS namespace", help_heading = HEADING_NAMESPACES)]
    pub uts_ns: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Join this network namespace", help_heading = HEADING_NAMESPACES)]
    pub net_ns: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Join this PID namespace", help_heading = HEADING_NAMESPACES)]
    pub pid_ns: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Join this mount namespace", help_heading = HEADING_NAMESPACES)]
    pub mount_ns: Option<PathBuf>,
}

impl NamespaceOptions {
    fn mappings(&self) -> [(NamespaceKind, bool, Option<&PathBuf>); 6] {
        [
            (NamespaceKind::User, self.new_user, self.user_ns.as_ref()),
            (NamespaceKind::Ipc, self.new_ipc, self.ipc_ns.as_ref()),
            (NamespaceKind::Uts, self.new_uts, self.uts_ns.as_ref()),
            (NamespaceKind::Network, self.new_net, self.net_ns.as_ref()),
            (NamespaceKind::Pid, self.new_pid, self.pid_ns.as_ref()),
            (NamespaceKind::Mount, self.new_mount, self.mount_ns.as_ref()),
        ]
    }

    fn settings(&self) -> impl Iterator<Item = (NamespaceKind, NamespaceSetting)> + '_ {
        self.mappings()
            .into_iter()
            .filter_map(|(kind, create, join)| match (create, join) {
                (true, _) => Some((kind, NamespaceSetting::Create)),
                (false, Some(path)) => Some((kind, NamespaceSetting::Join(path.clone()))),
                (false, None) => None,
            })
    }
}

#[derive(Args, Debug)]
pub struct UserOptions {
    #[arg(
        long,
        value_name = "MAP",
        help = "uid_map entries, \"inside outside count\" separated by commas",
        requires = "new_user",
        conflicts_with = "map_root",
        help_heading = HEADING_USER
    )]
    pub uid_map: Option<String>,

    #[arg(
        long,
        value_name = "MAP",
        help = "gid_map entries, \"inside outside count\" separated by commas",
        requires = "new_user",
        conflicts_with = "map_root",
        help_heading = HEADING_USER
    )]
    pub gid_map: Option<String>,

    #[arg(
        long,
        help = "Map the caller's uid and gid to root inside the new user namespace",
        requires = "new_user",
        help_heading = HEADING_USER
    )]
    pub map_root: bool,

    #[arg(long, help = "Run the program as this user", help_heading = HEADING_USER)]
    pub user: Option<String>,

    #[arg(long, help = "Run the program with this group", help_heading = HEADING_USER)]
    pub group: Option<String>,

    #[arg(
        long,
        value_name = "TEXT",
        help = "Capabilities in libcap text form, e.g. \"cap_net_bind_service=eip\"",
        help_heading = HEADING_USER
    )]
    pub capabilities: Option<String>,
}

impl UserOptions {
    fn maps(&self) -> (Option<String>, Option<String>) {
        if self.map_root {
            return (
                Some(IdMap::single(getuid().as_raw(), 0).to_string()),
                Some(IdMap::single(getgid().as_raw(), 0).to_string()),
            );
        }

        (self.uid_map.clone(), self.gid_map.clone())
    }
}

#[derive(Args, Debug)]
pub struct FilesystemOptions {
    #[arg(
        long,
        value_name = "DIR",
        help = "Directory holding the container's root filesystem",
        help_heading = HEADING_FILESYSTEM
    )]
    pub root: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Bind the root here instead of a new /tmp directory",
        requires = "root",
        help_heading = HEADING_FILESYSTEM
    )]
    pub mount_point: Option<PathBuf>,

    #[arg(
        long,
        help = "Mount devtmpfs at /dev and keep the host root at /host",
        help_heading = HEADING_FILESYSTEM
    )]
    pub privileged: bool,

    #[arg(long, help = "Mount a fresh /proc", help_heading = HEADING_FILESYSTEM)]
    pub mount_proc: bool,

    #[arg(
        long,
        help = "Pivot into the root filesystem",
        requires = "root",
        help_heading = HEADING_FILESYSTEM
    )]
    pub pivot: bool,
}

#[derive(Args, Debug)]
pub struct LimitOptions {
    #[arg(
        long,
        value_name = "N",
        default_value_t = 0,
        help = "RLIMIT_NOFILE for the program (0 leaves it unchanged)",
        help_heading = HEADING_LIMITS
    )]
    pub max_open_files: u64,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 0,
        help = "RLIMIT_NPROC for the program (0 leaves it unchanged)",
        help_heading = HEADING_LIMITS
    )]
    pub max_processes: u64,

    #[arg(
        long,
        value_name = "PATH",
        help = "Join the cgroup owning this tasks file (repeatable)",
        help_heading = HEADING_LIMITS
    )]
    pub cgroup_tasks: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EnvOptions {
    #[arg(
        long,
        value_name = "KEY=VALUE",
        value_parser = parse_env_var,
        help = "Set an environment variable; nothing else is inherited (repeatable)",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub env: Vec<(String, String)>,

    #[arg(
        long,
        value_name = "FD",
        default_value_t = libc::STDIN_FILENO,
        value_parser = validate_fd_arg,
        help = "Descriptor to use as the program's stdin",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub stdin_fd: RawFd,

    #[arg(
        long,
        value_name = "FD",
        default_value_t = libc::STDOUT_FILENO,
        value_parser = validate_fd_arg,
        help = "Descriptor to use as the program's stdout",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub stdout_fd: RawFd,

    #[arg(
        long,
        value_name = "FD",
        default_value_t = libc::STDERR_FILENO,
        value_parser = validate_fd_arg,
        help = "Descriptor to use as the program's stderr",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub stderr_fd: RawFd,
}

#[derive(Args, Debug)]
pub struct DebugOptions {
    #[arg(long, help = "Log every launch step", help_heading = HEADING_DEBUG)]
    pub debug: bool,
}

fn validate_fd_arg(input: &str) -> Result<RawFd> {
    let raw_fd = input.parse::<RawFd>()?;
    is_fd_valid(raw_fd)
}

fn parse_env_var(input: &str) -> Result<(String, String)> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected KEY=VALUE, got {input:?}"))?;
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> std::result::Result<Config, clap::Error> {
        Config::try_parse_from(std::iter::once("spawner").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Config::command().debug_assert();
    }

    #[test]
    fn test_trailing_command_keeps_its_flags() {
        let config = parse(&["--new-pid", "--", "/bin/ls", "-la", "/"]).unwrap();

        assert_eq!(config.command, vec!["/bin/ls", "-la", "/"]);
        assert!(config.namespace.new_pid);
        assert_eq!(config.env.stdout_fd, 1);
    }

    #[test]
    fn test_create_and_join_conflict() {
        assert!(parse(&["--new-net", "--net-ns", "/proc/1/ns/net", "/bin/true"]).is_err());
    }

    #[test]
    fn test_maps_require_new_user_namespace() {
        assert!(parse(&["--uid-map", "0 1000 1", "/bin/true"]).is_err());
        assert!(parse(&["--new-user", "--uid-map", "0 1000 1", "/bin/true"]).is_ok());
    }

    #[test]
    fn test_env_values_may_contain_equals() {
        let config = parse(&["--env", "A=b=c", "--env", "PATH=/bin", "/bin/true"]).unwrap();
        assert_eq!(
            config.env.env,
            vec![
                ("A".to_string(), "b=c".to_string()),
                ("PATH".to_string(), "/bin".to_string())
            ]
        );
        assert!(parse(&["--env", "NOEQUALS", "/bin/true"]).is_err());
    }

    #[test]
    fn test_config_builds_request() {
        let config = parse(&[
            "--new-user",
            "--map-root",
            "--new-mount",
            "--mount-ns",
            "/proc/1/ns/mnt",
            "--detach",
            "/bin/sh",
        ]);
        assert!(config.is_err(), "creating and joining mount namespaces conflicts");

        let config = parse(&[
            "--new-user",
            "--map-root",
            "--ipc-ns",
            "/proc/1/ns/ipc",
            "--detach",
            "--argv0",
            "init",
            "/bin/sh",
        ])
        .unwrap();
        let request = config.to_request().unwrap();

        assert_eq!(request.command(), "/bin/sh");
        assert!(request.detach());
        assert_eq!(
            request.namespaces().get(NamespaceKind::User),
            &NamespaceSetting::Create
        );
        assert_eq!(
            request.namespaces().get(NamespaceKind::Ipc),
            &NamespaceSetting::Join(PathBuf::from("/proc/1/ns/ipc"))
        );
    }

    #[test]
    fn test_closed_descriptor_is_rejected() {
        assert!(parse(&["--stdin-fd", "987654", "/bin/true"]).is_err());
    }
}
