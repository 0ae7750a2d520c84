use crate::{
    barrier::StopBarrier,
    capabilities::{CapabilityManager, CapabilityState},
    checks::unsupported_namespace,
    error::{LaunchError, Result},
    host::{Host, LinuxHost, MapKind},
    identity::CallerIdentity,
    namespace::{NamespaceKind, NamespaceSetting},
    process::{ExitStatus, wait_for_exit},
    readiness::{ReadinessChannel, ReadinessSender},
    request::LaunchRequest,
    rootfs::{NewRoot, RootBuilder, mount_proc, privatize_mounts},
};
use nix::{
    errno::Errno,
    libc,
    pty::PtyMaster,
    sched::unshare,
    sys::{
        resource::{Resource, setrlimit},
        stat::{Mode, umask},
    },
    unistd::{
        AccessFlags, ForkResult, Gid, Pid, Uid, access, execve, fork, geteuid, getpid, setgid,
        setgroups, setuid,
    },
};
use std::{
    ffi::CString,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, info_span};

/// Search path used when the request's environment has no `PATH`.
const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// File creation mask the container program starts with.
const CONTAINER_UMASK: u32 = 0o022;

/// What the caller gets back once a launch has finished on its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The container ran to completion.
    Exited(ExitStatus),

    /// The container finished its setup and is running on its own.
    Detached { pid: Pid },
}

/// Steps taken by the launching process, up to the final fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SpawnMapHelper,
    ConfigureStdio,
    CloseDescriptors,
    JoinCgroups,
    JoinNamespace(NamespaceKind),
    SetResourceLimits,
    ResetIdentity,
    Unshare,
    MapRendezvous,
    PrivatizeMounts,
    BuildRoot,
    OpenReadiness,
}

impl Step {
    /// The steps `request` needs, in the order they must run.
    pub fn plan(request: &LaunchRequest) -> Vec<Step> {
        let creates_user = request.creates_user_namespace();
        let mut steps = Vec::new();

        if creates_user {
            steps.push(Step::SpawnMapHelper);
        }

        steps.extend([Step::ConfigureStdio, Step::CloseDescriptors]);

        if !request.cgroups.is_empty() {
            steps.push(Step::JoinCgroups);
        }

        steps.extend(
            request
                .namespaces
                .joins()
                .map(|(kind, _)| Step::JoinNamespace(kind)),
        );

        if request.limits.max_open_files != 0 || request.limits.max_processes != 0 {
            steps.push(Step::SetResourceLimits);
        }

        steps.push(Step::ResetIdentity);

        if !request.namespaces.clone_flags().is_empty() {
            steps.push(Step::Unshare);
        }
        if creates_user {
            steps.push(Step::MapRendezvous);
        }
        if request.namespaces.creates(NamespaceKind::Mount) {
            steps.push(Step::PrivatizeMounts);
        }
        if request.filesystem.root.is_some() {
            steps.push(Step::BuildRoot);
        }
        if request.detach {
            steps.push(Step::OpenReadiness);
        }

        steps
    }
}

/// Steps taken by the container process between the final fork and exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStep {
    MountProc,
    EnterRoot,
    RetainCapabilities,
    DropBoundingCapabilities,
    SwitchGroup,
    SwitchUser,
    StopRetainingCapabilities,
    ApplyCapabilities,
    SignalReady,
}

impl ContainerStep {
    pub fn plan(request: &LaunchRequest) -> Vec<ContainerStep> {
        let mut steps = Vec::new();

        if request.filesystem.mount_proc {
            steps.push(ContainerStep::MountProc);
        }
        if request.filesystem.pivot {
            steps.push(ContainerStep::EnterRoot);
        }

        steps.extend([
            ContainerStep::RetainCapabilities,
            ContainerStep::DropBoundingCapabilities,
        ]);
        if request.group.is_some() {
            steps.push(ContainerStep::SwitchGroup);
        }
        if request.user.is_some() {
            steps.push(ContainerStep::SwitchUser);
        }
        steps.extend([
            ContainerStep::StopRetainingCapabilities,
            ContainerStep::ApplyCapabilities,
        ]);

        if request.detach {
            steps.push(ContainerStep::SignalReady);
        }

        steps
    }
}

/// Everything the launching process carries from one step to the next.
#[derive(Debug)]
pub struct LaunchState {
    caller: CallerIdentity,
    helper: Option<Pid>,
    root: Option<NewRoot>,
    readiness: Option<ReadinessChannel>,
}

impl LaunchState {
    pub fn new(caller: CallerIdentity) -> Self {
        Self {
            caller,
            helper: None,
            root: None,
            readiness: None,
        }
    }
}

/// What the container process carries between its steps.
struct ContainerState {
    root: Option<NewRoot>,
    console: Option<PtyMaster>,
    capabilities: CapabilityState,
    readiness: Option<ReadinessSender>,
}

/// Runs a [`LaunchRequest`] against a set of host primitives.
#[derive(Debug, Default)]
pub struct Launcher<H: Host = LinuxHost> {
    host: H,
}

/// Launch with the primitives of the running kernel.
pub fn launch(request: LaunchRequest) -> Result<LaunchOutcome> {
    Launcher::<LinuxHost>::default().launch(request)
}

impl<H: Host> Launcher<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    /// Run the whole pipeline. This mutates the calling process: descriptors, identity,
    /// namespaces and limits are changed in place before the final fork.
    pub fn launch(&self, request: LaunchRequest) -> Result<LaunchOutcome> {
        let span = info_span!("launch", command = request.command());
        let _enter = span.enter();

        if let Some(kind) = unsupported_namespace(&request.namespaces) {
            error!(%kind, "kernel does not support namespace");
            return Err(LaunchError::namespace("checking namespace support")(
                Errno::EINVAL,
            ));
        }

        let caller = CallerIdentity::capture()?;
        debug!(level = ?caller.privilege_level(), uid = %caller.ruid(), "launching");

        let mut state = LaunchState::new(caller);
        for step in Step::plan(&request) {
            self.apply_step(step, &request, &mut state)?;
        }

        let readiness = state.readiness.take().map(ReadinessChannel::split);

        match unsafe { fork() }.map_err(LaunchError::resource("fork"))? {
            ForkResult::Parent { child } => {
                drop(state.root.take());

                match readiness {
                    Some((receiver, sender)) => {
                        drop(sender);
                        if let Err(error) = receiver.wait() {
                            let _ = wait_for_exit(child);
                            return Err(error);
                        }
                        info!(pid = %child, "container detached");
                        Ok(LaunchOutcome::Detached { pid: child })
                    }
                    None => {
                        let status = wait_for_exit(child)?;
                        info!(pid = %child, %status, "container exited");
                        Ok(LaunchOutcome::Exited(status))
                    }
                }
            }
            ForkResult::Child => {
                let sender = readiness.map(|(receiver, sender)| {
                    drop(receiver);
                    sender
                });
                self.run_container(&request, state.root.take(), sender)
            }
        }
    }

    /// Execute one launching-process step.
    pub fn apply_step(
        &self,
        step: Step,
        request: &LaunchRequest,
        state: &mut LaunchState,
    ) -> Result<()> {
        debug!(?step, "applying step");

        match step {
            Step::SpawnMapHelper => {
                state.helper = Some(self.spawn_map_helper(request)?);
            }
            Step::ConfigureStdio => self.host.dup_std_fds(request.stdio)?,
            Step::CloseDescriptors => self.host.close_all_other_fds()?,
            Step::JoinCgroups => self.host.join_cgroups(&request.cgroups)?,
            Step::JoinNamespace(kind) => {
                if let NamespaceSetting::Join(path) = request.namespaces.get(kind) {
                    debug!(%kind, path = %path.display(), "joining namespace");
                    self.host.join_namespace(path)?;
                }
            }
            Step::SetResourceLimits => {
                let limits = request.limits;
                if limits.max_open_files != 0 {
                    debug!(limit = limits.max_open_files, "setting open files limit");
                    setrlimit(
                        Resource::RLIMIT_NOFILE,
                        limits.max_open_files,
                        limits.max_open_files,
                    )
                    .map_err(LaunchError::privilege("setrlimit(RLIMIT_NOFILE)"))?;
                }
                if limits.max_processes != 0 {
                    debug!(limit = limits.max_processes, "setting processes limit");
                    setrlimit(
                        Resource::RLIMIT_NPROC,
                        limits.max_processes,
                        limits.max_processes,
                    )
                    .map_err(LaunchError::privilege("setrlimit(RLIMIT_NPROC)"))?;
                }
            }
            Step::ResetIdentity => {
                debug!(uid = %state.caller.ruid(), gid = %state.caller.gid(), "resetting uid/gid");
                setgid(state.caller.gid()).map_err(LaunchError::privilege("setgid"))?;
                setuid(state.caller.ruid()).map_err(LaunchError::privilege("setuid"))?;
            }
            Step::Unshare => {
                let flags = request.namespaces.clone_flags();
                debug!(?flags, "unsharing namespaces");
                unshare(flags).map_err(LaunchError::namespace("unshare"))?;
            }
            Step::MapRendezvous => {
                let helper = state
                    .helper
                    .take()
                    .ok_or_else(|| LaunchError::Helper("was never started".to_string()))?;

                debug!(%helper, "waiting for uid/gid maps");
                StopBarrier::await_parked(helper)?;
                StopBarrier::release_and_reap(helper)?;

                setgid(Gid::from_raw(0)).map_err(LaunchError::privilege("setgid(0)"))?;
                setgroups(&[]).map_err(LaunchError::privilege("setgroups"))?;
                setuid(Uid::from_raw(0)).map_err(LaunchError::privilege("setuid(0)"))?;
            }
            Step::PrivatizeMounts => privatize_mounts()?,
            Step::BuildRoot => {
                if let Some(source) = &request.filesystem.root {
                    debug!(source = %source.display(), "creating root filesystem");
                    let mut builder =
                        RootBuilder::new(source).privileged(request.filesystem.privileged);
                    if let Some(dir) = &request.filesystem.mount_point {
                        builder = builder.mount_point(dir);
                    }
                    state.root = Some(builder.build()?);
                }
            }
            Step::OpenReadiness => {
                state.readiness = Some(ReadinessChannel::new()?);
            }
        }

        Ok(())
    }

    /// Fork the process that writes this process's id maps once it has unshared.
    fn spawn_map_helper(&self, request: &LaunchRequest) -> Result<Pid> {
        let target = getpid();

        match unsafe { fork() }.map_err(LaunchError::resource("fork"))? {
            ForkResult::Parent { child } => {
                debug!(helper = %child, "started uid/gid map helper");
                Ok(child)
            }
            ForkResult::Child => {
                let code = match self.write_maps(target, request) {
                    Ok(()) => 0,
                    Err(error) => {
                        eprintln!("uid/gid map helper: {error}");
                        1
                    }
                };
                // SAFETY: leaves the forked helper without running the parent's exit handlers.
                unsafe { libc::_exit(code) }
            }
        }
    }

    fn write_maps(&self, target: Pid, request: &LaunchRequest) -> Result<()> {
        StopBarrier::park()?;

        if let Some(map) = &request.gid_map {
            self.host.write_map(target, MapKind::Gid, map)?;
        }
        if let Some(map) = &request.uid_map {
            self.host.write_map(target, MapKind::Uid, map)?;
        }

        Ok(())
    }

    /// The final child: prepare, then exec. Never returns.
    fn run_container(
        &self,
        request: &LaunchRequest,
        root: Option<NewRoot>,
        readiness: Option<ReadinessSender>,
    ) -> ! {
        let mut container = ContainerState {
            root,
            console: None,
            capabilities: CapabilityState::default(),
            readiness,
        };

        let error = match self.prepare_container(request, &mut container) {
            Ok(()) => exec(request),
            Err(error) => error,
        };

        eprintln!("spawner: container setup failed: {error}");
        if let Some(sender) = container.readiness.take() {
            let _ = sender.fail(&error);
        }
        drop(container.console.take());

        // SAFETY: the forked child must not unwind into the caller's stack.
        unsafe { libc::_exit(1) }
    }

    fn prepare_container(
        &self,
        request: &LaunchRequest,
        container: &mut ContainerState,
    ) -> Result<()> {
        container.capabilities = CapabilityState::resolve(request.capabilities.as_ref())?;

        for step in ContainerStep::plan(request) {
            self.apply_container_step(step, request, container)?;
        }

        Ok(())
    }

    fn apply_container_step(
        &self,
        step: ContainerStep,
        request: &LaunchRequest,
        container: &mut ContainerState,
    ) -> Result<()> {
        debug!(?step, "applying container step");
        let manager = CapabilityManager;

        match step {
            ContainerStep::MountProc => {
                let at = container
                    .root
                    .as_ref()
                    .map_or(Path::new("/"), NewRoot::path);
                mount_proc(at)?;
            }
            ContainerStep::EnterRoot => {
                let root = container.root.take().ok_or_else(|| {
                    LaunchError::InvalidRequest("no root filesystem to enter".to_string())
                })?;
                container.console = Some(root.enter()?);
            }
            ContainerStep::RetainCapabilities => manager.retain(true)?,
            ContainerStep::DropBoundingCapabilities => {
                self.host.drop_bounding_capabilities(&container.capabilities)?;
            }
            ContainerStep::SwitchGroup => {
                if let Some(group) = &request.group {
                    let gid = self.host.gid_for_group(group)?;
                    if gid.as_raw() != 0 {
                        debug!(%gid, "switching group");
                        if geteuid().is_root() {
                            setgroups(&[gid]).map_err(LaunchError::privilege("setgroups"))?;
                        }
                        setgid(gid).map_err(LaunchError::privilege("setgid"))?;
                    }
                }
            }
            ContainerStep::SwitchUser => {
                if let Some(user) = &request.user {
                    let uid = self.host.uid_for_user(user)?;
                    if !uid.is_root() {
                        debug!(%uid, "switching user");
                        setuid(uid).map_err(LaunchError::privilege("setuid"))?;
                    }
                }
            }
            ContainerStep::StopRetainingCapabilities => manager.retain(false)?,
            ContainerStep::ApplyCapabilities => {
                manager.apply(&container.capabilities)?;
                debug!(capabilities = %manager.snapshot()?, "capabilities applied");
            }
            ContainerStep::SignalReady => {
                if let Some(sender) = container.readiness.take() {
                    debug!("detaching");
                    sender.ready();
                }
            }
        }

        Ok(())
    }
}

/// Replace the process image. Only returns on failure.
fn exec(request: &LaunchRequest) -> LaunchError {
    let path = match resolve_command(request) {
        Ok(path) => path,
        Err(error) => return error,
    };

    umask(Mode::from_bits_truncate(CONTAINER_UMASK));
    debug!(command = ?path, "exec");

    match execve(&path, &request.args, &request.envp()) {
        Ok(never) => match never {},
        Err(source) => LaunchError::Exec {
            command: request.command().to_string(),
            source,
        },
    }
}

/// A command containing `/` is used as given; anything else is searched on the request's `PATH`.
fn resolve_command(request: &LaunchRequest) -> Result<CString> {
    let command = request.command();
    if command.contains('/') {
        return Ok(request.command.clone());
    }

    let search = request.env_var("PATH").unwrap_or(DEFAULT_PATH);
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| PathBuf::from(dir).join(command))
        .find(|candidate| candidate.is_file() && access(candidate, AccessFlags::X_OK).is_ok())
        .and_then(|candidate| CString::new(candidate.as_os_str().as_bytes()).ok())
        .ok_or_else(|| LaunchError::Exec {
            command: command.to_string(),
            source: Errno::ENOENT,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capabilities::Capability, error::IdentityKind, idmap::IdMap, request::StdioFds};
    use std::cell::RefCell;

    #[derive(Debug, Default)]
    struct RecordingHost {
        calls: RefCell<Vec<String>>,
    }

    impl RecordingHost {
        fn record(&self, call: String) -> Result<()> {
            self.calls.borrow_mut().push(call);
            Ok(())
        }
    }

    impl Host for RecordingHost {
        fn dup_std_fds(&self, stdio: StdioFds) -> Result<()> {
            self.record(format!("dup {} {} {}", stdio.stdin, stdio.stdout, stdio.stderr))
        }

        fn close_all_other_fds(&self) -> Result<()> {
            self.record("close".to_string())
        }

        fn join_cgroups(&self, tasks_files: &[PathBuf]) -> Result<()> {
            self.record(format!("cgroups {}", tasks_files.len()))
        }

        fn join_namespace(&self, path: &Path) -> Result<()> {
            self.record(format!("setns {}", path.display()))
        }

        fn uid_for_user(&self, name: &str) -> Result<Uid> {
            Err(LaunchError::Lookup {
                kind: IdentityKind::User,
                name: name.to_string(),
            })
        }

        fn gid_for_group(&self, name: &str) -> Result<Gid> {
            Err(LaunchError::Lookup {
                kind: IdentityKind::Group,
                name: name.to_string(),
            })
        }

        fn drop_bounding_capabilities(&self, _target: &CapabilityState) -> Result<()> {
            self.record("drop bounding".to_string())
        }

        fn write_map(&self, pid: Pid, kind: MapKind, map: &IdMap) -> Result<()> {
            self.record(format!("map {pid} {kind:?} {map}"))
        }
    }

    fn join(kind: NamespaceKind) -> NamespaceSetting {
        NamespaceSetting::Join(PathBuf::from(format!("/proc/1/ns/{kind}")))
    }

    #[test]
    fn test_minimal_request_plans_no_helper_and_no_unshare() {
        let request = LaunchRequest::builder("/bin/true").build().unwrap();

        assert_eq!(
            Step::plan(&request),
            vec![
                Step::ConfigureStdio,
                Step::CloseDescriptors,
                Step::ResetIdentity
            ]
        );
        assert_eq!(
            ContainerStep::plan(&request),
            vec![
                ContainerStep::RetainCapabilities,
                ContainerStep::DropBoundingCapabilities,
                ContainerStep::StopRetainingCapabilities,
                ContainerStep::ApplyCapabilities,
            ]
        );
    }

    #[test]
    fn test_full_plan_order() {
        let request = LaunchRequest::builder("/bin/sh")
            .namespace(NamespaceKind::User, NamespaceSetting::Create)
            .namespace(NamespaceKind::Mount, NamespaceSetting::Create)
            .namespace(NamespaceKind::Network, join(NamespaceKind::Network))
            .uid_map("0 1000 1")
            .max_processes(64)
            .cgroup("/sys/fs/cgroup/cpu/c1/tasks")
            .root("/srv/rootfs")
            .pivot(true)
            .mount_proc(true)
            .user("nobody")
            .group("nogroup")
            .detach(true)
            .build()
            .unwrap();

        assert_eq!(
            Step::plan(&request),
            vec![
                Step::SpawnMapHelper,
                Step::ConfigureStdio,
                Step::CloseDescriptors,
                Step::JoinCgroups,
                Step::JoinNamespace(NamespaceKind::Network),
                Step::SetResourceLimits,
                Step::ResetIdentity,
                Step::Unshare,
                Step::MapRendezvous,
                Step::PrivatizeMounts,
                Step::BuildRoot,
                Step::OpenReadiness,
            ]
        );
        assert_eq!(
            ContainerStep::plan(&request),
            vec![
                ContainerStep::MountProc,
                ContainerStep::EnterRoot,
                ContainerStep::RetainCapabilities,
                ContainerStep::DropBoundingCapabilities,
                ContainerStep::SwitchGroup,
                ContainerStep::SwitchUser,
                ContainerStep::StopRetainingCapabilities,
                ContainerStep::ApplyCapabilities,
                ContainerStep::SignalReady,
            ]
        );
    }

    #[test]
    fn test_namespace_joins_follow_fixed_order() {
        let request = LaunchRequest::builder("/bin/true")
            .namespace(NamespaceKind::Mount, join(NamespaceKind::Mount))
            .namespace(NamespaceKind::Pid, join(NamespaceKind::Pid))
            .namespace(NamespaceKind::Ipc, join(NamespaceKind::Ipc))
            .namespace(NamespaceKind::User, join(NamespaceKind::User))
            .build()
            .unwrap();

        let launcher = Launcher::new(RecordingHost::default());
        let mut state = LaunchState::new(CallerIdentity::capture().unwrap());
        for step in Step::plan(&request) {
            if matches!(step, Step::JoinNamespace(_) | Step::ConfigureStdio) {
                launcher.apply_step(step, &request, &mut state).unwrap();
            }
        }

        assert_eq!(
            *launcher.host.calls.borrow(),
            vec![
                "dup 0 1 2",
                "setns /proc/1/ns/user",
                "setns /proc/1/ns/ipc",
                "setns /proc/1/ns/pid",
                "setns /proc/1/ns/mnt",
            ]
        );
    }

    #[test]
    fn test_rendezvous_without_helper_fails() {
        let request = LaunchRequest::builder("/bin/true").build().unwrap();
        let launcher = Launcher::new(RecordingHost::default());
        let mut state = LaunchState::new(CallerIdentity::capture().unwrap());

        let error = launcher
            .apply_step(Step::MapRendezvous, &request, &mut state)
            .unwrap_err();
        assert!(matches!(error, LaunchError::Helper(_)));
    }

    #[test]
    fn test_group_lookup_failure_is_reported_as_lookup() {
        let request = LaunchRequest::builder("/bin/true")
            .group("missing")
            .build()
            .unwrap();
        let launcher = Launcher::new(RecordingHost::default());
        let mut container = ContainerState {
            root: None,
            console: None,
            capabilities: CapabilityState::default(),
            readiness: None,
        };

        let error = launcher
            .apply_container_step(ContainerStep::SwitchGroup, &request, &mut container)
            .unwrap_err();
        assert_eq!(error.class(), "lookup");
    }

    #[test]
    fn test_command_resolution() {
        let absolute = LaunchRequest::builder("/bin/sh").build().unwrap();
        assert_eq!(resolve_command(&absolute).unwrap().to_str().unwrap(), "/bin/sh");

        let searched = LaunchRequest::builder("sh")
            .env("PATH", "/nonexistent/spawner:/bin")
            .build()
            .unwrap();
        assert_eq!(resolve_command(&searched).unwrap().to_str().unwrap(), "/bin/sh");

        let default_path = LaunchRequest::builder("sh").build().unwrap();
        assert_eq!(
            resolve_command(&default_path).unwrap().to_str().unwrap(),
            "/bin/sh"
        );

        let missing = LaunchRequest::builder("no-such-command-for-spawner")
            .build()
            .unwrap();
        assert_eq!(
            resolve_command(&missing).unwrap_err().errno(),
            Some(Errno::ENOENT)
        );
    }

    /// Launch changes the calling process, so every end-to-end launch runs in a fork.
    fn launch_in_child(request: LaunchRequest) -> ExitStatus {
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => wait_for_exit(child).unwrap(),
            ForkResult::Child => {
                let code = match launch(request) {
                    Ok(LaunchOutcome::Exited(status)) => status.exit_code(),
                    Ok(LaunchOutcome::Detached { .. }) => 100,
                    Err(LaunchError::ChildReported(_)) => 101,
                    Err(_) => 102,
                };
                unsafe { libc::_exit(code) }
            }
        }
    }

    fn running_as_root() -> bool {
        if !geteuid().is_root() {
            eprintln!("skipping: launching needs root");
            return false;
        }
        true
    }

    #[test]
    fn test_launch_passes_exit_codes_through() {
        if !running_as_root() {
            return;
        }

        let ok = LaunchRequest::builder("/bin/true").build().unwrap();
        assert_eq!(launch_in_child(ok), ExitStatus::Code(0));

        let failing = LaunchRequest::builder("/bin/false").build().unwrap();
        assert_eq!(launch_in_child(failing), ExitStatus::Code(1));
    }

    #[test]
    fn test_launch_reports_signal_death() {
        if !running_as_root() {
            return;
        }

        let request = LaunchRequest::builder("/bin/sh")
            .args(["-c", "kill -TERM $$"])
            .build()
            .unwrap();
        assert_eq!(
            launch_in_child(request),
            ExitStatus::Code(128 + libc::SIGTERM)
        );
    }

    #[test]
    fn test_launch_environment_is_exactly_the_configured_one() {
        if !running_as_root() {
            return;
        }

        let request = LaunchRequest::builder("/bin/sh")
            .args(["-c", r#"test "$ONLY" = set && test -z "$HOME""#])
            .env("ONLY", "set")
            .build()
            .unwrap();
        assert_eq!(launch_in_child(request), ExitStatus::Code(0));
    }

    #[test]
    fn test_detach_returns_after_readiness() {
        if !running_as_root() {
            return;
        }

        let request = LaunchRequest::builder("/bin/true")
            .detach(true)
            .build()
            .unwrap();
        assert_eq!(launch_in_child(request), ExitStatus::Code(100));
    }

    #[test]
    fn test_detach_reports_child_failure() {
        if !running_as_root() {
            return;
        }

        let request = LaunchRequest::builder("/bin/true")
            .user("no-such-user-for-spawner")
            .detach(true)
            .build()
            .unwrap();
        assert_eq!(launch_in_child(request), ExitStatus::Code(101));
    }

    #[test]
    #[ignore = "needs CAP_SYS_ADMIN"]
    fn test_new_pid_namespace_runs_program_as_pid_one() {
        let request = LaunchRequest::builder("/bin/sh")
            .args(["-c", "test $$ -eq 1"])
            .namespace(NamespaceKind::Pid, NamespaceSetting::Create)
            .build()
            .unwrap();
        assert_eq!(launch_in_child(request), ExitStatus::Code(0));
    }

    #[test]
    fn test_user_namespace_maps_caller_to_root() {
        if !running_as_root() {
            return;
        }

        let request = LaunchRequest::builder("/bin/sh")
            .args([
                "-c",
                r#"read inside outside count < /proc/self/uid_map &&
                   test "$inside $outside $count" = "0 1000 1" &&
                   read inside outside count < /proc/self/gid_map &&
                   test "$inside $outside $count" = "0 1000 1" &&
                   test "$(id -u)" = 0"#,
            ])
            .env("PATH", "/usr/bin:/bin")
            .namespace(NamespaceKind::User, NamespaceSetting::Create)
            .uid_map("0 1000 1")
            .gid_map("0 1000 1")
            .build()
            .unwrap();
        assert_eq!(launch_in_child(request), ExitStatus::Code(0));
    }

    /// A hex capability mask from this process's `/proc/self/status`.
    fn status_mask(field: &str) -> u64 {
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        let value = status
            .lines()
            .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
            .unwrap();
        u64::from_str_radix(value.trim(), 16).unwrap()
    }

    fn expect_masks(inheritable: u64, bounding: u64) -> String {
        format!(
            r#"grep -q "^CapInh:[[:space:]]*{inheritable:016x}$" /proc/self/status &&
               grep -q "^CapBnd:[[:space:]]*{bounding:016x}$" /proc/self/status"#
        )
    }

    #[test]
    fn test_explicit_capabilities_are_applied() {
        if !running_as_root() {
            return;
        }

        let chown = 1 << Capability::CAP_CHOWN.index();
        let kill = 1 << Capability::CAP_KILL.index();
        let request = LaunchRequest::builder("/bin/sh")
            .args(["-c", expect_masks(chown, chown | kill).as_str()])
            .env("PATH", "/usr/bin:/bin")
            .capabilities("cap_chown=eip cap_kill=p")
            .build()
            .unwrap();
        assert_eq!(launch_in_child(request), ExitStatus::Code(0));
    }

    #[test]
    fn test_omitted_capabilities_keep_the_callers_sets() {
        if !running_as_root() {
            return;
        }

        let inheritable = status_mask("CapInh");
        let bounding = status_mask("CapBnd") & status_mask("CapPrm");
        let request = LaunchRequest::builder("/bin/sh")
            .args(["-c", expect_masks(inheritable, bounding).as_str()])
            .env("PATH", "/usr/bin:/bin")
            .build()
            .unwrap();
        assert_eq!(launch_in_child(request), ExitStatus::Code(0));
    }
}
