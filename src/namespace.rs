use nix::sched::CloneFlags;
use std::{fmt, path::PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    User,
    Ipc,
    Uts,
    Network,
    Pid,
    Mount,
}

impl NamespaceKind {
    /// Order in which existing namespaces are joined. Mount must stay last: the earlier joins
    /// resolve through the current `/proc`.
    pub const JOIN_ORDER: [NamespaceKind; 6] = [
        NamespaceKind::User,
        NamespaceKind::Ipc,
        NamespaceKind::Uts,
        NamespaceKind::Network,
        NamespaceKind::Pid,
        NamespaceKind::Mount,
    ];

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
            NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceKind::Network => CloneFlags::CLONE_NEWNET,
            NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
        }
    }

    /// Name of the entry under `/proc/<pid>/ns`.
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceKind::User => "user",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Network => "net",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Mount => "mnt",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// What to do with one namespace kind. Creating and joining the same kind cannot be expressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NamespaceSetting {
    #[default]
    Inherit,
    Create,
    Join(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespacePlan {
    user: NamespaceSetting,
    ipc: NamespaceSetting,
    uts: NamespaceSetting,
    network: NamespaceSetting,
    pid: NamespaceSetting,
    mount: NamespaceSetting,
}

impl NamespacePlan {
    pub fn get(&self, kind: NamespaceKind) -> &NamespaceSetting {
        match kind {
            NamespaceKind::User => &self.user,
            NamespaceKind::Ipc => &self.ipc,
            NamespaceKind::Uts => &self.uts,
            NamespaceKind::Network => &self.network,
            NamespaceKind::Pid => &self.pid,
            NamespaceKind::Mount => &self.mount,
        }
    }

    pub fn set(&mut self, kind: NamespaceKind, setting: NamespaceSetting) {
        let slot = match kind {
            NamespaceKind::User => &mut self.user,
            NamespaceKind::Ipc => &mut self.ipc,
            NamespaceKind::Uts => &mut self.uts,
            NamespaceKind::Network => &mut self.network,
            NamespaceKind::Pid => &mut self.pid,
            NamespaceKind::Mount => &mut self.mount,
        };
        *slot = setting;
    }

    pub fn creates(&self, kind: NamespaceKind) -> bool {
        matches!(self.get(kind), NamespaceSetting::Create)
    }

    /// Existing namespaces to join, always in [`NamespaceKind::JOIN_ORDER`].
    pub fn joins(&self) -> impl Iterator<Item = (NamespaceKind, &PathBuf)> {
        NamespaceKind::JOIN_ORDER
            .into_iter()
            .filter_map(|kind| match self.get(kind) {
                NamespaceSetting::Join(path) => Some((kind, path)),
                _ => None,
            })
    }

    pub fn created(&self) -> impl Iterator<Item = NamespaceKind> + '_ {
        NamespaceKind::JOIN_ORDER
            .into_iter()
            .filter(|kind| self.creates(*kind))
    }

    /// Flags passed to `unshare(2)` for the namespaces that should be created.
    pub fn clone_flags(&self) -> CloneFlags {
        self.created()
            .fold(CloneFlags::empty(), |flags, kind| flags | kind.clone_flag())
    }
}
