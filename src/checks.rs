use crate::namespace::{NamespaceKind, NamespacePlan};
use std::path::Path;

pub fn is_namespace_supported(kind: NamespaceKind) -> bool {
    Path::new(&format!("/proc/self/ns/{}", kind.proc_name())).exists()
}

/// First namespace kind the plan asks to create that this kernel does not provide.
pub(crate) fn unsupported_namespace(plan: &NamespacePlan) -> Option<NamespaceKind> {
    plan.created().find(|kind| !is_namespace_supported(*kind))
}
