use crate::error::{LaunchError, Result};
use caps::CapsHashSet;
use std::{collections::HashSet, fmt, str::FromStr};
use tracing::debug;

pub use caps::{CapSet, Capability};

/// The three per-process capability sets the launcher restores after switching identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityState {
    pub effective: CapsHashSet,
    pub permitted: CapsHashSet,
    pub inheritable: CapsHashSet,
}

impl CapabilityState {
    /// Read the calling process's capability sets.
    pub fn current() -> Result<Self> {
        Ok(Self {
            effective: CapabilityManager::read_capability_set(CapSet::Effective)?,
            permitted: CapabilityManager::read_capability_set(CapSet::Permitted)?,
            inheritable: CapabilityManager::read_capability_set(CapSet::Inheritable)?,
        })
    }

    /// Resolve an optional textual specification, defaulting to the current sets.
    pub fn resolve(text: Option<&CapabilityText>) -> Result<Self> {
        match text {
            Some(text) => Ok(text.state().clone()),
            None => Self::current(),
        }
    }

    fn sets_mut(&mut self, flags: Flags) -> impl Iterator<Item = &mut CapsHashSet> {
        [
            (flags.effective, &mut self.effective),
            (flags.permitted, &mut self.permitted),
            (flags.inheritable, &mut self.inheritable),
        ]
        .into_iter()
        .filter_map(|(selected, set)| selected.then_some(set))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    effective: bool,
    permitted: bool,
    inheritable: bool,
}

impl Flags {
    const ALL: Flags = Flags {
        effective: true,
        permitted: true,
        inheritable: true,
    };
}

/// A capability specification in the libcap textual form, e.g. `cap_chown,cap_kill=ep` or
/// `all=eip cap_sys_admin-eip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityText {
    source: String,
    state: CapabilityState,
}

impl CapabilityText {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> &CapabilityState {
        &self.state
    }

    fn parse_names(names: &str) -> Result<Vec<Capability>> {
        if names.is_empty() || names.eq_ignore_ascii_case("all") {
            return Ok(caps::all().into_iter().collect());
        }

        names
            .split(',')
            .map(|name| {
                Capability::from_str(&name.trim().to_ascii_uppercase())
                    .map_err(|_| invalid(format!("unknown capability {name:?}")))
            })
            .collect()
    }

    fn apply_clause(state: &mut CapabilityState, clause: &str) -> Result<()> {
        let Some(split) = clause.find(['=', '+', '-']) else {
            return Err(invalid(format!("capability clause {clause:?} has no operator")));
        };

        let (names, actions) = clause.split_at(split);
        if names.is_empty() && !actions.starts_with('=') {
            return Err(invalid(format!(
                "capability clause {clause:?} needs a capability list"
            )));
        }
        let capabilities = Self::parse_names(names)?;

        let mut chars = actions.chars().peekable();
        while let Some(op) = chars.next() {
            let mut flags = Flags::default();
            while let Some(flag) = chars.next_if(|c| !matches!(*c, '=' | '+' | '-')) {
                match flag {
                    'e' => flags.effective = true,
                    'p' => flags.permitted = true,
                    'i' => flags.inheritable = true,
                    other => {
                        return Err(invalid(format!(
                            "unknown capability flag {other:?} in {clause:?}"
                        )));
                    }
                }
            }

            match op {
                '=' => {
                    for set in state.sets_mut(Flags::ALL) {
                        set.retain(|cap| !capabilities.contains(cap));
                    }
                    for set in state.sets_mut(flags) {
                        set.extend(capabilities.iter().copied());
                    }
                }
                '+' => {
                    for set in state.sets_mut(flags) {
                        set.extend(capabilities.iter().copied());
                    }
                }
                _ => {
                    for set in state.sets_mut(flags) {
                        set.retain(|cap| !capabilities.contains(cap));
                    }
                }
            }
        }

        Ok(())
    }
}

impl FromStr for CapabilityText {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        let mut state = CapabilityState::default();

        for clause in s.split_whitespace() {
            Self::apply_clause(&mut state, clause)?;
        }

        Ok(Self {
            source: s.to_string(),
            state,
        })
    }
}

impl fmt::Display for CapabilityText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Default)]
pub(crate) struct CapabilityManager;

impl CapabilityManager {
    /// Keep (or stop keeping) permitted capabilities across a switch away from uid 0.
    pub fn retain(&self, keep: bool) -> Result<()> {
        caps::securebits::set_keepcaps(keep)
            .map_err(LaunchError::capability("prctl(PR_SET_KEEPCAPS)"))
    }

    /// Drop every bounding capability that the target does not permit.
    pub fn drop_bounding_except(&self, target: &CapabilityState) -> Result<()> {
        let bounding = Self::read_capability_set(CapSet::Bounding)?;

        for capability in bounding {
            if !target.permitted.contains(&capability) {
                self.drop_bounding_capability(capability)?;
            }
        }

        Ok(())
    }

    /// Install the target sets, then read the effective set back.
    pub fn apply(&self, target: &CapabilityState) -> Result<()> {
        // Inheritable needs CAP_SETPCAP still effective to reach outside the permitted set, and
        // effective must stay within permitted until permitted shrinks last.
        self.set_capability_set(CapSet::Inheritable, &target.inheritable)?;
        self.set_capability_set(CapSet::Effective, &target.effective)?;
        self.set_capability_set(CapSet::Permitted, &target.permitted)?;

        self.validate_effective_capabilities(&target.effective)
    }

    pub fn snapshot(&self) -> Result<CapabilitySnapshot> {
        Ok(CapabilitySnapshot {
            effective: Self::read_capability_set(CapSet::Effective)?,
            permitted: Self::read_capability_set(CapSet::Permitted)?,
            inheritable: Self::read_capability_set(CapSet::Inheritable)?,
            bounding: Self::read_capability_set(CapSet::Bounding)?,
            ambient: Self::read_capability_set(CapSet::Ambient)?,
        })
    }

    fn set_capability_set(&self, cap_set: CapSet, capabilities: &CapsHashSet) -> Result<()> {
        caps::set(None, cap_set, capabilities).map_err(LaunchError::capability(match cap_set {
            CapSet::Effective => "setting effective capabilities",
            CapSet::Permitted => "setting permitted capabilities",
            CapSet::Inheritable => "setting inheritable capabilities",
            _ => "setting capabilities",
        }))
    }

    fn read_capability_set(cap_set: CapSet) -> Result<CapsHashSet> {
        caps::read(None, cap_set).map_err(LaunchError::capability("reading capabilities"))
    }

    fn validate_effective_capabilities(&self, expected: &CapsHashSet) -> Result<()> {
        let current = Self::read_capability_set(CapSet::Effective)?;

        if &current != expected {
            let missing: HashSet<_> = expected.difference(&current).collect();
            let extra: HashSet<_> = current.difference(expected).collect();
            return Err(LaunchError::CapabilityMismatch(format!(
                "missing {missing:?}, unexpected {extra:?}"
            )));
        }

        Ok(())
    }

    fn drop_bounding_capability(&self, capability: Capability) -> Result<()> {
        debug!(%capability, "dropping bounding capability");
        caps::drop(None, CapSet::Bounding, capability)
            .map_err(LaunchError::capability("dropping bounding capability"))
    }
}

/// Represents the current state of process capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub effective: CapsHashSet,
    pub permitted: CapsHashSet,
    pub inheritable: CapsHashSet,
    pub bounding: CapsHashSet,
    pub ambient: CapsHashSet,
}

impl fmt::Display for CapabilitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities - ")?;
        write!(f, "Effective: {}, ", self.effective.len())?;
        write!(f, "Permitted: {}, ", self.permitted.len())?;
        write!(f, "Inheritable: {}, ", self.inheritable.len())?;
        write!(f, "Bounding: {}, ", self.bounding.len())?;
        write!(f, "Ambient: {}", self.ambient.len())
    }
}

fn invalid(message: String) -> LaunchError {
    LaunchError::InvalidRequest(message)
}
