use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::stage::JobId;

/// How a [`DependencySet`] gates the job it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// Every member must finish successfully first.
    AllMustSucceed,
    /// Do not start while a job sharing this job's name is active.
    Singleton,
}

impl DependencyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyMode::AllMustSucceed => "all_must_succeed",
            DependencyMode::Singleton => "singleton",
        }
    }
}

/// Append-only set of job identifiers gating the next stage.
///
/// Members are kept ordered so that rendering does not depend on the order in
/// which identifiers were added or sets were combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySet {
    mode: DependencyMode,
    members: BTreeSet<JobId>,
}

impl DependencySet {
    pub fn new(mode: DependencyMode) -> Self {
        Self {
            mode,
            members: BTreeSet::new(),
        }
    }

    /// Empty `all_must_succeed` set: the job may start immediately.
    pub fn none() -> Self {
        Self::new(DependencyMode::AllMustSucceed)
    }

    pub fn singleton() -> Self {
        Self::new(DependencyMode::Singleton)
    }

    pub fn after_ok<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = JobId>,
    {
        let mut set = Self::none();
        for id in ids {
            set.add(id);
        }
        set
    }

    pub fn mode(&self) -> DependencyMode {
        self.mode
    }

    /// Inserting an identifier already present is a no-op.
    pub fn add(&mut self, id: JobId) {
        self.members.insert(id);
    }

    /// Combines two sets into a new one. Both sides must carry the same mode.
    pub fn union(&self, other: &DependencySet) -> Result<DependencySet> {
        if self.mode != other.mode {
            return Err(PipelineError::InvalidDependencyMode {
                left: self.mode.as_str(),
                right: other.mode.as_str(),
            });
        }
        Ok(DependencySet {
            mode: self.mode,
            members: self.members.union(&other.members).cloned().collect(),
        })
    }

    /// Combines two sets whose modes may differ. The more restrictive mode
    /// wins: `all_must_succeed` over `singleton`, keeping every member.
    pub fn union_dominant(&self, other: &DependencySet) -> DependencySet {
        let mode = if self.mode == other.mode {
            self.mode
        } else {
            DependencyMode::AllMustSucceed
        };
        DependencySet {
            mode,
            members: self.members.union(&other.members).cloned().collect(),
        }
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobId> {
        self.members.iter()
    }

    /// Scheduler dependency string: `""`, `afterok:<id>[:<id>...]` or
    /// `singleton`.
    pub fn render(&self) -> String {
        match self.mode {
            DependencyMode::Singleton => "singleton".to_string(),
            DependencyMode::AllMustSucceed if self.members.is_empty() => String::new(),
            DependencyMode::AllMustSucceed => {
                let ids = self
                    .members
                    .iter()
                    .map(JobId::as_str)
                    .collect::<Vec<_>>()
                    .join(":");
                format!("afterok:{}", ids)
            }
        }
    }
}

impl Default for DependencySet {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.render();
        if rendered.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&rendered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> DependencySet {
        DependencySet::after_ok(raw.iter().map(|s| JobId::from(*s)))
    }

    #[test]
    fn empty_set_renders_as_no_dependency() {
        assert_eq!(DependencySet::none().render(), "");
        assert_eq!(DependencySet::none().to_string(), "none");
    }

    #[test]
    fn add_is_idempotent() {
        let mut once = DependencySet::none();
        once.add(JobId::from("100"));
        let mut twice = once.clone();
        twice.add(JobId::from("100"));
        assert_eq!(once.render(), twice.render());
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn union_is_commutative_and_associative() {
        let a = ids(&["201"]);
        let b = ids(&["202", "301"]);
        let c = ids(&["301", "302"]);

        let ab = a.union(&b).expect("a+b");
        let ba = b.union(&a).expect("b+a");
        assert_eq!(ab.render(), ba.render());

        let left = ab.union(&c).expect("(a+b)+c");
        let right = a.union(&b.union(&c).expect("b+c")).expect("a+(b+c)");
        assert_eq!(left, right);
        assert_eq!(left.render(), "afterok:201:202:301:302");
    }

    #[test]
    fn union_leaves_operands_untouched() {
        let a = ids(&["1"]);
        let b = ids(&["2"]);
        let merged = a.union(&b).expect("union");
        assert_eq!(merged.len(), 2);
        assert_eq!(a.len(), 1);
        assert!(!a.contains(&JobId::from("2")));
    }

    #[test]
    fn singleton_renders_independent_of_members() {
        let mut gate = DependencySet::singleton();
        assert_eq!(gate.render(), "singleton");
        gate.add(JobId::from("42"));
        assert_eq!(gate.render(), "singleton");
    }

    #[test]
    fn mixing_modes_is_rejected() {
        let err = ids(&["1"])
            .union(&DependencySet::singleton())
            .expect_err("mixed modes must fail");
        assert!(matches!(err, PipelineError::InvalidDependencyMode { .. }));
        assert!(err.to_string().contains("singleton"));
    }

    #[test]
    fn dominant_union_prefers_all_must_succeed() {
        let strict = ids(&["401", "402"]);
        let merged = strict.union_dominant(&DependencySet::singleton());
        assert_eq!(merged.mode(), DependencyMode::AllMustSucceed);
        assert_eq!(merged.render(), "afterok:401:402");

        let reversed = DependencySet::singleton().union_dominant(&strict);
        assert_eq!(reversed, merged);

        let both = DependencySet::singleton().union_dominant(&DependencySet::singleton());
        assert_eq!(both.mode(), DependencyMode::Singleton);
        assert_eq!(both.render(), "singleton");
    }
}
