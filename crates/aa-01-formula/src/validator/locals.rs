//! Local variable assignment tracking.
//!
//! A local is assigned at most once on any execution path. Inside an `if`
//! branch an assignment is only *maybe* visible after the join point:
//! a variable assigned in one branch of an earlier `if` may be assigned again
//! in a later branch, but never unconditionally.

use super::Complexity;
use crate::errors::ValidationError;
use std::collections::BTreeMap;

/// Assignment state of a known local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarState {
    /// Assigned on some but not all paths.
    MaybeAssigned,
    /// Assigned on every path.
    Assigned,
    /// Assigned and immutable.
    Frozen,
}

/// What a local holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// A value.
    Data,
    /// A function with its static cost and declared argument count.
    Func { complexity: Complexity, arity: usize },
}

/// A known local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalInfo {
    /// Assignment state.
    pub state: VarState,
    /// Contents.
    pub kind: VarKind,
}

/// The locals visible at one point of a formula.
#[derive(Debug, Clone, Default)]
pub struct Locals {
    vars: BTreeMap<String, LocalInfo>,
    branch_depth: u32,
}

impl Locals {
    /// Looks up a local that must exist.
    pub fn read(&self, name: &str) -> Result<LocalInfo, ValidationError> {
        self.vars
            .get(name)
            .copied()
            .ok_or_else(|| ValidationError::Uninitialized(name.to_string()))
    }

    /// Looks up a local that exists on every path, as a call target must.
    pub fn callable(&self, name: &str) -> Result<LocalInfo, ValidationError> {
        let info = self.read(name)?;
        if info.state == VarState::MaybeAssigned {
            return Err(ValidationError::Uninitialized(name.to_string()));
        }
        Ok(info)
    }

    /// Records a whole-variable assignment.
    pub fn assign(&mut self, name: &str, kind: VarKind) -> Result<(), ValidationError> {
        if let Some(info) = self.vars.get(name) {
            match info.state {
                VarState::Frozen => return Err(ValidationError::Frozen(name.to_string())),
                VarState::Assigned => return Err(ValidationError::Reassignment(name.to_string())),
                VarState::MaybeAssigned if self.branch_depth == 0 => {
                    return Err(ValidationError::Reassignment(name.to_string()))
                }
                VarState::MaybeAssigned => {}
            }
            if matches!(info.kind, VarKind::Func { .. }) || matches!(kind, VarKind::Func { .. }) {
                return Err(ValidationError::Reassignment(name.to_string()));
            }
        }
        let state = match kind {
            VarKind::Func { .. } => VarState::Frozen,
            VarKind::Data => VarState::Assigned,
        };
        self.vars.insert(name.to_string(), LocalInfo { state, kind });
        Ok(())
    }

    /// Checks that a local may be mutated in place (selector assignment, `delete`).
    pub fn check_mutable(&self, name: &str) -> Result<(), ValidationError> {
        let info = self.read(name)?;
        match (info.state, info.kind) {
            (_, VarKind::Func { .. }) => Err(ValidationError::IsAFunction(name.to_string())),
            (VarState::Frozen, _) => Err(ValidationError::Frozen(name.to_string())),
            _ => Ok(()),
        }
    }

    /// Freezes a data local.
    pub fn freeze(&mut self, name: &str) -> Result<(), ValidationError> {
        let info = self.read(name)?;
        if let VarKind::Func { .. } = info.kind {
            return Err(ValidationError::IsAFunction(name.to_string()));
        }
        self.vars.insert(name.to_string(), LocalInfo { state: VarState::Frozen, ..info });
        Ok(())
    }

    /// Enters a conditional branch.
    pub fn enter_branch(&mut self) {
        self.branch_depth += 1;
    }

    /// Joins the outcomes of alternative branches that all started from `before`.
    #[must_use]
    pub fn join(before: &Locals, branches: Vec<Locals>) -> Locals {
        let n = branches.len();
        // name -> (branches that definitely assigned it, any branch froze it, info)
        let mut changed: BTreeMap<String, (usize, bool, LocalInfo)> = BTreeMap::new();
        for branch in &branches {
            for (name, info) in &branch.vars {
                if before.vars.get(name) == Some(info) {
                    continue;
                }
                let entry = changed.entry(name.clone()).or_insert((0, false, *info));
                if info.state != VarState::MaybeAssigned {
                    entry.0 += 1;
                }
                entry.1 |= info.state == VarState::Frozen;
            }
        }

        let mut joined = before.clone();
        for (name, (definite, frozen, mut info)) in changed {
            let was_assigned = before
                .vars
                .get(&name)
                .is_some_and(|b| b.state != VarState::MaybeAssigned);
            let partial_function = matches!(info.kind, VarKind::Func { .. }) && !was_assigned && definite < n;
            info.state = if partial_function {
                VarState::MaybeAssigned
            } else if frozen {
                VarState::Frozen
            } else if was_assigned || definite == n {
                VarState::Assigned
            } else {
                VarState::MaybeAssigned
            };
            joined.vars.insert(name, info);
        }
        joined
    }

    /// Scope of a function body: everything assigned so far becomes read-only,
    /// arguments are fresh locals.
    pub fn for_function(&self, args: &[String]) -> Result<Locals, ValidationError> {
        let mut vars: BTreeMap<String, LocalInfo> = self
            .vars
            .iter()
            .filter(|(_, info)| info.state != VarState::MaybeAssigned)
            .map(|(name, info)| (name.clone(), LocalInfo { state: VarState::Frozen, ..*info }))
            .collect();
        for arg in args {
            let shadows = self.vars.contains_key(arg);
            if shadows
                || vars
                    .insert(arg.clone(), LocalInfo { state: VarState::Assigned, kind: VarKind::Data })
                    .is_some()
            {
                return Err(ValidationError::Reassignment(arg.clone()));
            }
        }
        Ok(Locals { vars, branch_depth: 0 })
    }

    /// Functions currently in scope.
    pub fn functions(&self) -> impl Iterator<Item = (&String, Complexity)> {
        self.vars.iter().filter_map(|(name, info)| match info.kind {
            VarKind::Func { complexity, .. } => Some((name, complexity)),
            VarKind::Data => None,
        })
    }
}
