//! Restart groups
//!
//! One group per written step holds the driver's clock, every field's state
//! and the mesh-tying active set. Groups are serialised as JSON; a restart
//! is only accepted if every field's dof row map fingerprint is unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SstiError, SstiResult};
use crate::fem::{RowMap, Subproblem};

/// Persisted state of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRestart {
    pub kind: Subproblem,
    pub dofrowmap_fingerprint: u64,
    pub step: usize,
    pub time: f64,
    pub u_n: Vec<f64>,
    /// Previous state for multi-step integrators
    #[serde(default)]
    pub u_nm1: Option<Vec<f64>>,
    #[serde(default)]
    pub velocity: Option<Vec<f64>>,
    #[serde(default)]
    pub acceleration: Option<Vec<f64>>,
    /// Internal variables (prestretch, active sets, multipliers, ...)
    #[serde(default)]
    pub history: BTreeMap<String, Vec<f64>>,
}

impl FieldRestart {
    pub fn new(kind: Subproblem, map: &RowMap, step: usize, time: f64, u_n: Vec<f64>) -> Self {
        Self {
            kind,
            dofrowmap_fingerprint: map.fingerprint(),
            step,
            time,
            u_n,
            u_nm1: None,
            velocity: None,
            acceleration: None,
            history: BTreeMap::new(),
        }
    }

    /// Reject data written for a different field or dof layout
    pub fn check_compatible(&self, kind: Subproblem, map: &RowMap) -> SstiResult<()> {
        if self.kind != kind {
            return Err(SstiError::Restart(format!(
                "restart data of field '{}' handed to field '{}'",
                self.kind, kind
            )));
        }
        let fingerprint = map.fingerprint();
        if self.dofrowmap_fingerprint != fingerprint {
            return Err(SstiError::Restart(format!(
                "dof row map of field '{}' changed (fingerprint {:#018x} in restart, {:#018x} now)",
                kind, self.dofrowmap_fingerprint, fingerprint
            )));
        }
        if self.u_n.len() != map.len() {
            return Err(SstiError::Restart(format!(
                "state of field '{}' has {} entries, dof row map {}",
                kind,
                self.u_n.len(),
                map.len()
            )));
        }
        Ok(())
    }
}

/// Restart data of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartGroup {
    pub step: usize,
    pub time: f64,
    pub dt_previous: f64,
    /// Structure, scatra, thermo
    pub fields: Vec<FieldRestart>,
    /// (slave node gid, active) of the mesh-tying interface
    #[serde(default)]
    pub meshtying_active: Vec<(usize, bool)>,
}

impl RestartGroup {
    pub fn field(&self, kind: Subproblem) -> SstiResult<&FieldRestart> {
        self.fields
            .iter()
            .find(|f| f.kind == kind)
            .ok_or_else(|| SstiError::Restart(format!("restart group of step {} lacks field '{}'", self.step, kind)))
    }
}

/// All restart groups of a run, keyed by step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartArchive {
    groups: BTreeMap<usize, RestartGroup>,
}

impl RestartArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the group of `group.step`
    pub fn insert(&mut self, group: RestartGroup) {
        self.groups.insert(group.step, group);
    }

    pub fn get(&self, step: usize) -> SstiResult<&RestartGroup> {
        self.groups
            .get(&step)
            .ok_or_else(|| SstiError::Restart(format!("no restart data for step {}", step)))
    }

    pub fn latest(&self) -> Option<&RestartGroup> {
        self.groups.values().next_back()
    }

    pub fn steps(&self) -> Vec<usize> {
        self.groups.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn to_json(&self) -> SstiResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SstiError::Parse(format!("failed to serialise restart data: {}", e)))
    }

    pub fn from_json(json: &str) -> SstiResult<Self> {
        serde_json::from_str(json).map_err(|e| SstiError::Restart(format!("failed to parse restart data: {}", e)))
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> SstiResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> SstiResult<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(step: usize) -> RestartGroup {
        let map = RowMap::contiguous(0, 3);
        let mut structure = FieldRestart::new(Subproblem::Structure, &map, step, 0.5, vec![0.0, 1e-3, 2e-3]);
        structure.velocity = Some(vec![0.0; 3]);
        structure.history.insert("prestretch".into(), vec![1.0, 1.0]);
        RestartGroup {
            step,
            time: 0.5,
            dt_previous: 0.1,
            fields: vec![structure],
            meshtying_active: vec![(6, true)],
        }
    }

    #[test]
    fn test_json_preserves_groups() {
        let mut archive = RestartArchive::new();
        archive.insert(group(5));
        archive.insert(group(10));

        let restored = RestartArchive::from_json(&archive.to_json().unwrap()).unwrap();
        assert_eq!(restored, archive);
        assert_eq!(restored.steps(), vec![5, 10]);
        assert_eq!(restored.latest().unwrap().step, 10);
    }

    #[test]
    fn test_fingerprint_mismatch_is_rejected() {
        let g = group(5);
        let data = g.field(Subproblem::Structure).unwrap();
        assert!(data.check_compatible(Subproblem::Structure, &RowMap::contiguous(0, 3)).is_ok());

        let err = data
            .check_compatible(Subproblem::Structure, &RowMap::new(vec![0, 2, 1]).unwrap())
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(data.check_compatible(Subproblem::Thermo, &RowMap::contiguous(0, 3)).is_err());
    }

    #[test]
    fn test_missing_step_and_field() {
        let archive = RestartArchive::new();
        assert!(archive.get(3).is_err());
        assert!(group(1).field(Subproblem::Thermo).is_err());
    }
}
