//! Assignment of micrographs to beam-tilt groups.
//!
//! Beam tilt is a property of the microscope alignment, shared by every micrograph
//! recorded under the same conditions. How micrographs map to groups depends on how a
//! dataset was collected, so the mapping is injected as a [`MicrographGrouping`].

use crate::core::models::experiment::Experiment;
use crate::core::models::ids::MicrographId;
use std::collections::BTreeMap;

pub trait MicrographGrouping: Send + Sync {
    /// Name of the group `micrograph` belongs to.
    fn group_of(&self, micrograph: &str) -> String;
}

impl<F> MicrographGrouping for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn group_of(&self, micrograph: &str) -> String {
        self(micrograph)
    }
}

/// Every micrograph in one group.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleGroup;

impl SingleGroup {
    pub const NAME: &'static str = "all";
}

impl MicrographGrouping for SingleGroup {
    fn group_of(&self, _micrograph: &str) -> String {
        Self::NAME.to_string()
    }
}

/// Groups micrographs by the directory part of their name.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryGrouping;

impl MicrographGrouping for DirectoryGrouping {
    fn group_of(&self, micrograph: &str) -> String {
        match micrograph.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir.to_string(),
            _ => ".".to_string(),
        }
    }
}

/// Groups micrographs by the first listed dataset name their name contains.
#[derive(Debug, Clone, Default)]
pub struct PrefixGrouping {
    names: Vec<String>,
}

impl PrefixGrouping {
    pub const UNMATCHED: &'static str = "ungrouped";

    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

impl MicrographGrouping for PrefixGrouping {
    fn group_of(&self, micrograph: &str) -> String {
        self.names
            .iter()
            .find(|name| micrograph.contains(name.as_str()))
            .cloned()
            .unwrap_or_else(|| Self::UNMATCHED.to_string())
    }
}

/// Resolved groups of one experiment, ordered by group name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    names: Vec<String>,
    of_micrograph: Vec<usize>,
    members: Vec<Vec<MicrographId>>,
}

impl GroupAssignment {
    pub fn build(experiment: &Experiment, grouping: &dyn MicrographGrouping) -> Self {
        let labels: Vec<String> = experiment.micrographs().iter().map(|m| grouping.group_of(&m.name)).collect();
        let mut by_name: BTreeMap<&str, Vec<MicrographId>> = BTreeMap::new();
        for (mic, label) in experiment.micrographs().iter().zip(&labels) {
            by_name.entry(label.as_str()).or_default().push(mic.id);
        }

        let names: Vec<String> = by_name.keys().map(|s| s.to_string()).collect();
        let mut of_micrograph = vec![0; labels.len()];
        let mut members = Vec::with_capacity(by_name.len());
        for (group, (_, mics)) in by_name.into_iter().enumerate() {
            for mic in &mics {
                of_micrograph[mic.0] = group;
            }
            members.push(mics);
        }
        Self {
            names,
            of_micrograph,
            members,
        }
    }

    pub fn group_count(&self) -> usize {
        self.names.len()
    }

    pub fn group_of(&self, micrograph: MicrographId) -> usize {
        self.of_micrograph[micrograph.0]
    }

    pub fn name(&self, group: usize) -> &str {
        &self.names[group]
    }

    pub fn members(&self, group: usize) -> &[MicrographId] {
        &self.members[group]
    }
}
