//! `--dry-run` plan rendering (`SPEC_FULL.md` §2): shows the hook
//! ordering and runner shard plan a real run would execute, without
//! actually running anything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tag: String,
    pub steps: Vec<PlannedStep>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<ParallelGroup>,
    #[serde(rename = "generatedAt")]
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub name: String,
    pub status: StepStatus,
    #[serde(rename = "orderIndex")]
    pub order_index: usize,
    #[serde(rename = "parallelGroupId", skip_serializing_if = "Option::is_none")]
    pub parallel_group_id: Option<String>,
    pub reasons: Vec<Reason>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Included,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reason {
    pub kind: ReasonKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Why a hook or runner appears where it does in the plan. Post-hook
/// conditions can't be evaluated ahead of a real run, so a `--dry-run`
/// plan reports `ConditionUnknown` rather than guessing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    HookOrderingConstraint,
    SplitByShard,
    ConditionUnknown,
    Always,
}

impl ReasonKind {
    pub fn short_description(&self) -> &str {
        match self {
            ReasonKind::HookOrderingConstraint => "placed by before/after constraint",
            ReasonKind::SplitByShard => "split_by fan-out shard",
            ReasonKind::ConditionUnknown => "post-hook condition not evaluated in a dry run",
            ReasonKind::Always => "always runs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub id: String,
    #[serde(rename = "stepIds")]
    pub step_ids: Vec<String>,
}

impl Plan {
    pub fn new(tag: String) -> Self {
        Self { tag, steps: Vec::new(), groups: Vec::new(), generated_at: chrono::Utc::now().to_rfc3339() }
    }

    pub fn add_step(&mut self, step: PlannedStep) {
        self.steps.push(step);
    }

    pub fn add_group(&mut self, group: ParallelGroup) {
        self.groups.push(group);
    }
}
