//! Write side: the status patcher collaborator and what a reporter hands back for a reconciliation pass.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ConditionSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PatchKind {
    /// Server-side apply; the field manager owns exactly the fields in the body.
    #[default]
    Apply,
    /// JSON merge patch.
    Merge,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { PatchKind::Apply => "apply", PatchKind::Merge => "merge" })
    }
}

/// Writes the status subresource of a record.
#[async_trait::async_trait]
pub trait Patcher: Send + Sync {
    async fn apply_status(
        &self,
        name: &str,
        namespace: Option<&str>,
        kind: PatchKind,
        body: &serde_json::Value,
        field_manager: &str,
    ) -> Result<()>;
}

/// Patch handle plus the conditions the reporter currently owns on the live record.
#[derive(Clone)]
pub struct Applier {
    pub patcher: Arc<dyn Patcher>,
    pub persisted: ConditionSet,
}

impl Applier {
    pub fn new(patcher: Arc<dyn Patcher>, persisted: ConditionSet) -> Self { Self { patcher, persisted } }
}

impl fmt::Debug for Applier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Applier").field("persisted", &self.persisted).finish_non_exhaustive()
    }
}
