//! Identity of the record a reporter writes to, and the capabilities reporters expose.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ConditionSet;

/// The externally-owned record whose status is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TargetIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl TargetIdentity {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
        }
    }

    /// `namespace/name`, or just `name` when cluster-scoped.
    pub fn key(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, self.name),
            _ => self.name.clone(),
        }
    }

    pub fn group(&self) -> &str {
        self.api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version.split_once('/').map(|(_, v)| v).unwrap_or(&self.api_version)
    }
}

/// Reporter-local key of a source object.
pub trait Keyed {
    fn key(&self) -> String;
}

/// Upcast helper so erased writers can be turned back into their concrete type.
pub trait AsAnyArc: Any + Send + Sync {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> { self }
}

/// Anything that can describe the status it wants written.
pub trait StatusWriter: AsAnyArc {
    /// Metadata about the object the status is written to.
    fn status_target(&self) -> TargetIdentity;
    /// Desired conditions, as of now.
    fn conditions(&self) -> ConditionSet;
}
