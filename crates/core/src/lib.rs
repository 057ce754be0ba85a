//! kstatus core types: the condition model, target identities, and the
//! capabilities reporters and patchers expose to the status queue.

#![forbid(unsafe_code)]

pub mod collection;
pub mod condition;
pub mod patcher;
pub mod target;

pub use collection::{Collection, Event, EventHandler, EventKind, MemCollection};
pub use condition::{Condition, ConditionSet, ConditionStatus};
pub use patcher::{Applier, PatchKind, Patcher};
pub use target::{AsAnyArc, Keyed, StatusWriter, TargetIdentity};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid condition status: {0:?} (expect True, False or Unknown)")]
    InvalidStatus(String),
}

pub mod prelude {
    pub use super::{
        Applier, Collection, Condition, ConditionSet, ConditionStatus, Event, Keyed, MemCollection, PatchKind, Patcher,
        StatusWriter, TargetIdentity,
    };
}
