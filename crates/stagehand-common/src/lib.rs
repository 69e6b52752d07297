//! Shared domain types for the stagehand pipeline.
//!
//! - [`state`]: scope-tagged keys, tombstone-aware deltas and materialized state maps
//! - [`session`]: session identities, session records and event records
//! - [`artifact`]: artifact records and their one-directional status lifecycle

pub mod artifact;
pub mod session;
pub mod state;

pub use artifact::{ArtifactRecord, ArtifactStatus};
pub use session::{EventRecord, NewEvent, SessionKey, SessionRecord};
pub use state::{DeltaOp, ScopedDelta, StateDelta, StateMap, StateScope};
