//! Shared domain types for shipyard.
//!
//! Everything in this crate is plain data: the phase state machine, the lease
//! record persisted in a slot's `.lock` file, the feature plan records, and the
//! structured result envelope every command returns. No I/O happens here.

pub mod lease;
pub mod phase;
pub mod plan;
pub mod result;

pub use lease::{Lease, LeaseParams, PhaseRecord};
pub use phase::{Complexity, Phase, PhaseParseError};
pub use plan::{
    AcceptanceCriterion, CriterionKind, CriterionSpec, Feature, FeaturePlan, FeatureSpec, FeatureStatus,
    PlanSummary, VerificationRecord,
};
pub use result::{CommandResult, ErrorKind, ErrorPayload};
