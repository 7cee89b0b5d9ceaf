//! Leader reconfirmation for a replicated log stream
//!
//! Before a new leader accepts writes it must:
//! - Learn, from a majority, the highest accepted proposal and longest log
//! - Fetch any suffix it is missing from the replica holding that tail
//! - Commit a start-working marker under its own proposal id
//! - Wait until everything up to the marker has slid out downstream

pub mod collaborators;
pub mod coordinator;
pub mod driver;
pub mod fetch;
pub mod prepare;
pub mod state;

pub use collaborators::{
    AuthorityProvider, Collaborators, CollaboratorsBuilder, DeliveryStatus, FlushedInfo,
    LogBuffer, MembershipProvider, ModeCoordinator, PrepareTransport, StartWorkingAppender,
};
pub use coordinator::{LogReconfirm, ReconfirmStatus, StepOutcome};
pub use driver::{drive_until_converged, spawn_driver};
pub use prepare::AckOutcome;
pub use state::{CandidateTail, ReconfirmState};
