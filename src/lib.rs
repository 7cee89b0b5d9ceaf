//! # minilog
//!
//! Leader reconfirmation for a consensus-replicated append-only log:
//! - Paxos-style prepare round with majority ack aggregation
//! - Candidate-tail election (highest accepted proposal, then longest log)
//! - Rate-limited fetch of the missing suffix from the tail holder
//! - Start-working marker commit before the leader accepts writes
//!
//! ## Architecture
//!
//! ```text
//!            owner poll loop                 transport inbound path
//!                 │ step()                   │ handle_prepare_ack()
//!          ┌──────▼──────────────────────────▼──────┐
//!          │        LogReconfirm (one lock)         │
//!          │  state machine + round state           │
//!          └──┬───────┬───────┬───────┬───────┬─────┘
//!             │       │       │       │       │
//!        Membership  Mode  LogBuffer Authority Transport
//!                                 StartWorking
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Reconfirm a 3-replica group where a follower holds a longer tail
//! minilog-reconfirm simulate --replicas 3 --local-end 1000 --peer-end 1400
//! ```

pub mod common;
pub mod reconfirm;
pub mod sim;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use reconfirm::{LogReconfirm, ReconfirmState, StepOutcome};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
