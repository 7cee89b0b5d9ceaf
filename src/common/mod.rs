//! Common utilities and types shared across minilog

pub mod config;
pub mod error;
pub mod messages;
pub mod types;
pub mod utils;

pub use config::{Config, ReconfirmConfig};
pub use error::{Error, Result};
pub use messages::{Frame, PrepareRequest, PrepareResponse};
pub use types::{Lsn, Progress, ProposalId, ReplicaAddress};
pub use utils::{majority_count, parse_duration, TimeInterval};
