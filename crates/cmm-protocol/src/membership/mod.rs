//! Membership building blocks, each a pure state machine over an injected
//! clock. The runtime state composes them.

pub mod config_store;
pub mod dedup;
pub mod election;
pub mod heartbeat;
pub mod retransmit;

pub use config_store::{CommitOutcome, ConfigEntries, ConfigStore, StageOutcome};
pub use dedup::{DedupCache, DedupCheck, DEDUP_CAPACITY};
pub use election::{elect, Candidate, ElectionReason, ElectionResult, ElectionRound};
pub use heartbeat::{HeartbeatTracker, LivenessEvent, LivenessState};
pub use retransmit::{Outstanding, RetransmitQueue, Sweep};
