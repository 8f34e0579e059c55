//! Anchor Core - rules, nuclear blocks, and the focus session engine.
//!
//! Everything here is independent of the network and the filesystem: the
//! proxy feeds requests in, the server feeds config in, and the storage crate
//! persists what comes out.

pub mod domain;
pub mod lists;
pub mod nuclear;
pub mod rule_engine;
pub mod schedule;
pub mod session;

pub use lists::{BlockingMode, ProductiveMode, UnifiedList};
pub use nuclear::{NuclearBlockStore, NuclearError, NuclearSiteEntry, NuclearStage};
pub use rule_engine::{evaluate, evaluate_target, BlockingState, Decision, RuleAction, VisitSink};
pub use session::{SessionConfig, SessionEngine, SessionError, SessionEvent, SessionStatus};
