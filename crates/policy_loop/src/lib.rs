//! Shadow policy loop: evaluate resolved decisions, propose a constrained
//! sibling policy, and check it with replay and audit. The loop never applies
//! a policy; it only reports.

pub mod config_loader;
pub mod pipeline;
pub mod policy_store;
pub mod report_io;

pub use config_loader::{load_config, LoopConfig, OutputConfig};
pub use pipeline::{
    audit, evaluate, propose, resolve_outcome, run_tuning_cycle, verify_replay, Proposal,
    RunChecksums, RunStatus, TuningRunReport,
};
