//! Library surface for `gridmeshd`, split out from the binary so the
//! orchestrator's registration/connect/download driver can be exercised
//! directly — by the binary's stdin loop, or by tests — without spawning a
//! child process.

pub mod cli;
pub mod keyfile;
pub mod orchestrator;

pub use orchestrator::Orchestrator;
