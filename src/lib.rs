//! Resumable, idempotent stage pipeline over a mergeable JSON catalog.
//!
//! The catalog maps a stable resource key (a photo's absolute path) to a
//! record of sections, one per stage. The runner applies declared stages in
//! order, committing and flushing after every entry, so a crash or a stop
//! request loses at most the entry in flight and the next run resumes.
pub mod archive;
pub mod bodies;
pub mod cancel;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod document;
pub mod history;
pub mod paths;
pub mod runner;
pub mod stage;
pub mod status;
pub mod util;
pub mod workflow;
