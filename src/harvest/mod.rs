//! Story harvester
//! Follows the primary account's follow list, pulls every new post and story
//! and mirrors the media into a dated directory tree.

pub mod api;
pub mod config_loader;
pub mod download_engine;
pub mod extractor;
pub mod identity;
pub mod logger;
pub mod media;
pub mod orchestration;
pub mod pacing;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod status;
pub mod traverser;
pub mod watermark;

#[cfg(test)]
mod testing;

pub use config_loader::init_config;
pub use logger::init_logger;
pub use orchestration::Orchestrator;
