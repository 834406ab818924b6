//! Pod controllers
//!
//! - `network_annotator`: table id assignment and publication
//! - `release_watcher`: frees ids of deleted pods

pub mod network_annotator;
pub mod release_watcher;
