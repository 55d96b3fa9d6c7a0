//! Cluster watchers.

mod nodes;

pub use nodes::{LiveWorkers, NodeWatcher};
