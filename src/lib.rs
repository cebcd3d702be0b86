//! Download queue for a Libgen-style book client.
//!
//! A [`manager::DownloadManager`] owns a list of [`task::DownloadTask`]s and
//! a background worker that runs them one at a time, oldest first. Tasks
//! can be paused, resumed and removed while the worker runs; every change is
//! published to subscribers.

pub mod config;
pub mod manager;
pub mod mirror;
pub mod models;
pub mod store;
pub mod task;
pub mod throttle;
pub mod transport;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::ManagerConfig;
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::mirror::{mirror_label, FirstMirror, MirrorSelector, PreferredHost};
    pub use crate::models::{BookDetails, BookItem, TaskEvent, TaskId, TaskSnapshot, TaskState};
    pub use crate::store::TaskStore;
    pub use crate::task::DownloadTask;
    pub use crate::transport::{HttpTransport, Transport};
}
