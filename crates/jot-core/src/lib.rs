//! jot-core - Engine for jot
//!
//! This crate contains the models, local SQLite store, ordering logic and
//! offline-first sync engine used by every jot frontend. Frontends drive it
//! through [`StateManager`] and observe changes through its watch channel;
//! nothing in here depends on a UI framework.

pub mod db;
pub mod error;
pub mod models;
pub mod order;
pub mod state;
pub mod sync;
pub mod transfer;
pub mod util;

pub use error::{Error, Result};
pub use models::{Collection, Entity, EntityId, Note, Settings, Todo};
pub use state::{Snapshot, StateManager};
pub use sync::{ConnectivityMonitor, SyncCoordinator};
