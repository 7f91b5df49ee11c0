//! Offline-first synchronization
//!
//! The pieces fit together like this: [`SyncCoordinator`] routes every
//! mutation, writing locally first and pushing to a [`RemoteStore`] when the
//! [`ConnectivityMonitor`] says the device is online and signed in. Writes
//! that cannot go out are parked in the durable [`SyncQueue`] and replayed
//! in order later. Concurrent edits of the same record are settled by the
//! last-write-wins rules in [`resolver`].

pub mod connectivity;
pub mod coordinator;
pub mod queue;
pub mod remote;
pub mod resolver;

pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use coordinator::{Direction, Mutation, ReplayPolicy, ReplayReport, SyncCoordinator};
pub use queue::{Operation, QueueEntry, SyncQueue};
pub use remote::{HttpRemoteStore, RemoteError, RemoteResult, RemoteStore};
pub use resolver::ImportStrategy;
