//! Mutation routing and queue replay
//!
//! Every user-level change flows through [`SyncCoordinator::apply`]: the
//! local store is written first and is the only fatal path, then the change
//! either goes straight to the remote (when online and authenticated) or is
//! parked in the sync queue. Replay drains the queue in first-in order and
//! resolves conflicts with last-write-wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{Collection, ConflictWinner, Entity, EntityId};
use crate::order;
use crate::util;

use super::connectivity::ConnectivityMonitor;
use super::queue::{Operation, QueueEntry, SyncQueue};
use super::remote::{RemoteError, RemoteResult, RemoteStore};
use super::resolver;

/// A user-level change to one record
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Store a brand-new record
    Create(Entity),
    /// Replace an edited record
    Update(Entity),
    /// Remove a record
    Delete(Collection, EntityId),
    /// Move a record above everything else in its collection
    MoveToTop(Collection, EntityId),
    /// Move a record to a position in the rendered list
    Move {
        collection: Collection,
        id: EntityId,
        to_index: usize,
    },
    /// Exchange places with the record rendered next to this one
    SwapWithNeighbor {
        collection: Collection,
        id: EntityId,
        direction: Direction,
    },
}

/// Direction for an adjacent swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Backoff schedule for replay retries after a transient failure
#[derive(Debug, Clone)]
pub struct ReplayPolicy {
    /// Attempts per replay pass before giving up until the next trigger
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReplayPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outcome of one replay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries replayed and removed from the queue
    pub replayed: usize,
    /// Conflicts resolved along the way
    pub conflicts: usize,
    /// Entries still queued when the run ended
    pub remaining: usize,
}

enum PassOutcome {
    Drained,
    TransientFailure,
    /// Stop without retrying; the next trigger restarts replay
    Paused,
}

/// Routes mutations between the local store, the remote store and the queue
pub struct SyncCoordinator {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    queue: SyncQueue,
    monitor: Arc<ConnectivityMonitor>,
    policy: ReplayPolicy,
    /// Serializes mutations; one logical writer per device
    apply_lock: Mutex<()>,
    /// Held for the duration of a replay run
    replay_lock: Mutex<()>,
    /// A trigger during a running replay records exactly one follow-up
    replay_pending: AtomicBool,
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        queue: SyncQueue,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            store,
            remote,
            queue,
            monitor,
            policy: ReplayPolicy::default(),
            apply_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
            replay_pending: AtomicBool::new(false),
        }
    }

    /// Replace the replay backoff schedule
    #[must_use]
    pub fn with_policy(mut self, policy: ReplayPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of queued writes waiting for replay
    pub fn pending_count(&self) -> Result<usize> {
        self.queue.len()
    }

    /// The local store this coordinator writes through
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Apply one mutation
    ///
    /// The local write happens first, synchronously, and its failure is the
    /// only error path out (besides validation). Remote failures are
    /// absorbed into the queue. Returns the record as the caller should now
    /// see it, which is the server's copy when the remote write went
    /// through directly.
    pub async fn apply(&self, mutation: Mutation) -> Result<Entity> {
        let _guard = self.apply_lock.lock().await;
        match mutation {
            Mutation::Create(entity) => {
                entity.validate()?;
                self.store.put(&entity)?;
                self.sync_out(Operation::Insert, entity).await
            }
            Mutation::Update(entity) => {
                entity.validate()?;
                self.store.put(&entity)?;
                self.sync_out(Operation::Update, entity).await
            }
            Mutation::Delete(collection, id) => {
                let Some(existing) = self.store.get(collection, id)? else {
                    return Err(Error::NotFound(format!(
                        "No {} record with id {id}",
                        collection.table()
                    )));
                };
                self.store.delete(collection, id)?;
                self.delete_out(collection, id).await?;
                Ok(existing)
            }
            Mutation::MoveToTop(collection, id) => self.apply_move_to_top(collection, id).await,
            Mutation::Move {
                collection,
                id,
                to_index,
            } => self.apply_move(collection, id, to_index).await,
            Mutation::SwapWithNeighbor {
                collection,
                id,
                direction,
            } => self.apply_swap(collection, id, direction).await,
        }
    }

    /// Send an insert or update to the remote, or queue it
    ///
    /// Deletes carry no upsert payload and take `delete_out` instead; one
    /// arriving here is refused.
    async fn sync_out(&self, operation: Operation, entity: Entity) -> Result<Entity> {
        if operation == Operation::Delete {
            return Err(Error::Validation(format!(
                "Cannot push a delete for {} as an upsert",
                entity.id()
            )));
        }
        if !self.monitor.state().is_eligible() {
            self.queue.push_upsert(operation, &entity)?;
            tracing::debug!("Queued {operation} for {} (not eligible)", entity.id());
            return Ok(entity);
        }

        let call = if operation == Operation::Insert {
            self.remote.create(&entity).await
        } else {
            self.remote.update(&entity).await
        };

        match call {
            Ok(confirmed) => {
                // The server's copy is authoritative; write it back and
                // drop any queue entry it supersedes
                self.store.put(&confirmed)?;
                self.queue.remove(confirmed.id())?;
                Ok(confirmed)
            }
            Err(RemoteError::Conflict { current }) => {
                let (winner, push_failure) = self.resolve_conflict(entity, *current).await?;
                if let Some(e) = push_failure {
                    tracing::warn!("Could not push conflict winner, queueing: {e}");
                    self.queue.push_upsert(Operation::Update, &winner)?;
                }
                Ok(winner)
            }
            Err(e) => {
                tracing::warn!("Remote write failed, queueing for replay: {e}");
                self.queue.push_upsert(operation, &entity)?;
                Ok(entity)
            }
        }
    }

    /// Send a delete to the remote, or queue it
    async fn delete_out(&self, collection: Collection, id: EntityId) -> Result<()> {
        if !self.monitor.state().is_eligible() {
            self.queue.push_delete(collection, id)?;
            tracing::debug!("Queued DELETE for {id} (not eligible)");
            return Ok(());
        }

        match self.remote.delete(collection, id).await {
            Ok(()) => self.queue.remove(id),
            Err(e) => {
                tracing::warn!("Remote delete failed, queueing for replay: {e}");
                self.queue.push_delete(collection, id)
            }
        }
    }

    /// Resolve a conflict reported by the remote
    ///
    /// The winner is stored locally and logged. When the local side won the
    /// remote still holds the loser, so the winner is pushed back; a failure
    /// of that push is returned for the caller to queue or keep queued.
    async fn resolve_conflict(
        &self,
        local: Entity,
        remote_current: Entity,
    ) -> Result<(Entity, Option<RemoteError>)> {
        let collection = local.collection();
        let id = local.id();
        let local_updated = local.updated_at();
        let remote_updated = remote_current.updated_at();

        let winner_side = resolver::resolve(&local, &remote_current);
        let winner = match winner_side {
            ConflictWinner::Local => local,
            ConflictWinner::Remote => remote_current,
        };

        self.put_if_not_stale(&winner)?;
        self.store
            .record_conflict(collection, id, local_updated, remote_updated, winner_side)?;
        tracing::info!("Resolved conflict for {id}: kept the {winner_side} copy");

        if winner_side == ConflictWinner::Local {
            match self.remote.update(&winner).await {
                Ok(confirmed) => {
                    self.put_if_not_stale(&confirmed)?;
                    Ok((confirmed, None))
                }
                Err(e) => Ok((winner, Some(e))),
            }
        } else {
            Ok((winner, None))
        }
    }

    /// Write back a remote-confirmed record unless a newer local edit
    /// landed while the call was in flight
    fn put_if_not_stale(&self, confirmed: &Entity) -> Result<()> {
        if let Some(current) = self.store.get(confirmed.collection(), confirmed.id())? {
            if current.updated_at() > confirmed.updated_at() {
                return Ok(());
            }
        }
        self.store.put(confirmed)
    }

    async fn apply_move_to_top(&self, collection: Collection, id: EntityId) -> Result<Entity> {
        let all = self.store.get_all(collection)?;
        let Some(mut entity) = all.iter().find(|e| e.id() == id).cloned() else {
            return Err(Error::NotFound(format!(
                "No {} record with id {id}",
                collection.table()
            )));
        };
        if all.first().map(Entity::id) == Some(id) {
            return Ok(entity);
        }

        let others: Vec<i64> = all
            .iter()
            .filter(|e| e.id() != id)
            .map(Entity::order)
            .collect();
        entity.set_order(order::order_for_insert_at_top(&others, util::now_ms()));
        self.store.put(&entity)?;
        self.sync_out(Operation::Update, entity).await
    }

    async fn apply_move(
        &self,
        collection: Collection,
        id: EntityId,
        to_index: usize,
    ) -> Result<Entity> {
        let mut all = self.store.get_all(collection)?;
        let Some(from) = all.iter().position(|e| e.id() == id) else {
            return Err(Error::NotFound(format!(
                "No {} record with id {id}",
                collection.table()
            )));
        };

        let orders: Vec<i64> = all.iter().map(Entity::order).collect();
        let new_order = match order::order_for_move(&orders, from, to_index) {
            Some(new_order) => new_order,
            None => {
                // The keyspace between the destination neighbors is used
                // up; respace the collection and compute again
                self.renormalize(collection, &mut all)?;
                let orders: Vec<i64> = all.iter().map(Entity::order).collect();
                order::order_for_move(&orders, from, to_index).ok_or_else(|| {
                    Error::Validation("Could not allocate a sort key for the move".to_string())
                })?
            }
        };

        let mut entity = all[from].clone();
        if new_order == entity.order() {
            return Ok(entity);
        }
        entity.set_order(new_order);
        self.store.put(&entity)?;
        self.sync_out(Operation::Update, entity).await
    }

    async fn apply_swap(
        &self,
        collection: Collection,
        id: EntityId,
        direction: Direction,
    ) -> Result<Entity> {
        let all = self.store.get_all(collection)?;
        let Some(index) = all.iter().position(|e| e.id() == id) else {
            return Err(Error::NotFound(format!(
                "No {} record with id {id}",
                collection.table()
            )));
        };

        let neighbor_index = match direction {
            Direction::Up => index.checked_sub(1),
            Direction::Down => (index + 1 < all.len()).then_some(index + 1),
        };
        let Some(neighbor_index) = neighbor_index else {
            // Already at the edge
            return Ok(all[index].clone());
        };

        // Both order writes land in one transaction
        let neighbor = all[neighbor_index].clone();
        self.store.swap_orders(collection, id, neighbor.id())?;

        let mut moved = all[index].clone();
        moved.set_order(neighbor.order());
        let mut other = neighbor;
        let old_order = all[index].order();
        other.set_order(old_order);

        let moved = self.sync_out(Operation::Update, moved).await?;
        self.sync_out(Operation::Update, other).await?;
        Ok(moved)
    }

    /// Respace every sort key in a collection (maintenance path)
    ///
    /// Render order is preserved and no `updated_at` moves. The rewritten
    /// records are queued as updates so other devices converge on the new
    /// keys; the next replay pushes them.
    fn renormalize(&self, collection: Collection, all: &mut [Entity]) -> Result<()> {
        tracing::info!(
            "Renormalizing {} sort keys for {} records",
            collection.table(),
            all.len()
        );
        let keys = order::renormalize(all.len());
        for (entity, key) in all.iter_mut().zip(keys) {
            if entity.order() == key {
                continue;
            }
            entity.set_order(key);
            self.store.put(entity)?;
            self.queue.push_upsert(Operation::Update, entity)?;
        }
        Ok(())
    }

    /// Replay the queue now
    ///
    /// Only one replay runs at a time. A call that finds a replay already
    /// in flight records exactly one follow-up, which the active run picks
    /// up before releasing the guard chain.
    pub async fn sync_now(&self) -> Result<ReplayReport> {
        let mut total = ReplayReport::default();
        loop {
            let Ok(guard) = self.replay_lock.try_lock() else {
                self.replay_pending.store(true, Ordering::SeqCst);
                total.remaining = self.queue.len()?;
                return Ok(total);
            };
            let outcome = self.drain_queue().await;
            drop(guard);
            let report = outcome?;

            total.replayed += report.replayed;
            total.conflicts += report.conflicts;
            total.remaining = report.remaining;
            if !self.replay_pending.swap(false, Ordering::SeqCst) {
                return Ok(total);
            }
        }
    }

    /// Watch connectivity and replay on every transition into eligibility
    ///
    /// Runs until the monitor is dropped.
    pub fn spawn_replay_task(self: Arc<Self>) -> JoinHandle<()> {
        let coordinator = self;
        let mut rx = coordinator.monitor.subscribe();
        tokio::spawn(async move {
            let mut was_eligible = rx.borrow().is_eligible();
            if was_eligible {
                if let Err(e) = coordinator.sync_now().await {
                    tracing::error!("Replay failed: {e}");
                }
            }
            while rx.changed().await.is_ok() {
                let eligible = rx.borrow_and_update().is_eligible();
                if eligible && !was_eligible {
                    tracing::info!("Back online and signed in, replaying queued changes");
                    if let Err(e) = coordinator.sync_now().await {
                        tracing::error!("Replay failed: {e}");
                    }
                }
                was_eligible = eligible;
            }
        })
    }

    /// One replay run: FIFO passes with bounded backoff between retries
    async fn drain_queue(&self) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        let mut attempt: u32 = 0;

        loop {
            if !self.monitor.state().is_eligible() {
                break;
            }
            match self.replay_pass(&mut report).await? {
                PassOutcome::Drained | PassOutcome::Paused => break,
                PassOutcome::TransientFailure => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        tracing::warn!(
                            "Replay paused after {attempt} attempts; waiting for the next trigger"
                        );
                        break;
                    }
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!("Transient replay failure, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        report.remaining = self.queue.len()?;
        if report.replayed > 0 {
            tracing::info!(
                "Replayed {} queued changes ({} conflicts, {} remaining)",
                report.replayed,
                report.conflicts,
                report.remaining
            );
        }
        Ok(report)
    }

    /// Walk the queue once, stopping at the first transient failure so no
    /// entry is ever skipped over
    async fn replay_pass(&self, report: &mut ReplayReport) -> Result<PassOutcome> {
        for entry in self.queue.entries()? {
            if !self.monitor.state().is_eligible() {
                return Ok(PassOutcome::Paused);
            }
            match self.replay_entry(&entry).await? {
                Ok(resolved_conflict) => {
                    self.queue.remove_if_unchanged(entry.id, &entry.enqueued_at)?;
                    report.replayed += 1;
                    if resolved_conflict {
                        report.conflicts += 1;
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!("Replay stopped at {}: {e}", entry.id);
                    return Ok(PassOutcome::TransientFailure);
                }
                Err(RemoteError::Unauthorized) => {
                    tracing::info!("Replay paused: session is not authorized");
                    return Ok(PassOutcome::Paused);
                }
                Err(e) => {
                    tracing::warn!(
                        "Dropping queued {} for {}: remote rejected it permanently: {e}",
                        entry.operation,
                        entry.id
                    );
                    self.queue.remove_if_unchanged(entry.id, &entry.enqueued_at)?;
                }
            }
        }
        Ok(PassOutcome::Drained)
    }

    /// Replay one entry
    ///
    /// The outer `Result` is a fatal local failure; the inner one is the
    /// remote outcome. The inner `bool` reports whether a conflict was
    /// resolved on the way.
    async fn replay_entry(&self, entry: &QueueEntry) -> Result<RemoteResult<bool>> {
        match entry.operation {
            Operation::Insert | Operation::Update => {
                let Some(payload) = entry.payload.clone() else {
                    return Ok(Err(RemoteError::InvalidResponse(
                        "Queue entry has no payload".to_string(),
                    )));
                };
                let entity = match Entity::from_value(entry.collection, payload) {
                    Ok(entity) => entity,
                    Err(e) => return Ok(Err(RemoteError::InvalidResponse(e.to_string()))),
                };

                let call = if entry.operation == Operation::Insert {
                    self.remote.create(&entity).await
                } else {
                    self.remote.update(&entity).await
                };

                match call {
                    Ok(confirmed) => {
                        self.put_if_not_stale(&confirmed)?;
                        Ok(Ok(false))
                    }
                    Err(RemoteError::Conflict { current }) => {
                        let (_winner, push_failure) =
                            self.resolve_conflict(entity, *current).await?;
                        match push_failure {
                            None => Ok(Ok(true)),
                            Some(e) => Ok(Err(e)),
                        }
                    }
                    Err(e) => Ok(Err(e)),
                }
            }
            Operation::Delete => Ok(self
                .remote
                .delete(entry.collection, entry.id)
                .await
                .map(|()| false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, SqliteStore};
    use crate::models::{Note, Todo};
    use crate::sync::connectivity::ConnectivityMonitor;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// In-memory remote with failure injection and call counting
    struct MockRemoteStore {
        records: tokio::sync::Mutex<HashMap<(Collection, EntityId), Entity>>,
        fail_all: AtomicBool,
        unauthorized: AtomicBool,
        /// Calls that succeed before `fail_all` kicks in
        succeed_first: AtomicUsize,
        /// Calls that fail before traffic recovers
        fail_first: AtomicUsize,
        /// When set, the next call parks on `held` until `release_held`
        hold_next: AtomicBool,
        held: Notify,
        release: Notify,
        create_calls: AtomicUsize,
        update_calls: AtomicUsize,
        delete_calls: AtomicUsize,
    }

    impl MockRemoteStore {
        fn new() -> Self {
            Self {
                records: tokio::sync::Mutex::new(HashMap::new()),
                fail_all: AtomicBool::new(false),
                unauthorized: AtomicBool::new(false),
                succeed_first: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                hold_next: AtomicBool::new(false),
                held: Notify::new(),
                release: Notify::new(),
                create_calls: AtomicUsize::new(0),
                update_calls: AtomicUsize::new(0),
                delete_calls: AtomicUsize::new(0),
            }
        }

        /// Park the next remote call until `release_held` fires
        fn hold_next_call(&self) {
            self.hold_next.store(true, Ordering::SeqCst);
        }

        async fn wait_until_held(&self) {
            self.held.notified().await;
        }

        fn release_held(&self) {
            self.release.notify_one();
        }

        async fn gate(&self) {
            if self.hold_next.swap(false, Ordering::SeqCst) {
                self.held.notify_one();
                self.release.notified().await;
            }
        }

        async fn seed(&self, entity: Entity) {
            self.records
                .lock()
                .await
                .insert((entity.collection(), entity.id()), entity);
        }

        async fn stored(&self, collection: Collection, id: EntityId) -> Option<Entity> {
            self.records.lock().await.get(&(collection, id)).cloned()
        }

        fn total_calls(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
                + self.update_calls.load(Ordering::SeqCst)
                + self.delete_calls.load(Ordering::SeqCst)
        }

        fn check_failure(&self) -> RemoteResult<()> {
            if self.unauthorized.load(Ordering::SeqCst) {
                return Err(RemoteError::Unauthorized);
            }
            let fail_first = self.fail_first.load(Ordering::SeqCst);
            if fail_first > 0 {
                self.fail_first.store(fail_first - 1, Ordering::SeqCst);
                return Err(RemoteError::Network("connection reset".to_string()));
            }
            let succeed_first = self.succeed_first.load(Ordering::SeqCst);
            if succeed_first > 0 {
                self.succeed_first.store(succeed_first - 1, Ordering::SeqCst);
                return Ok(());
            }
            if self.fail_all.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RemoteStore for MockRemoteStore {
        async fn create(&self, entity: &Entity) -> RemoteResult<Entity> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.gate().await;
            self.check_failure()?;
            let mut records = self.records.lock().await;
            let key = (entity.collection(), entity.id());
            if let Some(current) = records.get(&key) {
                if current.updated_at() != entity.updated_at() {
                    return Err(RemoteError::Conflict {
                        current: Box::new(current.clone()),
                    });
                }
            }
            records.insert(key, entity.clone());
            Ok(entity.clone())
        }

        async fn update(&self, entity: &Entity) -> RemoteResult<Entity> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            self.gate().await;
            self.check_failure()?;
            let mut records = self.records.lock().await;
            let key = (entity.collection(), entity.id());
            if let Some(current) = records.get(&key) {
                if current.updated_at() > entity.updated_at() {
                    return Err(RemoteError::Conflict {
                        current: Box::new(current.clone()),
                    });
                }
            }
            records.insert(key, entity.clone());
            Ok(entity.clone())
        }

        async fn delete(&self, collection: Collection, id: EntityId) -> RemoteResult<()> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            self.gate().await;
            self.check_failure()?;
            self.records.lock().await.remove(&(collection, id));
            Ok(())
        }

        async fn list(&self, collection: Collection) -> RemoteResult<Vec<Entity>> {
            self.check_failure()?;
            Ok(self
                .records
                .lock()
                .await
                .iter()
                .filter(|((c, _), _)| *c == collection)
                .map(|(_, entity)| entity.clone())
                .collect())
        }
    }

    struct Harness {
        coordinator: Arc<SyncCoordinator>,
        store: Arc<SqliteStore>,
        remote: Arc<MockRemoteStore>,
        monitor: Arc<ConnectivityMonitor>,
        db: Arc<Database>,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
        let remote = Arc::new(MockRemoteStore::new());
        let monitor = Arc::new(ConnectivityMonitor::new());
        let coordinator = Arc::new(
            SyncCoordinator::new(
                Arc::<SqliteStore>::clone(&store) as Arc<dyn LocalStore>,
                Arc::<MockRemoteStore>::clone(&remote) as Arc<dyn RemoteStore>,
                SyncQueue::new(Arc::clone(&db)),
                Arc::clone(&monitor),
            )
            .with_policy(ReplayPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            }),
        );
        Harness {
            coordinator,
            store,
            remote,
            monitor,
            db,
        }
    }

    fn go_eligible(h: &Harness) {
        h.monitor.set_online(true);
        h.monitor.sign_in("user-1");
    }

    fn queue_view(h: &Harness) -> SyncQueue {
        SyncQueue::new(Arc::clone(&h.db))
    }

    fn note(title: &str, order: i64) -> Note {
        Note::new(title, "", "#fff", order)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_create_stays_local_and_queues() {
        let h = harness();
        let n = note("Groceries", 1000);

        let applied = h
            .coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        assert_eq!(applied.id(), n.id);
        assert!(h.store.get(Collection::Notes, n.id).unwrap().is_some());
        assert_eq!(h.remote.total_calls(), 0);
        assert_eq!(h.coordinator.pending_count().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eligible_create_writes_remote_directly() {
        let h = harness();
        go_eligible(&h);
        let n = note("Groceries", 1000);

        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        assert!(h.remote.stored(Collection::Notes, n.id).await.is_some());
        assert_eq!(h.coordinator.pending_count().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validation_rejected_before_any_store() {
        let h = harness();
        go_eligible(&h);
        let n = note("   ", 1000);

        let result = h
            .coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(h.store.get(Collection::Notes, n.id).unwrap().is_none());
        assert_eq!(h.remote.total_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_failure_is_absorbed() {
        let h = harness();
        go_eligible(&h);
        h.remote.fail_all.store(true, Ordering::SeqCst);
        let n = note("Groceries", 1000);

        let applied = h
            .coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        assert_eq!(applied.id(), n.id);
        // One attempt, then queued; never an error
        assert_eq!(h.remote.total_calls(), 1);
        assert_eq!(h.coordinator.pending_count().unwrap(), 1);
        assert!(h.store.get(Collection::Notes, n.id).unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_update_replays_on_sync() {
        let h = harness();
        go_eligible(&h);
        let n = note("Groceries", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        h.monitor.set_online(false);
        let mut edited = n.clone();
        edited.title = "Groceries and pharmacy".to_string();
        edited.touch();
        h.coordinator
            .apply(Mutation::Update(Entity::Note(edited.clone())))
            .await
            .unwrap();

        let queue = queue_view(&h);
        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Update);

        h.monitor.set_online(true);
        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 0);

        let remote_copy = h.remote.stored(Collection::Notes, n.id).await.unwrap();
        assert_eq!(remote_copy.title(), "Groceries and pharmacy");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_keeps_greater_updated_at() {
        // Device 1 wrote at T1; this device edited at T2 < T1 and syncs later
        let h = harness();
        go_eligible(&h);

        let mut device1 = note("From device 1", 1000);
        device1.updated_at = 5000;
        h.remote.seed(Entity::Note(device1.clone())).await;

        let mut device2 = device1.clone();
        device2.title = "From device 2".to_string();
        device2.updated_at = 4000;

        let applied = h
            .coordinator
            .apply(Mutation::Update(Entity::Note(device2)))
            .await
            .unwrap();

        // The remote copy wins despite syncing earlier in wall-clock time
        assert_eq!(applied.title(), "From device 1");
        let local = h.store.get(Collection::Notes, device1.id).unwrap().unwrap();
        assert_eq!(local.title(), "From device 1");

        let conflicts = h.store.recent_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].winner, ConflictWinner::Remote);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_local_winner_is_pushed_back() {
        let h = harness();
        go_eligible(&h);

        // The remote holds a stale copy under the same id
        let mut stale = note("Stale", 1000);
        stale.updated_at = 1000;
        h.remote.seed(Entity::Note(stale.clone())).await;

        let mut fresh = stale.clone();
        fresh.title = "Fresh".to_string();
        fresh.updated_at = 9000;

        // A queued INSERT replaying onto an existing id conflicts
        let queue = queue_view(&h);
        queue
            .push_upsert(Operation::Insert, &Entity::Note(fresh.clone()))
            .unwrap();
        let report = h.coordinator.sync_now().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.remaining, 0);
        let remote_copy = h.remote.stored(Collection::Notes, stale.id).await.unwrap();
        assert_eq!(remote_copy.title(), "Fresh");
        let conflicts = h.store.recent_conflicts(10).unwrap();
        assert_eq!(conflicts[0].winner, ConflictWinner::Local);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replay_stops_on_transient_and_preserves_order() {
        let h = harness();
        let first = note("First", 3000);
        let second = note("Second", 2000);
        let third = note("Third", 1000);
        for n in [&first, &second, &third] {
            h.coordinator
                .apply(Mutation::Create(Entity::Note(n.clone())))
                .await
                .unwrap();
        }
        assert_eq!(h.coordinator.pending_count().unwrap(), 3);

        // First replayed call succeeds, everything after fails
        go_eligible(&h);
        h.remote.succeed_first.store(1, Ordering::SeqCst);
        h.remote.fail_all.store(true, Ordering::SeqCst);

        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 2);
        assert!(h.remote.stored(Collection::Notes, first.id).await.is_some());
        assert!(h.remote.stored(Collection::Notes, second.id).await.is_none());

        // Entries that did not replay kept their order
        let queue = queue_view(&h);
        let remaining: Vec<_> = queue.entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![second.id, third.id]);

        // Once traffic recovers the rest drains
        h.remote.fail_all.store(false, Ordering::SeqCst);
        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 0);
        assert!(h.remote.stored(Collection::Notes, third.id).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replay_retries_with_backoff() {
        let h = harness();
        let n = note("Groceries", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        go_eligible(&h);
        h.remote.fail_first.store(1, Ordering::SeqCst);

        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 0);
        // One failed attempt plus the retry that landed
        assert_eq!(h.remote.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_collapses_queued_update() {
        let h = harness();
        go_eligible(&h);
        let n = note("Groceries", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        h.monitor.set_online(false);
        let mut edited = n.clone();
        edited.touch();
        h.coordinator
            .apply(Mutation::Update(Entity::Note(edited)))
            .await
            .unwrap();
        h.coordinator
            .apply(Mutation::Delete(Collection::Notes, n.id))
            .await
            .unwrap();

        let queue = queue_view(&h);
        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Delete);

        h.monitor.set_online(true);
        let update_calls_before = h.remote.update_calls.load(Ordering::SeqCst);
        h.coordinator.sync_now().await.unwrap();

        assert!(h.remote.stored(Collection::Notes, n.id).await.is_none());
        assert_eq!(h.remote.delete_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.remote.update_calls.load(Ordering::SeqCst),
            update_calls_before
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_of_never_synced_record_makes_no_calls() {
        let h = harness();
        let n = note("Draft", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();
        h.coordinator
            .apply(Mutation::Delete(Collection::Notes, n.id))
            .await
            .unwrap();

        assert_eq!(h.coordinator.pending_count().unwrap(), 0);

        go_eligible(&h);
        h.coordinator.sync_now().await.unwrap();
        assert_eq!(h.remote.total_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_missing_record_is_not_found() {
        let h = harness();
        let result = h
            .coordinator
            .apply(Mutation::Delete(Collection::Notes, EntityId::new()))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_refused_on_the_upsert_path() {
        let h = harness();
        go_eligible(&h);
        let n = note("Groceries", 1000);

        let result = h
            .coordinator
            .sync_out(Operation::Delete, Entity::Note(n))
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(h.remote.total_calls(), 0);
        assert_eq!(h.coordinator.pending_count().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replay_runs_on_connectivity_edge() {
        let h = harness();
        let n = note("Groceries", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        let task = Arc::clone(&h.coordinator).spawn_replay_task();
        go_eligible(&h);

        // Wait for the watcher to notice and drain
        for _ in 0..100 {
            if h.coordinator.pending_count().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.coordinator.pending_count().unwrap(), 0);
        assert!(h.remote.stored(Collection::Notes, n.id).await.is_some());
        task.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unauthorized_keeps_entries_queued() {
        let h = harness();
        let n = note("Groceries", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n)))
            .await
            .unwrap();

        go_eligible(&h);
        h.remote.unauthorized.store(true, Ordering::SeqCst);
        let report = h.coordinator.sync_now().await.unwrap();

        assert_eq!(report.replayed, 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_corrupt_entry_does_not_stall_replay() {
        let h = harness();
        let n = note("Groceries", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        // A corrupt row sitting ahead of the valid entry
        h.db.conn()
            .execute(
                "INSERT INTO sync_queue
                     (entity_id, position, operation, entity_table, payload, enqueued_at)
                 VALUES ('broken', 0, 'INSERT', 'notes', '{', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        go_eligible(&h);
        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 0);
        assert!(h.remote.stored(Collection::Notes, n.id).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_direct_success_supersedes_queued_entry() {
        let h = harness();
        go_eligible(&h);
        let n = note("Groceries", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(n.clone())))
            .await
            .unwrap();

        h.monitor.set_online(false);
        let mut edited = n.clone();
        edited.touch();
        h.coordinator
            .apply(Mutation::Update(Entity::Note(edited.clone())))
            .await
            .unwrap();
        assert_eq!(h.coordinator.pending_count().unwrap(), 1);

        h.monitor.set_online(true);
        edited.touch();
        h.coordinator
            .apply(Mutation::Update(Entity::Note(edited)))
            .await
            .unwrap();

        // The direct write carried the latest state; nothing left to replay
        assert_eq!(h.coordinator.pending_count().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idempotent_replay() {
        let h = harness();
        go_eligible(&h);
        let mut n = note("Groceries", 1000);
        n.updated_at = 4321;
        let entity = Entity::Note(n.clone());
        h.store.put(&entity).unwrap();

        let queue = queue_view(&h);
        queue.push_upsert(Operation::Update, &entity).unwrap();
        h.coordinator.sync_now().await.unwrap();
        let after_first = h.remote.stored(Collection::Notes, n.id).await.unwrap();

        // Replaying the same entry again converges to the same state
        queue.push_upsert(Operation::Update, &entity).unwrap();
        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.conflicts, 0);
        let after_second = h.remote.stored(Collection::Notes, n.id).await.unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_during_replay_runs_one_follow_up_drain() {
        let h = harness();
        let offline_note = note("Written offline", 2000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(offline_note)))
            .await
            .unwrap();

        go_eligible(&h);
        h.remote.hold_next_call();
        let replaying = {
            let coordinator = Arc::clone(&h.coordinator);
            tokio::spawn(async move { coordinator.sync_now().await })
        };
        h.remote.wait_until_held().await;

        // The first run is parked mid-entry with the replay lock held. A
        // write landing now misses its queue snapshot, so a second sync can
        // only record a follow-up.
        h.monitor.set_online(false);
        let late_note = note("Written during replay", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(late_note.clone())))
            .await
            .unwrap();
        let contended = h.coordinator.sync_now().await.unwrap();
        assert_eq!(contended.replayed, 0);
        assert_eq!(contended.remaining, 2);

        h.monitor.set_online(true);
        h.remote.release_held();
        let report = replaying.await.unwrap().unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 0);
        assert_eq!(h.coordinator.pending_count().unwrap(), 0);
        assert_eq!(h.remote.total_calls(), 2);
        assert!(h.remote.stored(Collection::Notes, late_note.id).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eventual_consistency_after_offline_run() {
        let h = harness();

        let a = note("A", 3000);
        let b = note("B", 2000);
        let mut todo = Todo::new("Packing", "#fff", 1000);
        todo.add_item("passport");

        h.coordinator
            .apply(Mutation::Create(Entity::Note(a.clone())))
            .await
            .unwrap();
        h.coordinator
            .apply(Mutation::Create(Entity::Note(b.clone())))
            .await
            .unwrap();
        h.coordinator
            .apply(Mutation::Create(Entity::Todo(todo.clone())))
            .await
            .unwrap();

        let mut a_edit = a.clone();
        a_edit.content = "edited offline".to_string();
        a_edit.touch();
        h.coordinator
            .apply(Mutation::Update(Entity::Note(a_edit)))
            .await
            .unwrap();
        h.coordinator
            .apply(Mutation::Delete(Collection::Notes, b.id))
            .await
            .unwrap();

        go_eligible(&h);
        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.remaining, 0);

        // Every touched record matches between the two stores
        let local_a = h.store.get(Collection::Notes, a.id).unwrap().unwrap();
        let remote_a = h.remote.stored(Collection::Notes, a.id).await.unwrap();
        assert_eq!(local_a, remote_a);
        assert!(h.remote.stored(Collection::Notes, b.id).await.is_none());
        let local_todo = h.store.get(Collection::Todos, todo.id).unwrap().unwrap();
        let remote_todo = h.remote.stored(Collection::Todos, todo.id).await.unwrap();
        assert_eq!(local_todo, remote_todo);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_swap_exchanges_orders_without_touching_timestamps() {
        let h = harness();
        go_eligible(&h);
        let top = note("Top", 1000);
        let bottom = note("Bottom", 2000);
        for n in [&top, &bottom] {
            h.coordinator
                .apply(Mutation::Create(Entity::Note(n.clone())))
                .await
                .unwrap();
        }

        let moved = h
            .coordinator
            .apply(Mutation::SwapWithNeighbor {
                collection: Collection::Notes,
                id: bottom.id,
                direction: Direction::Up,
            })
            .await
            .unwrap();

        assert_eq!(moved.order(), 1000);
        assert_eq!(moved.updated_at(), bottom.updated_at);
        let other = h.store.get(Collection::Notes, top.id).unwrap().unwrap();
        assert_eq!(other.order(), 2000);
        assert_eq!(other.updated_at(), top.updated_at);

        // Both records propagated
        let remote_moved = h.remote.stored(Collection::Notes, bottom.id).await.unwrap();
        assert_eq!(remote_moved.order(), 1000);
        let remote_other = h.remote.stored(Collection::Notes, top.id).await.unwrap();
        assert_eq!(remote_other.order(), 2000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_swap_at_edge_is_a_no_op() {
        let h = harness();
        let only = note("Only", 1000);
        h.coordinator
            .apply(Mutation::Create(Entity::Note(only.clone())))
            .await
            .unwrap();

        let unchanged = h
            .coordinator
            .apply(Mutation::SwapWithNeighbor {
                collection: Collection::Notes,
                id: only.id,
                direction: Direction::Up,
            })
            .await
            .unwrap();
        assert_eq!(unchanged.order(), 1000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_to_top() {
        let h = harness();
        let first = note("First", 1000);
        let second = note("Second", 0);
        for n in [&first, &second] {
            h.coordinator
                .apply(Mutation::Create(Entity::Note(n.clone())))
                .await
                .unwrap();
        }

        let moved = h
            .coordinator
            .apply(Mutation::MoveToTop(Collection::Notes, first.id))
            .await
            .unwrap();

        assert_eq!(moved.order(), -1000);
        assert_eq!(moved.updated_at(), first.updated_at);
        let titles: Vec<_> = h
            .store
            .get_all(Collection::Notes)
            .unwrap()
            .iter()
            .map(|e| e.title().to_string())
            .collect();
        assert_eq!(titles, vec!["First", "Second"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_renormalizes_when_gap_is_exhausted() {
        let h = harness();
        let a = note("A", 1);
        let b = note("B", 2);
        let c = note("C", 3);
        for n in [&a, &b, &c] {
            h.coordinator
                .apply(Mutation::Create(Entity::Note(n.clone())))
                .await
                .unwrap();
        }

        // No integer fits between 1 and 2, so the collection respaces
        let moved = h
            .coordinator
            .apply(Mutation::Move {
                collection: Collection::Notes,
                id: c.id,
                to_index: 1,
            })
            .await
            .unwrap();

        assert_eq!(moved.order(), 1500);
        assert_eq!(moved.updated_at(), c.updated_at);
        let all = h.store.get_all(Collection::Notes).unwrap();
        let titles: Vec<_> = all.iter().map(|e| e.title().to_string()).collect();
        assert_eq!(titles, vec!["A", "C", "B"]);
        let orders: Vec<_> = all.iter().map(Entity::order).collect();
        assert_eq!(orders, vec![1000, 1500, 2000]);
    }
}
