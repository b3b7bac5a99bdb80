mod admission;
mod availability;
mod catalog;
mod conflict;
mod error;
mod ledger;
mod lifecycle;
mod queries;
mod requesters;
#[cfg(test)]
mod tests;

pub use availability::{compute_saturated_spans, free_windows, merge_overlapping, subtract_intervals};
pub use conflict::conflicts;
pub use error::EngineError;
pub use ledger::{committed, peak_load, raw_available};
pub use lifecycle::{expired_pending, is_allowed};
pub use requesters::RequesterRegistry;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many times a lost check-and-write race is retried before
    /// `ConcurrentModification` reaches the caller.
    pub max_admission_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_admission_retries: 8 }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        // Appends are batched by the caller loop and never routed here.
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside batch")));
        }
    }
}

/// The pieces a commit needs, detached from `Engine` so the commit can run in
/// its own task and finish even if the caller is dropped.
#[derive(Clone)]
pub(super) struct Committer {
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    reservation_index: Arc<DashMap<Ulid, Ulid>>,
    requesters: Arc<RequesterRegistry>,
}

impl Committer {
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn commit(
        &self,
        mut guard: OwnedRwLockWriteGuard<ResourceState>,
        events: Vec<Event>,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        for event in &events {
            self.wal_append(event).await?;
            apply_to_resource(&mut guard, event, &self.reservation_index, &self.requesters);
            self.notify.publish(guard.id, event);
        }
        Ok(guard)
    }
}

pub struct Engine {
    pub(super) state: Arc<DashMap<Ulid, SharedResourceState>>,
    pub(super) committer: Committer,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_index: Arc<DashMap<Ulid, Ulid>>,
    pub(super) requesters: Arc<RequesterRegistry>,
    /// Serializes resource creation against compaction snapshots.
    pub(super) catalog_lock: Arc<Mutex<()>>,
    pub(super) config: EngineConfig,
}

/// Apply an event directly to a ResourceState (no locking — caller holds the lock).
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
    requesters: &RequesterRegistry,
) {
    match event {
        Event::ResourceUpdated { name, location, kind, .. } => {
            rs.name = name.clone();
            rs.location = location.clone();
            rs.kind = *kind;
        }
        Event::ResourceStatusChanged { active, .. } => {
            rs.active = *active;
        }
        Event::ReservationSubmitted { reservation, requester } => {
            requesters.upsert(requester);
            index.insert(reservation.id, rs.id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationRestored { reservation } => {
            index.insert(reservation.id, rs.id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationTransitioned { id, to, at, .. } => {
            if let Some(r) = rs.reservation_mut(*id) {
                r.state = *to;
                r.updated_at = *at;
            }
        }
        Event::ReservationEdited { id, span, quantity, at, .. } => {
            // Re-insert to keep the start ordering.
            if let Some(mut r) = rs.remove_reservation(*id) {
                r.span = *span;
                r.quantity = *quantity;
                r.updated_at = *at;
                rs.insert_reservation(r);
            }
        }
        // Handled at the map / registry level, not here
        Event::ResourceCreated { .. } | Event::RequesterRegistered { .. } => {}
    }
    rs.revision += 1;
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservation_index = Arc::new(DashMap::new());
        let requesters = Arc::new(RequesterRegistry::new());

        // Replay into plain values first; nothing else can see them yet.
        let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated { id, name, location, kind } => {
                    resources.insert(*id, ResourceState::new(*id, name.clone(), location.clone(), *kind));
                }
                Event::RequesterRegistered { requester } => {
                    requesters.upsert(requester);
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(rs) = resources.get_mut(&resource_id) {
                            apply_to_resource(rs, other, &reservation_index, &requesters);
                        }
                }
            }
        }
        debug!("replayed {} events into {} resources", events.len(), resources.len());

        let state = DashMap::new();
        for (id, rs) in resources {
            state.insert(id, Arc::new(RwLock::new(rs)));
        }

        Ok(Self {
            state: Arc::new(state),
            committer: Committer {
                wal_tx,
                notify: notify.clone(),
                reservation_index: reservation_index.clone(),
                requesters: requesters.clone(),
            },
            notify,
            reservation_index,
            requesters,
            catalog_lock: Arc::new(Mutex::new(())),
            config,
        })
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    pub(super) fn resolve_reservation(&self, reservation_id: Ulid) -> Result<Ulid, EngineError> {
        self.get_resource_for_reservation(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))
    }

    /// WAL-append + apply + notify for each event, as one unit: the commit runs
    /// in its own task, so dropping the caller cannot split the WAL record from
    /// its in-memory effect. Hands the write guard back.
    pub(super) async fn persist_and_apply(
        &self,
        guard: OwnedRwLockWriteGuard<ResourceState>,
        events: Vec<Event>,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let committer = self.committer.clone();
        tokio::spawn(async move { committer.commit(guard, events).await })
            .await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Optimistic check-and-write on one resource.
    ///
    /// `plan` runs against a read snapshot and returns the event to commit plus
    /// the caller's output. The write lock is then taken and the snapshot's
    /// revision compared; if another writer got in between, the plan is
    /// recomputed, up to `max_admission_retries` times.
    pub(super) async fn admit<T, F>(&self, resource_id: Ulid, plan: F) -> Result<T, EngineError>
    where
        F: Fn(&ResourceState) -> Result<(Event, T), EngineError>,
    {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;

        for attempt in 0..=self.config.max_admission_retries {
            let (revision, event, output) = {
                let guard = rs.read().await;
                let (event, output) = plan(&guard)?;
                (guard.revision, event, output)
            };

            let guard = rs.clone().write_owned().await;
            if guard.revision != revision {
                metrics::counter!(crate::observability::ADMISSION_RETRIES_TOTAL).increment(1);
                debug!(%resource_id, attempt, "resource changed between check and write, retrying");
                continue;
            }

            self.persist_and_apply(guard, vec![event]).await?;
            return Ok(output);
        }

        Err(EngineError::ConcurrentModification(resource_id))
    }
}

/// Extract the resource_id from an event (for non-Create events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ResourceUpdated { id, .. } | Event::ResourceStatusChanged { id, .. } => Some(*id),
        Event::ReservationSubmitted { reservation, .. } | Event::ReservationRestored { reservation } => {
            Some(reservation.resource.id())
        }
        Event::ReservationTransitioned { resource_id, .. } | Event::ReservationEdited { resource_id, .. } => {
            Some(*resource_id)
        }
        Event::ResourceCreated { .. } | Event::RequesterRegistered { .. } => None,
    }
}
