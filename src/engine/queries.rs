use futures::future::join_all;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::admission::transition;
use super::availability::free_windows;
use super::conflict::{conflicts, now_ms, validate_query_window};
use super::ledger::display_available;
use super::lifecycle::expired_pending;
use super::{Engine, EngineError, SharedResourceState, WalCommand};

impl Engine {
    async fn asset(&self, asset_id: Ulid) -> Result<SharedResourceState, EngineError> {
        let rs = self
            .get_resource(&asset_id)
            .ok_or(EngineError::ResourceNotFound(asset_id))?;
        if rs.read().await.kind.capacity().is_none() {
            return Err(EngineError::ResourceNotFound(asset_id));
        }
        Ok(rs)
    }

    /// Units of an asset not held by any active reservation, at any time.
    pub async fn global_available(&self, asset_id: Ulid) -> Result<u32, EngineError> {
        let rs = self.asset(asset_id).await?;
        let guard = rs.read().await;
        display_available(&guard, None).ok_or(EngineError::ResourceNotFound(asset_id))
    }

    /// Units of an asset not held by active reservations overlapping `[start, end)`.
    pub async fn window_available(&self, asset_id: Ulid, start: Ms, end: Ms) -> Result<u32, EngineError> {
        let span = validate_query_window(start, end)?;
        let rs = self.asset(asset_id).await?;
        let guard = rs.read().await;
        display_available(&guard, Some(&span)).ok_or(EngineError::ResourceNotFound(asset_id))
    }

    /// Active reservations of a space colliding with `[start, end)`.
    pub async fn conflicts(
        &self,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ConflictInfo>, EngineError> {
        let span = validate_query_window(start, end)?;
        let rs = self
            .get_resource(&space_id)
            .ok_or(EngineError::ResourceNotFound(space_id))?;
        let guard = rs.read().await;
        if guard.kind != ResourceKind::ExclusiveSpace {
            return Err(EngineError::ResourceNotFound(space_id));
        }
        Ok(conflicts(&guard, &span, exclude))
    }

    /// Open slots in `[start, end)` able to take `quantity` more units.
    pub async fn free_windows(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
    ) -> Result<Vec<Span>, EngineError> {
        let span = validate_query_window(start, end)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        if !guard.active {
            return Ok(Vec::new());
        }
        Ok(free_windows(&guard, &span, quantity))
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let handles: Vec<SharedResourceState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for rs in handles {
            let guard = rs.read().await;
            out.push(resource_info(&guard));
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.read().await;
        Ok(resource_info(&guard))
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let resource_id = self.resolve_reservation(id)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        guard
            .reservation(id)
            .map(ReservationInfo::from)
            .ok_or(EngineError::ReservationNotFound(id))
    }

    pub fn get_requester(&self, identity: &str) -> Option<Requester> {
        self.requesters.get(identity)
    }

    /// Reservations of one resource matching `filter`, ordered by start.
    /// Listing pending reservations expires overdue ones first.
    pub async fn list_by_resource(
        &self,
        resource_id: Ulid,
        filter: StateFilter,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        self.list_by_resource_at(resource_id, filter, now_ms()).await
    }

    pub async fn list_by_resource_at(
        &self,
        resource_id: Ulid,
        filter: StateFilter,
        now: Ms,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        if filter.admits(ReservationState::Pending) {
            self.expire_overdue(&rs, now).await?;
        }
        let guard = rs.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| filter.admits(r.state))
            .map(ReservationInfo::from)
            .collect())
    }

    /// All pending reservations across resources, after auto-expiring those
    /// whose start has passed.
    pub async fn list_pending(&self) -> Result<Vec<ReservationInfo>, EngineError> {
        self.list_pending_at(now_ms()).await
    }

    pub async fn list_pending_at(&self, now: Ms) -> Result<Vec<ReservationInfo>, EngineError> {
        let handles: Vec<SharedResourceState> = self.state.iter().map(|e| e.value().clone()).collect();
        let sweeps = handles.iter().map(|rs| async move {
            self.expire_overdue(rs, now).await?;
            let guard = rs.read().await;
            Ok::<_, EngineError>(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.state == ReservationState::Pending)
                    .map(ReservationInfo::from)
                    .collect::<Vec<_>>(),
            )
        });

        let mut pending = Vec::new();
        for result in join_all(sweeps).await {
            pending.extend(result?);
        }
        pending.sort_by_key(|r| (r.start, r.id));
        Ok(pending)
    }

    /// Cancel every pending reservation on `rs` whose start is before `now`.
    /// Runs under the resource's write lock, so concurrent sweeps serialize and
    /// a reservation is expired (and announced) exactly once.
    pub(super) async fn expire_overdue(&self, rs: &SharedResourceState, now: Ms) -> Result<usize, EngineError> {
        if expired_pending(&*rs.read().await, now).is_empty() {
            return Ok(0);
        }

        let guard = rs.clone().write_owned().await;
        let due = expired_pending(&guard, now);
        if due.is_empty() {
            return Ok(0);
        }
        let resource_id = guard.id;
        let events: Vec<Event> = due
            .iter()
            .filter_map(|id| guard.reservation(*id))
            .map(|r| transition(&guard, r, ReservationState::Cancelled, TransitionCause::AutoExpired).0)
            .collect();
        let count = events.len();
        self.persist_and_apply(guard, events).await?;

        metrics::counter!(crate::observability::AUTO_EXPIRED_TOTAL).increment(count as u64);
        for id in &due {
            info!(reservation_id = %id, %resource_id, "pending reservation expired");
        }
        Ok(count)
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Every resource is read-locked (and resource creation paused) until the
    /// writer has swapped files, so no committed event can fall between the
    /// snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut handles: Vec<(Ulid, SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(handles.len());
        for (_, rs) in handles {
            guards.push(rs.read_owned().await);
        }

        let mut events: Vec<Event> = self
            .requesters
            .snapshot()
            .into_iter()
            .map(|requester| Event::RequesterRegistered { requester })
            .collect();

        for guard in &guards {
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                location: guard.location.clone(),
                kind: guard.kind,
            });
            if !guard.active {
                events.push(Event::ResourceStatusChanged {
                    id: guard.id,
                    active: false,
                });
            }
            for r in &guard.reservations {
                events.push(Event::ReservationRestored { reservation: r.clone() });
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.committer
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .committer
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compact once the log has grown `threshold` appends past the last compaction.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, EngineError> {
        if self.wal_appends_since_compact().await < threshold {
            return Ok(false);
        }
        self.compact_wal().await?;
        info!("WAL compacted");
        Ok(true)
    }
}

fn resource_info(rs: &ResourceState) -> ResourceInfo {
    ResourceInfo {
        id: rs.id,
        name: rs.name.clone(),
        location: rs.location.clone(),
        active: rs.active,
        kind: rs.kind,
    }
}
