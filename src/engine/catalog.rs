use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::ledger::peak_load;
use super::{Engine, EngineError};

fn check_text(value: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded(what));
        }
    Ok(())
}

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        location: Option<String>,
        kind: ResourceKind,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        check_text(&name, "resource name too long")?;
        check_text(&location, "resource location too long")?;

        let catalog = self.catalog_lock.clone().lock_owned().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            location: location.clone(),
            kind,
        };
        let rs = ResourceState::new(id, name, location, kind);

        // The catalog guard moves into the task, so compaction cannot snapshot
        // between the WAL record and the map insert.
        let committer = self.committer.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let _catalog = catalog;
            committer.wal_append(&event).await?;
            state.insert(id, Arc::new(RwLock::new(rs)));
            Ok::<_, EngineError>(())
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))??;

        info!(resource_id = %id, ?kind, "resource created");
        Ok(())
    }

    /// Rename / relocate a resource, or resize an asset. The kind itself
    /// never changes: existing reservations are tagged with it.
    ///
    /// An asset cannot shrink below its peak active load; that is refused with
    /// `InsufficientStock` carrying the peak as `requested` and the proposed
    /// capacity as `available`.
    pub async fn update_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        location: Option<String>,
        total_capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        check_text(&name, "resource name too long")?;
        check_text(&location, "resource location too long")?;
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.write_owned().await;

        let kind = match (guard.kind, total_capacity) {
            (ResourceKind::ExclusiveSpace, None) => ResourceKind::ExclusiveSpace,
            (ResourceKind::ExclusiveSpace, Some(q)) => {
                return Err(EngineError::InvalidQuantity { resource_id: id, quantity: q });
            }
            (ResourceKind::CountableAsset { total_capacity: current }, requested) => {
                ResourceKind::CountableAsset {
                    total_capacity: requested.unwrap_or(current),
                }
            }
        };

        if let (Some(old), Some(new)) = (guard.kind.capacity(), kind.capacity())
            && new < old {
                let peak = peak_load(&guard, None, None);
                if peak > new as u64 {
                    warn!(resource_id = %id, capacity = new, peak, "refusing to shrink below active load");
                    return Err(EngineError::InsufficientStock {
                        resource_id: id,
                        span: None,
                        requested: u32::try_from(peak).unwrap_or(u32::MAX),
                        available: new,
                    });
                }
            }

        let event = Event::ResourceUpdated { id, name, location, kind };
        self.persist_and_apply(guard, vec![event]).await?;
        Ok(())
    }

    /// Enable or disable a resource. Inactive resources accept no new
    /// submissions, edits or approvals; existing reservations are untouched.
    pub async fn set_resource_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.write_owned().await;
        if guard.active == active {
            return Ok(());
        }
        let event = Event::ResourceStatusChanged { id, active };
        self.persist_and_apply(guard, vec![event]).await?;
        info!(resource_id = %id, active, "resource status changed");
        Ok(())
    }
}
