use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, conflicts, now_ms, validate_span};
use super::ledger::ensure_stock;
use super::lifecycle::check_transition;
use super::{Engine, EngineError};

fn validate_quantity(resource_id: Ulid, quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 || quantity > MAX_QUANTITY {
        return Err(EngineError::InvalidQuantity { resource_id, quantity });
    }
    Ok(())
}

fn validate_request(req: &SubmitRequest) -> Result<Span, EngineError> {
    let span = validate_span(req.start, req.end)?;
    validate_quantity(req.resource.id(), req.quantity)?;
    if req.purpose.len() > MAX_PURPOSE_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    if req.requester.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("requester name too long"));
    }
    let identity = req.requester.key();
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::LimitExceeded("requester identity must be 1..=64 chars"));
    }
    Ok(span)
}

/// Feasibility of `quantity` units over `span` on `rs`, ignoring `exclude`.
/// Spaces report collisions instead of failing; the caller decides whether
/// they block.
fn feasibility(
    rs: &ResourceState,
    span: &Span,
    quantity: u32,
    exclude: Option<Ulid>,
) -> Result<Vec<ConflictInfo>, EngineError> {
    match rs.kind {
        ResourceKind::ExclusiveSpace => {
            if quantity != 1 {
                return Err(EngineError::InvalidQuantity { resource_id: rs.id, quantity });
            }
            Ok(conflicts(rs, span, exclude))
        }
        ResourceKind::CountableAsset { .. } => {
            ensure_stock(rs, span, quantity, exclude)?;
            Ok(Vec::new())
        }
    }
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(
        crate::observability::ADMISSIONS_TOTAL,
        "op" => op,
        "outcome" => outcome
    )
    .increment(1);
    if let Err(e) = result
        && e.is_fatal() {
            tracing::error!(op, "admission failed on a broken ledger or log: {e}");
        }
}

impl Engine {
    /// Admit a new booking in `Pending`.
    ///
    /// Assets must have `quantity` units free across the whole span. Spaces are
    /// always admitted (if active); overlapping active reservations come back
    /// as advisories, since only approval enforces exclusivity.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Admitted, EngineError> {
        let result = self.submit_inner(req).await;
        record_outcome("submit", &result);
        result
    }

    async fn submit_inner(&self, req: SubmitRequest) -> Result<Admitted, EngineError> {
        let span = validate_request(&req)?;
        let resource_id = req.resource.id();
        let id = Ulid::new();
        let now = now_ms();

        let admitted = self
            .admit(resource_id, |rs| {
                if !req.resource.matches(&rs.kind) {
                    return Err(EngineError::ResourceNotFound(resource_id));
                }
                if !rs.active {
                    return Err(EngineError::ResourceInactive(resource_id));
                }
                if rs.active().count() >= MAX_ACTIVE_RESERVATIONS_PER_RESOURCE {
                    return Err(EngineError::LimitExceeded("too many reservations on resource"));
                }
                let advisories = feasibility(rs, &span, req.quantity, None)?;

                let reservation = Reservation {
                    id,
                    resource: req.resource,
                    span,
                    quantity: req.quantity,
                    requester_id: req.requester.key(),
                    purpose: req.purpose.clone(),
                    state: ReservationState::Pending,
                    created_at: now,
                    updated_at: now,
                };
                let admitted = Admitted {
                    reservation: ReservationInfo::from(&reservation),
                    advisories,
                };
                let event = Event::ReservationSubmitted {
                    reservation,
                    requester: req.requester.clone(),
                };
                Ok((event, admitted))
            })
            .await?;

        if !admitted.advisories.is_empty() {
            debug!(
                reservation_id = %id,
                competing = admitted.advisories.len(),
                "pending space request overlaps other active requests"
            );
        }
        info!(reservation_id = %id, %resource_id, quantity = req.quantity, "reservation submitted");
        Ok(admitted)
    }

    /// `Pending → Approved`, after re-running the feasibility check against
    /// everything that landed since submission.
    pub async fn approve(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        self.approve_at(id, now_ms()).await
    }

    /// Overdue pending reservations on the resource are expired first, so a
    /// stale competitor never blocks approval. If `id` itself is overdue it
    /// is expired too and approval fails with `AlreadyTerminal`.
    pub async fn approve_at(&self, id: Ulid, now: Ms) -> Result<ReservationInfo, EngineError> {
        let result = self.approve_inner(id, now).await;
        record_outcome("approve", &result);
        result
    }

    async fn approve_inner(&self, id: Ulid, now: Ms) -> Result<ReservationInfo, EngineError> {
        let resource_id = self.resolve_reservation(id)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        self.expire_overdue(&rs, now).await?;

        let info = self
            .admit(resource_id, |rs| {
                let r = rs.reservation(id).ok_or(EngineError::ReservationNotFound(id))?;
                check_transition(id, r.state, ReservationState::Approved, TransitionCause::Administrative)?;
                if !rs.active {
                    return Err(EngineError::ResourceInactive(resource_id));
                }
                match rs.kind {
                    ResourceKind::ExclusiveSpace => check_no_conflict(rs, &r.span, Some(id))?,
                    ResourceKind::CountableAsset { .. } => ensure_stock(rs, &r.span, r.quantity, Some(id))?,
                }
                Ok(transition(rs, r, ReservationState::Approved, TransitionCause::Administrative))
            })
            .await?;
        info!(reservation_id = %id, %resource_id, "reservation approved");
        Ok(info)
    }

    /// `Pending → Rejected`. No feasibility check.
    pub async fn reject(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let result = self.close(id, ReservationState::Rejected).await;
        record_outcome("reject", &result);
        result
    }

    /// `Pending | Approved → Cancelled`. Reservations are never deleted; this
    /// is the end-user "delete".
    pub async fn cancel(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let result = self.close(id, ReservationState::Cancelled).await;
        record_outcome("cancel", &result);
        result
    }

    async fn close(&self, id: Ulid, to: ReservationState) -> Result<ReservationInfo, EngineError> {
        let resource_id = self.resolve_reservation(id)?;
        let info = self
            .admit(resource_id, |rs| {
                let r = rs.reservation(id).ok_or(EngineError::ReservationNotFound(id))?;
                check_transition(id, r.state, to, TransitionCause::Administrative)?;
                Ok(transition(rs, r, to, TransitionCause::Administrative))
            })
            .await?;
        info!(reservation_id = %id, %resource_id, state = %to, "reservation closed");
        Ok(info)
    }

    /// Move a live reservation to a new span and quantity. Its own prior
    /// footprint is excluded, so shrinking back to it always fits. Approved
    /// space reservations must stay conflict-free; pending ones get advisories.
    pub async fn edit(&self, id: Ulid, start: Ms, end: Ms, quantity: u32) -> Result<Admitted, EngineError> {
        let result = self.edit_inner(id, start, end, quantity).await;
        record_outcome("edit", &result);
        result
    }

    async fn edit_inner(&self, id: Ulid, start: Ms, end: Ms, quantity: u32) -> Result<Admitted, EngineError> {
        let span = validate_span(start, end)?;
        let resource_id = self.resolve_reservation(id)?;
        validate_quantity(resource_id, quantity)?;
        let now = now_ms();

        let admitted = self
            .admit(resource_id, |rs| {
                let r = rs.reservation(id).ok_or(EngineError::ReservationNotFound(id))?;
                if r.state.is_terminal() {
                    return Err(EngineError::AlreadyTerminal { id, state: r.state });
                }
                if !rs.active {
                    return Err(EngineError::ResourceInactive(resource_id));
                }
                let advisories = feasibility(rs, &span, quantity, Some(id))?;
                if r.state == ReservationState::Approved && !advisories.is_empty() {
                    return Err(EngineError::ConflictDetected {
                        resource_id,
                        span,
                        conflicting: advisories.into_iter().map(|c| c.id).collect(),
                    });
                }

                let mut updated = r.clone();
                updated.span = span;
                updated.quantity = quantity;
                updated.updated_at = now;
                let event = Event::ReservationEdited {
                    id,
                    resource_id,
                    span,
                    quantity,
                    at: now,
                };
                Ok((
                    event,
                    Admitted {
                        reservation: ReservationInfo::from(&updated),
                        advisories,
                    },
                ))
            })
            .await?;
        info!(reservation_id = %id, %resource_id, start, end, quantity, "reservation edited");
        Ok(admitted)
    }
}

/// Build the transition event for `r` plus the reservation as it will read
/// once applied.
pub(super) fn transition(
    rs: &ResourceState,
    r: &Reservation,
    to: ReservationState,
    cause: TransitionCause,
) -> (Event, ReservationInfo) {
    let at = now_ms();
    let mut after = r.clone();
    after.state = to;
    after.updated_at = at;
    let event = Event::ReservationTransitioned {
        id: r.id,
        resource_id: rs.id,
        from: r.state,
        to,
        cause,
        at,
    };
    (event, ReservationInfo::from(&after))
}
