use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Legal edges of the reservation state machine.
///
/// ```text
/// Pending ──► Approved ──► Cancelled
///    │
///    ├──────► Rejected
///    └──────► Cancelled   (administrative or auto-expiry)
/// ```
///
/// `Approved → Cancelled` is administrative only; auto-expiry never touches
/// approved reservations.
pub fn is_allowed(from: ReservationState, to: ReservationState, cause: TransitionCause) -> bool {
    use ReservationState::*;
    match (from, to) {
        (Pending, Approved) | (Pending, Rejected) => cause == TransitionCause::Administrative,
        (Pending, Cancelled) => true,
        (Approved, Cancelled) => cause == TransitionCause::Administrative,
        _ => false,
    }
}

/// Validate a transition for reservation `id`. Terminal sources are reported
/// as `AlreadyTerminal`; every other illegal edge is `InvalidTransition`.
pub(crate) fn check_transition(
    id: Ulid,
    from: ReservationState,
    to: ReservationState,
    cause: TransitionCause,
) -> Result<(), EngineError> {
    if from.is_terminal() {
        return Err(EngineError::AlreadyTerminal { id, state: from });
    }
    if !is_allowed(from, to, cause) {
        return Err(EngineError::InvalidTransition { id, from, to });
    }
    Ok(())
}

/// Pending reservations on `rs` whose start has passed: auto-expiry candidates.
pub fn expired_pending(rs: &ResourceState, now: Ms) -> Vec<Ulid> {
    rs.reservations
        .iter()
        .filter(|r| r.state == ReservationState::Pending && r.span.start < now)
        .map(|r| r.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReservationState::*;

    const ALL: [ReservationState; 4] = [Pending, Approved, Rejected, Cancelled];

    #[test]
    fn administrative_edges() {
        let admin = TransitionCause::Administrative;
        assert!(is_allowed(Pending, Approved, admin));
        assert!(is_allowed(Pending, Rejected, admin));
        assert!(is_allowed(Pending, Cancelled, admin));
        assert!(is_allowed(Approved, Cancelled, admin));
        assert!(!is_allowed(Approved, Rejected, admin));
        assert!(!is_allowed(Approved, Pending, admin));
        assert!(!is_allowed(Pending, Pending, admin));
    }

    #[test]
    fn auto_expiry_only_cancels_pending() {
        let auto = TransitionCause::AutoExpired;
        assert!(is_allowed(Pending, Cancelled, auto));
        assert!(!is_allowed(Approved, Cancelled, auto));
        assert!(!is_allowed(Pending, Approved, auto));
        assert!(!is_allowed(Pending, Rejected, auto));
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        for from in [Rejected, Cancelled] {
            for to in ALL {
                assert!(!is_allowed(from, to, TransitionCause::Administrative));
                let id = Ulid::new();
                assert_eq!(
                    check_transition(id, from, to, TransitionCause::Administrative),
                    Err(EngineError::AlreadyTerminal { id, state: from })
                );
            }
        }
    }

    #[test]
    fn illegal_edge_from_active_state() {
        let id = Ulid::new();
        assert_eq!(
            check_transition(id, Approved, Rejected, TransitionCause::Administrative),
            Err(EngineError::InvalidTransition { id, from: Approved, to: Rejected })
        );
        assert!(check_transition(id, Approved, Cancelled, TransitionCause::Administrative).is_ok());
    }

    #[test]
    fn expired_pending_uses_strict_start_comparison() {
        let mut rs = ResourceState::new(Ulid::new(), None, None, ResourceKind::ExclusiveSpace);
        let mk = |start, state| Reservation {
            id: Ulid::new(),
            resource: ResourceRef::Space(Ulid::nil()),
            span: Span::new(start, start + 100),
            quantity: 1,
            requester_id: "doc".into(),
            purpose: String::new(),
            state,
            created_at: 0,
            updated_at: 0,
        };
        let past = mk(100, Pending);
        let past_id = past.id;
        rs.insert_reservation(past);
        rs.insert_reservation(mk(100, Approved));
        rs.insert_reservation(mk(100, Rejected));
        rs.insert_reservation(mk(500, Pending)); // starts exactly at now

        assert_eq!(expired_pending(&rs, 500), vec![past_id]);
    }
}
