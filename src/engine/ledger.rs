//! Quantity accounting for countable assets.
//!
//! Two measures are kept apart. The *window sum* (Σ quantity of active
//! reservations overlapping a window) is what admission checks and what
//! `window_available` reports. The *peak load* (largest Σ quantity at any one
//! instant) is what the capacity invariant is about: a window sum may exceed
//! capacity when the window spans bookings that never coexist, but a peak above
//! capacity means the ledger is already inconsistent. Write paths turn that
//! into [`EngineError::InvariantViolation`]; read-only paths floor at zero
//! after reporting it.

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Σ quantity of active reservations, optionally restricted to those
/// overlapping `window`, optionally skipping one reservation.
pub fn committed(rs: &ResourceState, window: Option<&Span>, exclude: Option<Ulid>) -> u64 {
    let keep = |r: &&Reservation| Some(r.id) != exclude;
    match window {
        Some(w) => rs.active_overlapping(w).filter(keep).map(|r| r.quantity as u64).sum(),
        None => rs.active().filter(keep).map(|r| r.quantity as u64).sum(),
    }
}

/// Largest Σ quantity of active reservations covering a single instant,
/// within `window` if given.
pub fn peak_load(rs: &ResourceState, window: Option<&Span>, exclude: Option<Ulid>) -> u64 {
    let mut events: Vec<(Ms, i64)> = Vec::new();
    let mut push = |r: &Reservation| {
        let (start, end) = match window {
            Some(w) => (r.span.start.max(w.start), r.span.end.min(w.end)),
            None => (r.span.start, r.span.end),
        };
        events.push((start, r.quantity as i64));
        events.push((end, -(r.quantity as i64)));
    };
    match window {
        Some(w) => rs.active_overlapping(w).filter(|r| Some(r.id) != exclude).for_each(&mut push),
        None => rs.active().filter(|r| Some(r.id) != exclude).for_each(&mut push),
    }
    // Ends before starts at the same instant: half-open spans that touch never stack.
    events.sort_by_key(|&(at, delta)| (at, delta));

    let mut load = 0i64;
    let mut peak = 0i64;
    for (_, delta) in events {
        load += delta;
        peak = peak.max(load);
    }
    peak as u64
}

/// `capacity - committed`, signed. `None` for resources without a capacity.
pub fn raw_available(rs: &ResourceState, window: Option<&Span>, exclude: Option<Ulid>) -> Option<i64> {
    let capacity = rs.kind.capacity()?;
    Some(capacity as i64 - committed(rs, window, exclude) as i64)
}

/// Read-path view: floors at zero, reporting the breach if the peak load is
/// over capacity.
pub fn display_available(rs: &ResourceState, window: Option<&Span>) -> Option<u32> {
    let raw = raw_available(rs, window, None)?;
    if raw < 0 {
        let _ = check_peak(rs, window);
    }
    Some(raw.max(0) as u32)
}

/// Write-path check: `quantity` more units must fit in `window`.
pub(crate) fn ensure_stock(
    rs: &ResourceState,
    window: &Span,
    quantity: u32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let Some(capacity) = rs.kind.capacity() else {
        return Err(EngineError::ResourceNotFound(rs.id));
    };
    let used = committed(rs, Some(window), exclude);
    let available = capacity as i64 - used as i64;
    if available < 0 {
        check_peak(rs, Some(window))?;
    }
    if available < quantity as i64 {
        return Err(EngineError::InsufficientStock {
            resource_id: rs.id,
            span: Some(*window),
            requested: quantity,
            available: available.max(0) as u32,
        });
    }
    Ok(())
}

fn check_peak(rs: &ResourceState, window: Option<&Span>) -> Result<(), EngineError> {
    let capacity = rs.kind.capacity().unwrap_or(0);
    let peak = peak_load(rs, window, None);
    if peak <= capacity as u64 {
        return Ok(());
    }
    tracing::error!(
        resource_id = %rs.id,
        capacity,
        peak,
        window = ?window,
        "stock ledger inconsistent: committed quantity exceeds capacity"
    );
    metrics::counter!(crate::observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
    Err(EngineError::InvariantViolation {
        resource_id: rs.id,
        capacity,
        committed: peak,
    })
}
