use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Turn raw bounds into a validated span. `start >= end` is `InvalidInterval`.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// Bounds for a read-only query window: wider than a single booking may be.
pub(crate) fn validate_query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Active reservations of `rs` that collide with `span`, skipping `exclude`
/// so a reservation never conflicts with itself. Sorted by start.
pub fn conflicts(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Vec<ConflictInfo> {
    rs.active_overlapping(span)
        .filter(|r| Some(r.id) != exclude)
        .map(|r| ConflictInfo {
            id: r.id,
            start: r.span.start,
            end: r.span.end,
            state: r.state,
        })
        .collect()
}

/// Hard check used at approval: any collision blocks.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let hits = conflicts(rs, span, exclude);
    if hits.is_empty() {
        return Ok(());
    }
    Err(EngineError::ConflictDetected {
        resource_id: rs.id,
        span: *span,
        conflicting: hits.into_iter().map(|c| c.id).collect(),
    })
}
