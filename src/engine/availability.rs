use crate::model::*;

// ── Free-window algorithm ─────────────────────────────────────────

/// Sub-spans of `query` where a new reservation of `quantity` units would be
/// admissible at every instant.
///
/// Spaces: the window minus every active reservation.
/// Assets: the window minus every range where the active load leaves fewer
/// than `quantity` units.
pub fn free_windows(resource: &ResourceState, query: &Span, quantity: u32) -> Vec<Span> {
    let mut loads: Vec<(Span, u32)> = resource
        .active_overlapping(query)
        .map(|r| {
            let clamped = Span::new(r.span.start.max(query.start), r.span.end.min(query.end));
            (clamped, r.quantity)
        })
        .collect();
    loads.sort_by_key(|(s, _)| s.start);

    let blocked = match resource.kind {
        ResourceKind::ExclusiveSpace => {
            let spans: Vec<Span> = loads.into_iter().map(|(s, _)| s).collect();
            merge_overlapping(&spans)
        }
        ResourceKind::CountableAsset { total_capacity } => {
            if quantity > total_capacity {
                return Vec::new();
            }
            // Saturated once load reaches capacity - quantity + 1.
            compute_saturated_spans(&loads, (total_capacity - quantity) as u64 + 1)
        }
    };

    subtract_intervals(&[*query], &blocked)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Sweep-line: time ranges where the summed quantity is >= `threshold`.
/// Returns sorted, merged spans.
pub fn compute_saturated_spans(loads: &[(Span, u32)], threshold: u64) -> Vec<Span> {
    if loads.is_empty() {
        return Vec::new();
    }

    // Build sweep-line events: +q at start, -q at end. Ends sort before starts
    // at the same instant (half-open spans).
    let mut events: Vec<(Ms, i64)> = Vec::with_capacity(loads.len() * 2);
    for (span, q) in loads {
        events.push((span.start, *q as i64));
        events.push((span.end, -(*q as i64)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<Span> = Vec::new();
    let mut load: i64 = 0;
    let mut saturated_start: Option<Ms> = None;
    let threshold = threshold as i64;

    for (time, delta) in &events {
        load += delta;

        if load >= threshold && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if load < threshold
            && let Some(start) = saturated_start.take()
            && *time > start {
                result.push(Span::new(start, *time));
            }
    }

    merge_overlapping(&result)
}
