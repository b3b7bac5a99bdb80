use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Length in hours. Reporting only; admission never looks at it.
    pub fn duration_hours(&self) -> f64 {
        self.duration_ms() as f64 / MS_PER_HOUR
    }

    /// The one overlap predicate. Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// What a resource is and how bookings consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Booked whole; at most one active reservation per instant.
    ExclusiveSpace,
    /// Shared units; concurrent reservations draw from `total_capacity`.
    CountableAsset { total_capacity: u32 },
}

impl ResourceKind {
    pub fn capacity(&self) -> Option<u32> {
        match self {
            ResourceKind::ExclusiveSpace => None,
            ResourceKind::CountableAsset { total_capacity } => Some(*total_capacity),
        }
    }
}

/// Tagged pointer from a reservation to the resource it books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRef {
    Space(Ulid),
    Asset(Ulid),
}

impl ResourceRef {
    pub fn id(&self) -> Ulid {
        match self {
            ResourceRef::Space(id) | ResourceRef::Asset(id) => *id,
        }
    }

    pub fn matches(&self, kind: &ResourceKind) -> bool {
        matches!(
            (self, kind),
            (ResourceRef::Space(_), ResourceKind::ExclusiveSpace)
                | (ResourceRef::Asset(_), ResourceKind::CountableAsset { .. })
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ReservationState {
    /// Active reservations count toward capacity and conflicts.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationState::Pending | ReservationState::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Rejected | ReservationState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Pending => "pending",
            ReservationState::Approved => "approved",
            ReservationState::Rejected => "rejected",
            ReservationState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a state transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Administrative,
    AutoExpired,
}

/// Which reservations a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateFilter {
    #[default]
    All,
    Active,
    Only(ReservationState),
}

impl StateFilter {
    pub fn admits(&self, state: ReservationState) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Active => state.is_active(),
            StateFilter::Only(s) => *s == state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub name: String,
    pub national_id: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Requester {
    /// Registry key: identity documents match case-insensitively, ignoring
    /// surrounding whitespace.
    pub fn key(&self) -> String {
        normalize_identity(&self.national_id)
    }
}

pub fn normalize_identity(doc: &str) -> String {
    doc.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource: ResourceRef,
    pub span: Span,
    pub quantity: u32,
    /// Normalized identity document of the requester.
    pub requester_id: String,
    pub purpose: String,
    pub state: ReservationState,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// A booking request as it reaches admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub resource: ResourceRef,
    pub start: Ms,
    pub end: Ms,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub requester: Requester,
    #[serde(default)]
    pub purpose: String,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub location: Option<String>,
    pub active: bool,
    pub kind: ResourceKind,
    /// Every reservation ever admitted, any state, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Bumped on every applied mutation; optimistic admission compares it.
    pub revision: u64,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, location: Option<String>, kind: ResourceKind) -> Self {
        Self {
            id,
            name,
            location,
            active: true,
            kind,
            reservations: Vec::new(),
            revision: 0,
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        match self.kind {
            ResourceKind::ExclusiveSpace => ResourceRef::Space(self.id),
            ResourceKind::CountableAsset { .. } => ResourceRef::Asset(self.id),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Remove reservation by id.
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        if let Some(pos) = self.reservations.iter().position(|r| r.id == id) {
            Some(self.reservations.remove(pos))
        } else {
            None
        }
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Active reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn active_overlapping<'a>(&'a self, query: &'a Span) -> impl Iterator<Item = &'a Reservation> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.state.is_active() && r.span.overlaps(query))
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.state.is_active())
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        location: Option<String>,
        kind: ResourceKind,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        location: Option<String>,
        kind: ResourceKind,
    },
    ResourceStatusChanged {
        id: Ulid,
        active: bool,
    },
    /// Requester upsert and reservation insert travel as one record.
    ReservationSubmitted {
        reservation: Reservation,
        requester: Requester,
    },
    ReservationTransitioned {
        id: Ulid,
        resource_id: Ulid,
        from: ReservationState,
        to: ReservationState,
        cause: TransitionCause,
        at: Ms,
    },
    ReservationEdited {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        quantity: u32,
        at: Ms,
    },
    /// Compaction only: registry entry without a reservation attached.
    RequesterRegistered {
        requester: Requester,
    },
    /// Compaction only: a reservation in whatever state it had reached.
    ReservationRestored {
        reservation: Reservation,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub location: Option<String>,
    pub active: bool,
    pub kind: ResourceKind,
}

/// Summary of a reservation that collides with a candidate span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub state: ReservationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub resource: ResourceRef,
    pub start: Ms,
    pub end: Ms,
    pub quantity: u32,
    pub requester_id: String,
    pub purpose: String,
    pub state: ReservationState,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl From<&Reservation> for ReservationInfo {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            resource: r.resource,
            start: r.span.start,
            end: r.span.end,
            quantity: r.quantity,
            requester_id: r.requester_id.clone(),
            purpose: r.purpose.clone(),
            state: r.state,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Result of an admission: the stored reservation plus advisory conflicts
/// (space reservations still pending approval).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admitted {
    pub reservation: ReservationInfo,
    pub advisories: Vec<ConflictInfo>,
}
