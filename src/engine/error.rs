use ulid::Ulid;

use crate::model::{Ms, ReservationState, Span};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    InvalidQuantity {
        resource_id: Ulid,
        quantity: u32,
    },
    ResourceNotFound(Ulid),
    ReservationNotFound(Ulid),
    ResourceInactive(Ulid),
    InsufficientStock {
        resource_id: Ulid,
        /// `None` for global (time-independent) checks.
        span: Option<Span>,
        requested: u32,
        available: u32,
    },
    ConflictDetected {
        resource_id: Ulid,
        span: Span,
        conflicting: Vec<Ulid>,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationState,
        to: ReservationState,
    },
    AlreadyTerminal {
        id: Ulid,
        state: ReservationState,
    },
    /// The check-and-write lost a race on `resource_id` more times than allowed.
    ConcurrentModification(Ulid),
    /// Committed quantity exceeds capacity: the ledger is already inconsistent.
    InvariantViolation {
        resource_id: Ulid,
        capacity: u32,
        committed: u64,
    },
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Expected, recoverable rejections the caller renders to the user.
    pub fn is_feasibility(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientStock { .. } | EngineError::ConflictDetected { .. }
        )
    }

    /// Failures that point at a broken ledger or storage, not at the request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InvariantViolation { .. } | EngineError::WalError(_)
        )
    }

    /// Short machine-readable label (metrics, host responses).
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::InvalidQuantity { .. } => "invalid_quantity",
            EngineError::ResourceNotFound(_) => "resource_not_found",
            EngineError::ReservationNotFound(_) => "reservation_not_found",
            EngineError::ResourceInactive(_) => "resource_inactive",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::ConflictDetected { .. } => "conflict_detected",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AlreadyTerminal { .. } => "already_terminal",
            EngineError::ConcurrentModification(_) => "concurrent_modification",
            EngineError::InvariantViolation { .. } => "invariant_violation",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::InvalidQuantity { resource_id, quantity } => {
                write!(f, "invalid quantity {quantity} for resource {resource_id}")
            }
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::ResourceInactive(id) => write!(f, "resource {id} is inactive"),
            EngineError::InsufficientStock {
                resource_id,
                span,
                requested,
                available,
            } => match span {
                Some(s) => write!(
                    f,
                    "insufficient stock on {resource_id} for [{}, {}): requested {requested}, available {available}",
                    s.start, s.end
                ),
                None => write!(
                    f,
                    "insufficient stock on {resource_id}: requested {requested}, available {available}"
                ),
            },
            EngineError::ConflictDetected {
                resource_id,
                span,
                conflicting,
            } => {
                write!(
                    f,
                    "space {resource_id} already held during [{}, {}) by {:?}",
                    span.start, span.end, conflicting
                )
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id}: cannot move from {from} to {to}")
            }
            EngineError::AlreadyTerminal { id, state } => {
                write!(f, "reservation {id} is already {state}")
            }
            EngineError::ConcurrentModification(id) => {
                write!(f, "concurrent modification on resource {id}, retries exhausted")
            }
            EngineError::InvariantViolation {
                resource_id,
                capacity,
                committed,
            } => write!(
                f,
                "ledger invariant violated on {resource_id}: committed {committed} exceeds capacity {capacity}"
            ),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
