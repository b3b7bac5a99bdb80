use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, ReservationState, Span, TransitionCause};

const CHANNEL_CAPACITY: usize = 256;

/// Outbound reservation notice, derived from a committed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    Created {
        reservation_id: Ulid,
        resource_id: Ulid,
        requester_id: String,
        span: Span,
        quantity: u32,
    },
    Approved { reservation_id: Ulid, resource_id: Ulid },
    Rejected { reservation_id: Ulid, resource_id: Ulid },
    Cancelled { reservation_id: Ulid, resource_id: Ulid },
    /// A pending request whose start passed before anyone decided on it.
    AutoCancelled { reservation_id: Ulid, resource_id: Ulid },
    Edited {
        reservation_id: Ulid,
        resource_id: Ulid,
        span: Span,
        quantity: u32,
    },
}

impl Notice {
    /// Catalog and compaction events produce no notice.
    pub fn from_event(event: &Event) -> Option<Notice> {
        match event {
            Event::ReservationSubmitted { reservation, .. } => Some(Notice::Created {
                reservation_id: reservation.id,
                resource_id: reservation.resource.id(),
                requester_id: reservation.requester_id.clone(),
                span: reservation.span,
                quantity: reservation.quantity,
            }),
            Event::ReservationTransitioned {
                id,
                resource_id,
                to,
                cause,
                ..
            } => {
                let (reservation_id, resource_id) = (*id, *resource_id);
                Some(match (to, cause) {
                    (ReservationState::Approved, _) => Notice::Approved { reservation_id, resource_id },
                    (ReservationState::Rejected, _) => Notice::Rejected { reservation_id, resource_id },
                    (ReservationState::Cancelled, TransitionCause::AutoExpired) => {
                        Notice::AutoCancelled { reservation_id, resource_id }
                    }
                    (ReservationState::Cancelled, TransitionCause::Administrative) => {
                        Notice::Cancelled { reservation_id, resource_id }
                    }
                    (ReservationState::Pending, _) => return None,
                })
            }
            Event::ReservationEdited {
                id,
                resource_id,
                span,
                quantity,
                ..
            } => Some(Notice::Edited {
                reservation_id: *id,
                resource_id: *resource_id,
                span: *span,
                quantity: *quantity,
            }),
            _ => None,
        }
    }

    pub fn reservation_id(&self) -> Ulid {
        match self {
            Notice::Created { reservation_id, .. }
            | Notice::Approved { reservation_id, .. }
            | Notice::Rejected { reservation_id, .. }
            | Notice::Cancelled { reservation_id, .. }
            | Notice::AutoCancelled { reservation_id, .. }
            | Notice::Edited { reservation_id, .. } => *reservation_id,
        }
    }
}

/// Broadcast hub for reservation notices, per resource and global.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
    all: broadcast::Sender<Notice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notices for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to notices from every resource.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Publish the notice for a committed event, if it has one. No-op if
    /// nobody is listening.
    pub fn publish(&self, resource_id: Ulid, event: &Event) {
        let Some(notice) = Notice::from_event(event) else {
            return;
        };
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice);
    }

    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}
