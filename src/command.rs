//! JSON command surface of the host binary: one `Command` per input line,
//! one response object per output line.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    CreateResource {
        /// Generated when absent.
        id: Option<Ulid>,
        name: Option<String>,
        location: Option<String>,
        kind: ResourceKind,
    },
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        location: Option<String>,
        total_capacity: Option<u32>,
    },
    SetResourceActive {
        id: Ulid,
        active: bool,
    },
    GetResource {
        id: Ulid,
    },
    ListResources,
    Submit(SubmitRequest),
    Approve {
        id: Ulid,
    },
    Reject {
        id: Ulid,
    },
    Cancel {
        id: Ulid,
    },
    Edit {
        id: Ulid,
        start: Ms,
        end: Ms,
        quantity: u32,
    },
    GetReservation {
        id: Ulid,
    },
    ListByResource {
        resource_id: Ulid,
        #[serde(default)]
        filter: StateFilter,
    },
    ListPending,
    GetRequester {
        national_id: String,
    },
    GlobalAvailable {
        asset_id: Ulid,
    },
    WindowAvailable {
        asset_id: Ulid,
        start: Ms,
        end: Ms,
    },
    Conflicts {
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    FreeWindows {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        #[serde(default = "one")]
        quantity: u32,
    },
    Compact,
}

fn one() -> u32 {
    1
}

pub fn parse(line: &str) -> Result<Command, serde_json::Error> {
    serde_json::from_str(line)
}

fn ok(data: impl serde::Serialize) -> Value {
    json!({ "ok": true, "data": data })
}

/// Error response. Feasibility rejections carry the resource, the requested
/// interval and their numbers so a client can show what is left or what
/// collides.
pub fn error_response(e: &EngineError) -> Value {
    let mut body = json!({
        "ok": false,
        "error": e.kind(),
        "message": e.to_string(),
    });
    match e {
        EngineError::InsufficientStock {
            resource_id,
            span,
            requested,
            available,
        } => {
            body["resource_id"] = json!(resource_id);
            if let Some(span) = span {
                body["start"] = json!(span.start);
                body["end"] = json!(span.end);
            }
            body["requested"] = json!(requested);
            body["available"] = json!(available);
        }
        EngineError::ConflictDetected {
            resource_id,
            span,
            conflicting,
        } => {
            body["resource_id"] = json!(resource_id);
            body["start"] = json!(span.start);
            body["end"] = json!(span.end);
            body["conflicting"] = json!(conflicting);
        }
        _ => {}
    }
    body
}

pub fn parse_error_response(e: &serde_json::Error) -> Value {
    json!({ "ok": false, "error": "bad_command", "message": e.to_string() })
}

pub async fn execute(engine: &Engine, cmd: Command) -> Value {
    let result = dispatch(engine, cmd).await;
    match result {
        Ok(v) => v,
        Err(e) => {
            if e.is_feasibility() {
                warn!("rejected: {e}");
            }
            error_response(&e)
        }
    }
}

async fn dispatch(engine: &Engine, cmd: Command) -> Result<Value, EngineError> {
    Ok(match cmd {
        Command::CreateResource {
            id,
            name,
            location,
            kind,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            engine.create_resource(id, name, location, kind).await?;
            ok(engine.get_resource_info(id).await?)
        }
        Command::UpdateResource {
            id,
            name,
            location,
            total_capacity,
        } => {
            engine.update_resource(id, name, location, total_capacity).await?;
            ok(engine.get_resource_info(id).await?)
        }
        Command::SetResourceActive { id, active } => {
            engine.set_resource_active(id, active).await?;
            ok(engine.get_resource_info(id).await?)
        }
        Command::GetResource { id } => ok(engine.get_resource_info(id).await?),
        Command::ListResources => ok(engine.list_resources().await),
        Command::Submit(req) => ok(engine.submit(req).await?),
        Command::Approve { id } => ok(engine.approve(id).await?),
        Command::Reject { id } => ok(engine.reject(id).await?),
        Command::Cancel { id } => ok(engine.cancel(id).await?),
        Command::Edit {
            id,
            start,
            end,
            quantity,
        } => ok(engine.edit(id, start, end, quantity).await?),
        Command::GetReservation { id } => ok(engine.get_reservation(id).await?),
        Command::ListByResource { resource_id, filter } => {
            ok(engine.list_by_resource(resource_id, filter).await?)
        }
        Command::ListPending => ok(engine.list_pending().await?),
        Command::GetRequester { national_id } => {
            ok(engine.get_requester(&normalize_identity(&national_id)))
        }
        Command::GlobalAvailable { asset_id } => ok(engine.global_available(asset_id).await?),
        Command::WindowAvailable { asset_id, start, end } => {
            ok(engine.window_available(asset_id, start, end).await?)
        }
        Command::Conflicts {
            space_id,
            start,
            end,
            exclude,
        } => ok(engine.conflicts(space_id, start, end, exclude).await?),
        Command::FreeWindows {
            resource_id,
            start,
            end,
            quantity,
        } => ok(engine.free_windows(resource_id, start, end, quantity).await?),
        Command::Compact => {
            engine.compact_wal().await?;
            ok(Value::Null)
        }
    })
}
