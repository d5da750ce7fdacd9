//! Line-delimited JSON protocol for front-end services.
//!
//! Every line is one JSON object. The first request on a connection must be
//! `{"op":"auth",...}`; after that requests are answered in order. A `subscribe`
//! request additionally interleaves `{"type":"event",...}` lines as lifecycle
//! events happen.

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::{Authenticator, Role};
use crate::clock::WeekId;
use crate::engine::{Engine, EngineError, Requester};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{self, request_label};
use crate::store::{StoreError, WalStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth {
        password: String,
    },
    Create {
        requester: String,
        machine_id: Ulid,
        category: Category,
        /// Local calendar date of the slot.
        date: NaiveDate,
        /// `HH:MM - HH:MM`, local.
        slot: String,
    },
    Cancel {
        requester: String,
        reservation_id: Ulid,
    },
    ListActive {
        #[serde(default)]
        requester: Option<String>,
    },
    Quota {
        requester: String,
        category: Category,
        /// Any date inside the ISO week of interest.
        date: NaiveDate,
    },
    Machines,
    RegisterMachine {
        name: String,
        category: Category,
    },
    Subscribe {
        #[serde(default)]
        machine_id: Option<Ulid>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Authenticated {
        admin: bool,
    },
    Reservation {
        reservation: Reservation,
    },
    Cancelled {
        reservation: Reservation,
        /// True when the reservation had already been cancelled before.
        noop: bool,
    },
    Reservations {
        reservations: Vec<Reservation>,
    },
    Quota {
        category: Category,
        week: String,
        used: u32,
        remaining: u32,
        limit: u32,
    },
    Machines {
        machines: Vec<Machine>,
    },
    Machine {
        machine: Machine,
    },
    Subscribed {
        machine_id: Option<Ulid>,
    },
    Event {
        event: LifecycleEvent,
    },
    Error {
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl Response {
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Response::Error {
            kind: kind.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::AlreadyExists(_) => Response::error("AlreadyExists", e.to_string()),
        StoreError::LimitExceeded(_) => Response::error("LimitExceeded", e.to_string()),
        other => EngineError::from(other).into(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shared by every connection of one daemon.
pub struct ServerContext {
    pub engine: Arc<Engine>,
    /// Target of admin `register_machine`.
    pub registry: Arc<WalStore>,
    pub auth: Authenticator,
}

type Lines<S> = Framed<S, LinesCodec>;

async fn send<S>(framed: &mut Lines<S>, response: &Response) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(serde_json::to_string(response)?).await?;
    Ok(())
}

/// Serve one client until it hangs up.
pub async fn process_connection<S>(socket: S, ctx: Arc<ServerContext>) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let Some(role) = handshake(&mut framed, &ctx.auth).await? else {
        return Ok(());
    };
    let session = Session { ctx, role };
    let mut events: Option<BoxStream<'static, LifecycleEvent>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        send(&mut framed, &Response::error("BadRequest", "line too long")).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Request>(&line) {
                    Err(e) => Response::error("BadRequest", e.to_string()),
                    Ok(Request::Subscribe { machine_id }) => {
                        let stream = match machine_id {
                            Some(id) => session.ctx.engine.machine_events(id).await,
                            None => Ok(session.ctx.engine.events()),
                        };
                        match stream {
                            Ok(stream) => {
                                events = Some(stream);
                                Response::Subscribed { machine_id }
                            }
                            Err(e) => e.into(),
                        }
                    }
                    Ok(request) => session.dispatch(request).await,
                };
                send(&mut framed, &response).await?;
            }
            event = next_event(&mut events) => match event {
                Some(event) => send(&mut framed, &Response::Event { event }).await?,
                None => events = None,
            },
        }
    }
    Ok(())
}

async fn next_event(events: &mut Option<BoxStream<'static, LifecycleEvent>>) -> Option<LifecycleEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Read the auth line. `None` means the connection should be closed.
async fn handshake<S>(framed: &mut Lines<S>, auth: &Authenticator) -> Result<Option<Role>, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match framed.next().await {
        None => return Ok(None),
        Some(Ok(line)) => line,
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            send(framed, &Response::error("BadRequest", "line too long")).await?;
            return Ok(None);
        }
        Some(Err(e)) => return Err(e.into()),
    };
    let role = match serde_json::from_str::<Request>(&line) {
        Ok(Request::Auth { password }) => auth.authenticate(&password),
        _ => {
            send(framed, &Response::error("Unauthenticated", "first request must be auth")).await?;
            return Ok(None);
        }
    };
    match role {
        Some(role) => {
            debug!(?role, "session authenticated");
            send(framed, &Response::Authenticated { admin: role.is_admin() }).await?;
            Ok(Some(role))
        }
        None => {
            warn!("authentication failed");
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            send(framed, &Response::error("Unauthenticated", "bad password")).await?;
            Ok(None)
        }
    }
}

struct Session {
    ctx: Arc<ServerContext>,
    role: Role,
}

impl Session {
    async fn dispatch(&self, request: Request) -> Response {
        let op = request_label(&request);
        let started = Instant::now();
        let response = self.execute(request).await;
        let status = if response.is_error() { "error" } else { "ok" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        response
    }

    async fn execute(&self, request: Request) -> Response {
        let engine = &self.ctx.engine;
        match request {
            Request::Create {
                requester,
                machine_id,
                category,
                date,
                slot,
            } => engine
                .book(&Requester::member(requester), machine_id, category, date, &slot)
                .await
                .map_or_else(Response::from, |reservation| Response::Reservation { reservation }),
            Request::Cancel {
                requester,
                reservation_id,
            } => {
                let requester = Requester {
                    id: requester,
                    admin: self.role.is_admin(),
                };
                match engine.cancel(reservation_id, &requester).await {
                    Ok(outcome) => Response::Cancelled {
                        noop: outcome.was_noop(),
                        reservation: outcome.into_reservation(),
                    },
                    Err(e) => e.into(),
                }
            }
            Request::ListActive { requester } => engine
                .list_active(requester.as_deref())
                .await
                .map_or_else(Response::from, |reservations| Response::Reservations { reservations }),
            Request::Quota {
                requester,
                category,
                date,
            } => match engine.quota_status(&requester, category, WeekId::of_date(date)).await {
                Ok(status) => Response::Quota {
                    category,
                    week: status.week.to_string(),
                    used: status.used,
                    remaining: status.remaining,
                    limit: status.limit,
                },
                Err(e) => e.into(),
            },
            Request::Machines => engine
                .machines()
                .await
                .map_or_else(Response::from, |machines| Response::Machines { machines }),
            Request::RegisterMachine { name, category } => {
                if !self.role.is_admin() {
                    return Response::error("Forbidden", "register_machine needs an admin session");
                }
                match self.ctx.registry.register_machine(name, category).await {
                    Ok(machine) => Response::Machine { machine },
                    Err(e) => store_error(e),
                }
            }
            Request::Auth { .. } => Response::error("BadRequest", "already authenticated"),
            // Handled by the connection loop.
            Request::Subscribe { machine_id } => Response::Subscribed { machine_id },
        }
    }
}
