use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ErrorClass, ReserveRequest, SlotQuery};
use crate::model::*;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// No definitive answer in time. The operation may or may not have
    /// committed; re-read before retrying.
    #[error("{op} timed out after {after:?}; outcome unknown")]
    Timeout { op: &'static str, after: Duration },
    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last: EngineError,
    },
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Engine(e) => e.class(),
            GatewayError::Timeout { .. } | GatewayError::RetriesExhausted { .. } => {
                ErrorClass::StoreUnavailable
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeRequest {
    pub location_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub date: NaiveDate,
    pub staff_id: Option<Ulid>,
    pub granularity_min: Option<u32>,
}

/// The slot a client picked from a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSelection {
    pub appointment_id: Ulid,
    pub staff_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub start: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client: ClientRef,
    pub channel: Channel,
    /// Telephony call id or similar; repeats with the same id are deduplicated.
    pub external_call_id: Option<String>,
}

/// The one capability every intake channel (web, voice, kiosk) needs.
#[async_trait]
pub trait BookingChannel: Send + Sync {
    async fn propose(&self, request: ProposeRequest) -> Result<Vec<TimeSlot>, GatewayError>;
    async fn confirm(
        &self,
        selection: SlotSelection,
        client: ClientInfo,
    ) -> Result<Appointment, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Total attempts, first one included.
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub op_timeout: Duration,
    pub default_granularity_min: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(50),
            op_timeout: Duration::from_secs(5),
            default_granularity_min: crate::limits::DEFAULT_GRANULARITY_MIN,
        }
    }
}

pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(crate::engine::now_ms)
}

/// Front door shared by every channel: bounded retries for transient store
/// failures, a deadline per call, and per-call-id idempotent confirms.
pub struct Gateway {
    engine: Arc<Engine>,
    config: GatewayConfig,
    clock: Clock,
    /// External call id → confirm in flight.
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl Gateway {
    pub fn new(engine: Arc<Engine>, config: GatewayConfig) -> Self {
        Self::with_clock(engine, config, system_clock())
    }

    pub fn with_clock(engine: Arc<Engine>, config: GatewayConfig, clock: Clock) -> Self {
        Self {
            engine,
            config,
            clock,
            inflight: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    /// Run an engine operation with the deadline and retry policy. Each
    /// attempt runs as its own task, so a deadline never cancels a commit
    /// halfway.
    pub async fn call<T, F, Fut>(&self, op: &'static str, mut attempt_fn: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnMut(Arc<Engine>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let task = tokio::spawn(attempt_fn(self.engine.clone()));
            let result = match tokio::time::timeout(self.config.op_timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(EngineError::StoreUnavailable(format!("{op} task failed: {join}"))),
                Err(_) => {
                    metrics::counter!(crate::observability::GATEWAY_TIMEOUTS_TOTAL, "op" => op)
                        .increment(1);
                    warn!("{op} timed out after {:?}", self.config.op_timeout);
                    return Err(GatewayError::Timeout {
                        op,
                        after: self.config.op_timeout,
                    });
                }
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    metrics::counter!(crate::observability::GATEWAY_RETRIES_TOTAL, "op" => op)
                        .increment(1);
                    warn!("{op} attempt {attempt}/{attempts} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(GatewayError::RetriesExhausted {
                        op,
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn move_appointment(
        &self,
        id: Ulid,
        new_start: Ms,
        new_staff_id: Option<Ulid>,
    ) -> Result<Appointment, GatewayError> {
        let now = self.now();
        self.call("move", move |engine| async move {
            engine.move_appointment(id, new_start, new_staff_id, now).await
        })
        .await
    }

    pub async fn transition(&self, id: Ulid, event: StatusEvent) -> Result<Appointment, GatewayError> {
        let now = self.now();
        self.call("transition", move |engine| async move {
            engine.transition(id, event, now).await
        })
        .await
    }

    async fn lock_call_id(&self, call_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let slot = self
            .inflight
            .entry(call_id.to_string())
            .or_default()
            .clone();
        slot.lock_owned().await
    }

    fn release_call_id(&self, call_id: &str) {
        // The map and the caller's guard hold the last two references.
        self.inflight
            .remove_if(call_id, |_, slot| Arc::strong_count(slot) <= 2);
    }

    async fn confirm_inner(
        &self,
        selection: SlotSelection,
        client: ClientInfo,
    ) -> Result<Appointment, GatewayError> {
        let call_id = client.external_call_id.clone();
        let now = self.now();
        let request = ReserveRequest {
            id: selection.appointment_id,
            staff_id: selection.staff_id,
            client: client.client,
            service_ids: selection.service_ids.clone(),
            start: selection.start,
            channel: client.channel,
            external_ref: client.external_call_id,
        };
        let mut contended = false;
        loop {
            if let Some(call_id) = &call_id
                && let Some(existing) = self.settled(call_id).await?
            {
                return Ok(replayed(call_id, &selection, existing));
            }
            let request = request.clone();
            let result = self
                .call("confirm", move |engine| {
                    let request = request.clone();
                    async move { engine.reserve(request, now).await }
                })
                .await;
            match result {
                // An earlier attempt with this call id held it, possibly one
                // that timed out on its caller. It has settled by the next pass.
                Err(GatewayError::Engine(EngineError::DuplicateExternalRef(_)))
                    if call_id.is_some() && !contended =>
                {
                    contended = true;
                }
                other => return other,
            }
        }
    }

    /// The appointment for `call_id` once no booking holds it in flight.
    async fn settled(&self, call_id: &str) -> Result<Option<Appointment>, GatewayError> {
        tokio::time::timeout(
            self.config.op_timeout,
            self.engine.store.settled_external_ref(call_id),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            op: "confirm",
            after: self.config.op_timeout,
        })
    }
}

fn replayed(call_id: &str, selection: &SlotSelection, existing: Appointment) -> Appointment {
    if existing.staff_id != selection.staff_id
        || existing.span.start != selection.start
        || existing.service_ids != selection.service_ids
    {
        warn!(
            "call {call_id} re-confirmed with a different slot; returning original {}",
            existing.id
        );
    }
    metrics::counter!(crate::observability::IDEMPOTENT_REPLAYS_TOTAL).increment(1);
    existing
}

#[async_trait]
impl BookingChannel for Gateway {
    async fn propose(&self, request: ProposeRequest) -> Result<Vec<TimeSlot>, GatewayError> {
        let query = SlotQuery {
            location_id: request.location_id,
            service_ids: request.service_ids,
            date: request.date,
            staff_id: request.staff_id,
            granularity_min: request
                .granularity_min
                .unwrap_or(self.config.default_granularity_min),
        };
        let now = self.now();
        self.call("propose", move |engine| {
            let query = query.clone();
            async move { engine.get_slots(&query, now).await }
        })
        .await
    }

    async fn confirm(
        &self,
        selection: SlotSelection,
        client: ClientInfo,
    ) -> Result<Appointment, GatewayError> {
        let Some(call_id) = client.external_call_id.clone() else {
            return self.confirm_inner(selection, client).await;
        };
        let guard = self.lock_call_id(&call_id).await;
        let result = self.confirm_inner(selection, client).await;
        self.release_call_id(&call_id);
        drop(guard);
        result
    }
}
