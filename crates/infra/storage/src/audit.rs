//! Audit writer
//!
//! Producers hand records to a bounded channel; one drain task persists each
//! record to `audit_events` and then to the day file, in enqueue order, and
//! only then acknowledges the producer. A saturated queue fails fast instead
//! of blocking the caller.

use crate::dayfile::DayFileWriter;
use crate::error::{AuditError, StoreResult};
use crate::store::Store;
use common::canonical::canonical_json;
use common::config::AuditConfig;
use common::ids::validate_correlation_id;
use common::reason::validate_reasons;
use common::{Clock, CommonError, EventType, ReasonCode, Stage, MODE_LIVE};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Envelope keys; a payload may not reuse any of them
pub const RESERVED_KEYS: &[&str] = &[
    "ts_ms",
    "run_id",
    "cycle_id",
    "mode",
    "stage",
    "event_type",
    "reasons",
    "snapshot_id",
    "decision_id",
    "order_intent_id",
    "exchange_time_ms",
    "local_received_ms",
];

/// One audit event: envelope plus free-form payload
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Event time
    pub ts_ms: i64,
    /// Process run
    pub run_id: String,
    /// Cycle
    pub cycle_id: String,
    /// Always `LIVE`
    pub mode: String,
    /// Stage emitting the event
    pub stage: Stage,
    /// Event type
    pub event_type: EventType,
    /// Non-empty reason list
    pub reasons: Vec<ReasonCode>,
    /// Related snapshot
    pub snapshot_id: Option<String>,
    /// Related decision
    pub decision_id: Option<String>,
    /// Related order intent
    pub order_intent_id: Option<String>,
    /// Exchange time of the data that triggered the event
    pub exchange_time_ms: Option<i64>,
    /// Local receive time of that data
    pub local_received_ms: Option<i64>,
    /// Event payload
    pub data: Map<String, Value>,
}

impl AuditRecord {
    /// Envelope with an empty payload
    #[must_use]
    pub fn new(
        ts_ms: i64,
        run_id: &str,
        cycle_id: &str,
        stage: Stage,
        event_type: EventType,
        reasons: Vec<ReasonCode>,
    ) -> Self {
        Self {
            ts_ms,
            run_id: run_id.to_string(),
            cycle_id: cycle_id.to_string(),
            mode: MODE_LIVE.to_string(),
            stage,
            event_type,
            reasons,
            snapshot_id: None,
            decision_id: None,
            order_intent_id: None,
            exchange_time_ms: None,
            local_received_ms: None,
            data: Map::new(),
        }
    }

    /// Attach a snapshot id
    #[must_use]
    pub fn with_snapshot(mut self, snapshot_id: &str) -> Self {
        self.snapshot_id = Some(snapshot_id.to_string());
        self
    }

    /// Attach a decision id
    #[must_use]
    pub fn with_decision(mut self, decision_id: &str) -> Self {
        self.decision_id = Some(decision_id.to_string());
        self
    }

    /// Attach an order-intent id
    #[must_use]
    pub fn with_intent(mut self, order_intent_id: &str) -> Self {
        self.order_intent_id = Some(order_intent_id.to_string());
        self
    }

    /// Attach exchange and local receive times
    #[must_use]
    pub const fn with_times(mut self, exchange_time_ms: i64, local_received_ms: i64) -> Self {
        self.exchange_time_ms = Some(exchange_time_ms);
        self.local_received_ms = Some(local_received_ms);
        self
    }

    /// Merge an object into the payload; a non-object lands under `value`
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        match data {
            Value::Object(map) => self.data.extend(map),
            Value::Null => {}
            other => {
                self.data.insert("value".to_string(), other);
            }
        }
        self
    }

    /// Set one payload field
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Check the envelope and that no payload key shadows it
    ///
    /// # Errors
    ///
    /// Returns an error on a non-positive timestamp, malformed ids, a mode
    /// other than `LIVE`, an empty reason list or a reserved payload key.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.ts_ms <= 0 {
            return Err(CommonError::InvalidTimestamp(self.ts_ms).into());
        }
        validate_correlation_id("run_id", &self.run_id)?;
        validate_correlation_id("cycle_id", &self.cycle_id)?;
        if self.mode != MODE_LIVE {
            return Err(CommonError::schema("mode", format!("expected LIVE, got {:?}", self.mode)).into());
        }
        validate_reasons(&self.reasons)?;
        for (field, id) in [
            ("snapshot_id", &self.snapshot_id),
            ("decision_id", &self.decision_id),
            ("order_intent_id", &self.order_intent_id),
        ] {
            if let Some(id) = id {
                validate_correlation_id(field, id)?;
            }
        }
        if let Some(key) = self.data.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(AuditError::ReservedKey(key.clone()));
        }
        Ok(())
    }

    /// Canonical JSON of the payload alone (the `data_json` column)
    ///
    /// # Errors
    ///
    /// Returns an error if the payload holds a non-finite number.
    pub fn data_json(&self) -> Result<String, CommonError> {
        canonical_json(&Value::Object(self.data.clone()))
    }

    /// Canonical JSON line: envelope fields merged with the payload
    ///
    /// # Errors
    ///
    /// Returns an error if the payload holds a non-finite number.
    pub fn to_line(&self) -> Result<String, CommonError> {
        let mut obj = self.data.clone();
        obj.insert("ts_ms".into(), self.ts_ms.into());
        obj.insert("run_id".into(), self.run_id.clone().into());
        obj.insert("cycle_id".into(), self.cycle_id.clone().into());
        obj.insert("mode".into(), self.mode.clone().into());
        obj.insert("stage".into(), self.stage.as_str().into());
        obj.insert("event_type".into(), self.event_type.as_str().into());
        obj.insert("reasons".into(), ReasonCode::to_strings(&self.reasons).into());
        let optional = [
            ("snapshot_id", self.snapshot_id.clone().map(Value::from)),
            ("decision_id", self.decision_id.clone().map(Value::from)),
            ("order_intent_id", self.order_intent_id.clone().map(Value::from)),
            ("exchange_time_ms", self.exchange_time_ms.map(Value::from)),
            ("local_received_ms", self.local_received_ms.map(Value::from)),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                obj.insert(key.into(), v);
            }
        }
        canonical_json(&Value::Object(obj))
    }
}

/// Queue occupancy and writer lag, fed to the health evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditStats {
    /// Records enqueued and not yet persisted
    pub queue_len: usize,
    /// Bounded queue size
    pub capacity: usize,
    /// Occupancy at which health degrades
    pub hi_watermark: usize,
    /// Enqueue-to-ack latency of the last persisted record
    pub lag_ms: u64,
    /// Records persisted to both sinks
    pub written: u64,
    /// Records that failed either sink
    pub failed: u64,
}

impl AuditStats {
    /// Occupancy as a whole percentage
    #[must_use]
    pub fn queue_pct(&self) -> u64 {
        if self.capacity == 0 {
            return 100;
        }
        (self.queue_len as u64 * 100) / self.capacity as u64
    }
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    lag_ms: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

struct Envelope {
    record: AuditRecord,
    enqueued: Instant,
    ack: oneshot::Sender<Result<(), AuditError>>,
}

/// Handle on a record already in the queue
#[must_use = "the record is not known to be durable until the ticket resolves"]
pub struct AuditTicket {
    rx: oneshot::Receiver<Result<(), AuditError>>,
}

impl AuditTicket {
    /// Wait until the record is in both sinks
    ///
    /// # Errors
    ///
    /// Returns the persistence error, or writer-closed if the drain task went away.
    pub async fn wait(self) -> Result<(), AuditError> {
        self.rx.await.map_err(|_| AuditError::WriterClosed)?
    }
}

/// Producer side of the audit pipeline
pub struct AuditWriter {
    tx: mpsc::Sender<Envelope>,
    counters: Arc<Counters>,
    capacity: usize,
    hi_watermark: usize,
    shutdown: Arc<Notify>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl AuditWriter {
    /// Open the day-file directory and start the drain task
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn spawn(store: Store, dir: &Path, cfg: &AuditConfig, clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        let day_files = DayFileWriter::new(dir).await?;
        let capacity = cfg.audit_writer_queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(Notify::new());

        let drain = Drain {
            store,
            day_files,
            clock,
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(drain.run(rx, Arc::clone(&shutdown)));
        info!(dir = %dir.display(), capacity, "audit writer started");

        Ok(Self {
            tx,
            counters,
            capacity,
            hi_watermark: cfg.audit_writer_queue_hi_watermark,
            shutdown,
            drain: Mutex::new(Some(handle)),
        })
    }

    /// Validate and enqueue without waiting for persistence
    ///
    /// # Errors
    ///
    /// Returns an error if the record is invalid, the queue is full or the
    /// writer has shut down.
    pub fn enqueue(&self, record: AuditRecord) -> Result<AuditTicket, AuditError> {
        record.validate()?;
        let (ack, rx) = oneshot::channel();
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            record,
            enqueued: Instant::now(),
            ack,
        };
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(AuditTicket { rx }),
            Err(TrySendError::Full(_)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                warn!(capacity = self.capacity, "audit queue full");
                Err(AuditError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                Err(AuditError::WriterClosed)
            }
        }
    }

    /// Enqueue and wait until the record is durable in both sinks
    ///
    /// # Errors
    ///
    /// Returns an error if enqueueing fails or either sink rejects the record.
    pub async fn write(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.enqueue(record)?.wait().await
    }

    /// Current queue occupancy and lag
    #[must_use]
    pub fn stats(&self) -> AuditStats {
        AuditStats {
            queue_len: self.counters.pending.load(Ordering::SeqCst),
            capacity: self.capacity,
            hi_watermark: self.hi_watermark,
            lag_ms: self.counters.lag_ms.load(Ordering::SeqCst),
            written: self.counters.written.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting records, persist everything already queued and close
    /// the day file
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let handle = self.drain.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "audit drain task panicked");
            }
        }
    }
}

struct Drain {
    store: Store,
    day_files: DayFileWriter,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl Drain {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(envelope) => self.handle(envelope).await,
                    None => break,
                },
                () = shutdown.notified() => {
                    rx.close();
                    while let Some(envelope) = rx.recv().await {
                        self.handle(envelope).await;
                    }
                    break;
                }
            }
        }
        if let Err(e) = self.day_files.close().await {
            error!(error = %e, "closing audit day file failed");
        }
        info!(written = self.counters.written.load(Ordering::SeqCst), "audit writer stopped");
    }

    async fn handle(&mut self, envelope: Envelope) {
        let Envelope { record, enqueued, ack } = envelope;
        let result = self.persist(&record).await;
        self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        let lag = u64::try_from(enqueued.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.counters.lag_ms.store(lag, Ordering::SeqCst);
        match &result {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::SeqCst);
                debug!(event_type = %record.event_type, stage = %record.stage, lag_ms = lag, "audit persisted");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(event_type = %record.event_type, error = %e, "audit persist failed");
            }
        }
        // Producer may have stopped waiting
        let _ = ack.send(result);
    }

    async fn persist(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        let data_json = record.data_json()?;
        let line = record.to_line()?;
        insert_event(&self.store, record, &data_json, self.clock.now_ms()).await?;
        self.day_files.append(record.ts_ms, &line).await?;
        Ok(())
    }
}

async fn insert_event(store: &Store, record: &AuditRecord, data_json: &str, created_at_ms: i64) -> StoreResult<()> {
    let reasons_json = serde_json::to_string(&ReasonCode::to_strings(&record.reasons))?;
    sqlx::query(
        r"
        INSERT INTO audit_events (
            ts_ms, run_id, cycle_id, mode, stage, event_type, reasons_json,
            snapshot_id, decision_id, order_intent_id, exchange_time_ms,
            local_received_ms, data_json, created_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(record.ts_ms)
    .bind(&record.run_id)
    .bind(&record.cycle_id)
    .bind(&record.mode)
    .bind(record.stage.as_str())
    .bind(record.event_type.as_str())
    .bind(reasons_json)
    .bind(&record.snapshot_id)
    .bind(&record.decision_id)
    .bind(&record.order_intent_id)
    .bind(record.exchange_time_ms)
    .bind(record.local_received_ms)
    .bind(data_json)
    .bind(created_at_ms)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Row of `audit_events` as read back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAuditEvent {
    /// Insert order
    pub id: i64,
    /// Event time
    pub ts_ms: i64,
    /// Process run
    pub run_id: String,
    /// Cycle
    pub cycle_id: String,
    /// Stage label
    pub stage: String,
    /// Event type label
    pub event_type: String,
    /// Reason codes
    pub reasons: Vec<String>,
    /// Related decision
    pub decision_id: Option<String>,
    /// Related order intent
    pub order_intent_id: Option<String>,
    /// Canonical payload
    pub data_json: String,
}

/// Every event of a run in insert order
///
/// # Errors
///
/// Returns an error if the query fails or a reason list does not decode.
pub async fn events_for_run(store: &Store, run_id: &str) -> StoreResult<Vec<StoredAuditEvent>> {
    let rows = sqlx::query(
        r"
        SELECT id, ts_ms, run_id, cycle_id, stage, event_type, reasons_json,
               decision_id, order_intent_id, data_json
        FROM audit_events
        WHERE run_id = ?
        ORDER BY id ASC
        ",
    )
    .bind(run_id)
    .fetch_all(store.pool())
    .await?;

    rows.iter()
        .map(|row| -> StoreResult<StoredAuditEvent> {
            let reasons_json: String = row.try_get("reasons_json")?;
            Ok(StoredAuditEvent {
                id: row.try_get("id")?,
                ts_ms: row.try_get("ts_ms")?,
                run_id: row.try_get("run_id")?,
                cycle_id: row.try_get("cycle_id")?,
                stage: row.try_get("stage")?,
                event_type: row.try_get("event_type")?,
                reasons: serde_json::from_str(&reasons_json)?,
                decision_id: row.try_get("decision_id")?,
                order_intent_id: row.try_get("order_intent_id")?,
                data_json: row.try_get("data_json")?,
            })
        })
        .collect()
}

/// Number of events of one type with `from_ms <= ts_ms < to_ms`
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn count_events(store: &Store, event_type: EventType, from_ms: i64, to_ms: i64) -> StoreResult<i64> {
    let count: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM audit_events WHERE event_type = ? AND ts_ms >= ? AND ts_ms < ?",
    )
    .bind(event_type.as_str())
    .bind(from_ms)
    .bind(to_ms)
    .fetch_one(store.pool())
    .await?
    .try_get("n")?;
    Ok(count)
}

/// Number of events of one type carrying `reason`, with `from_ms <= ts_ms < to_ms`
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn count_events_with_reason(
    store: &Store,
    event_type: EventType,
    reason: ReasonCode,
    from_ms: i64,
    to_ms: i64,
) -> StoreResult<i64> {
    let count: i64 = sqlx::query(
        r"
        SELECT COUNT(*) AS n FROM audit_events
        WHERE event_type = ? AND ts_ms >= ? AND ts_ms < ?
          AND EXISTS (SELECT 1 FROM json_each(audit_events.reasons_json) WHERE json_each.value = ?)
        ",
    )
    .bind(event_type.as_str())
    .bind(from_ms)
    .bind(to_ms)
    .bind(reason.as_str())
    .fetch_one(store.pool())
    .await?
    .try_get("n")?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> AuditRecord {
        AuditRecord::new(
            1_700_000_000_000,
            "run_20231114_221320_000001",
            "cyc_20231114_221320_000002",
            Stage::Boot,
            EventType::StageChanged,
            vec![ReasonCode::StageOk],
        )
    }

    #[test]
    fn test_reserved_payload_key_rejected() {
        let err = record().with_field("cycle_id", "x").validate().unwrap_err();
        assert!(matches!(err, AuditError::ReservedKey(ref k) if k == "cycle_id"));
    }

    #[test]
    fn test_empty_reasons_rejected() {
        let mut r = record();
        r.reasons.clear();
        assert!(matches!(r.validate(), Err(AuditError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_bad_envelope_rejected() {
        let mut r = record();
        r.ts_ms = 0;
        assert!(r.validate().is_err());

        let mut r = record();
        r.run_id = "run id".into();
        assert!(r.validate().is_err());

        let mut r = record();
        r.mode = "PAPER".into();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_line_merges_envelope_and_payload() {
        let r = record().with_data(json!({"z": 1, "a": "x"})).with_decision("dec_1");
        let line = r.to_line().unwrap();
        assert!(line.starts_with(r#"{"a":"x","cycle_id":"cyc_20231114_221320_000002","decision_id":"dec_1","#));
        assert!(line.ends_with(r#""ts_ms":1700000000000,"z":1}"#));
        assert_eq!(r.data_json().unwrap(), r#"{"a":"x","z":1}"#);
    }

    #[test]
    fn test_queue_pct() {
        let s = AuditStats {
            queue_len: 6,
            capacity: 8,
            hi_watermark: 6,
            lag_ms: 0,
            written: 0,
            failed: 0,
        };
        assert_eq!(s.queue_pct(), 75);
    }
}
