//! Order-intent ledger
//!
//! The store is authoritative for intent state. Updates are guarded by the
//! allowed predecessor states, so a late or replayed update can never move
//! an intent backwards: terminal states are absorbing and CREATED is only
//! ever the first state.

use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use common::model::{IntentAction, IntentState, OrderIntent};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::str::FromStr;
use tracing::{debug, warn};

const SELECT_COLUMNS: &str = r"
    SELECT order_intent_id, run_id, cycle_id, mode, decision_id, symbol, action,
           client_order_id, intent_payload_json, state, exchange_order_id,
           exchange_oco_id, last_error_code, last_error_detail_redacted,
           created_at_ms, updated_at_ms
    FROM order_intents
";

/// Optional fields set alongside a state change; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionUpdate {
    /// Remote order id
    pub exchange_order_id: Option<String>,
    /// Remote OCO list id
    pub exchange_oco_id: Option<String>,
    /// Error code
    pub error_code: Option<String>,
    /// Error detail, already redacted
    pub error_detail: Option<String>,
}

impl TransitionUpdate {
    /// Carry a remote order id
    #[must_use]
    pub fn order_id(id: impl Into<String>) -> Self {
        Self {
            exchange_order_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Carry an error
    #[must_use]
    pub fn error(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_detail: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Persistence for `order_intents`
#[derive(Debug, Clone)]
pub struct IntentLedger {
    store: Store,
}

impl IntentLedger {
    /// Ledger over `store`
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert a CREATED intent unless one with the same id exists
    ///
    /// Returns the stored row and whether this call inserted it. An existing
    /// row is returned untouched whatever its state.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert or read-back fails.
    pub async fn insert_if_absent(&self, intent: &OrderIntent) -> StoreResult<(OrderIntent, bool)> {
        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO order_intents (
                order_intent_id, run_id, cycle_id, mode, decision_id, symbol, action,
                client_order_id, intent_payload_json, state, exchange_order_id,
                exchange_oco_id, last_error_code, last_error_detail_redacted,
                created_at_ms, updated_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&intent.order_intent_id)
        .bind(&intent.run_id)
        .bind(&intent.cycle_id)
        .bind(&intent.mode)
        .bind(&intent.decision_id)
        .bind(&intent.symbol)
        .bind(intent.action.as_str())
        .bind(&intent.client_order_id)
        .bind(&intent.intent_payload_json)
        .bind(intent.state.as_str())
        .bind(&intent.exchange_order_id)
        .bind(&intent.exchange_oco_id)
        .bind(&intent.last_error_code)
        .bind(&intent.last_error_detail_redacted)
        .bind(intent.created_at_ms)
        .bind(intent.updated_at_ms)
        .execute(self.store.pool())
        .await?;

        let inserted = result.rows_affected() == 1;
        let stored = self.get(&intent.order_intent_id).await?.ok_or_else(|| StoreError::InvalidRow {
            table: "order_intents",
            detail: format!("{} missing after insert", intent.order_intent_id),
        })?;
        if inserted {
            debug!(order_intent_id = %stored.order_intent_id, action = %stored.action, "intent created");
        } else {
            debug!(order_intent_id = %stored.order_intent_id, state = %stored.state, "intent reused");
        }
        Ok((stored, inserted))
    }

    /// Move `order_intent_id` to `next` if its current state allows it
    ///
    /// Returns `false` when the row is missing or the transition is not
    /// allowed from the stored state; nothing is written in that case.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn transition(
        &self,
        order_intent_id: &str,
        next: IntentState,
        update: &TransitionUpdate,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let allowed = IntentState::predecessors(next);
        if allowed.is_empty() {
            return Ok(false);
        }
        // Registry codes only, never user input
        let in_list = allowed
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r"
            UPDATE order_intents SET
                state = ?,
                exchange_order_id = COALESCE(?, exchange_order_id),
                exchange_oco_id = COALESCE(?, exchange_oco_id),
                last_error_code = COALESCE(?, last_error_code),
                last_error_detail_redacted = COALESCE(?, last_error_detail_redacted),
                updated_at_ms = ?
            WHERE order_intent_id = ? AND state IN ({in_list})
            "
        );
        let result = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(&update.exchange_order_id)
            .bind(&update.exchange_oco_id)
            .bind(&update.error_code)
            .bind(&update.error_detail)
            .bind(now_ms)
            .bind(order_intent_id)
            .execute(self.store.pool())
            .await?;

        let applied = result.rows_affected() == 1;
        if applied {
            debug!(order_intent_id, state = %next, "intent transitioned");
        } else {
            warn!(order_intent_id, state = %next, "intent transition refused");
        }
        Ok(applied)
    }

    /// Load one intent
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row holds unknown codes.
    pub async fn get(&self, order_intent_id: &str) -> StoreResult<Option<OrderIntent>> {
        let sql = format!("{SELECT_COLUMNS} WHERE order_intent_id = ?");
        let row = sqlx::query(&sql)
            .bind(order_intent_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(intent_from_row).transpose()
    }

    /// Load one intent by its exchange dedup id
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row holds unknown codes.
    pub async fn get_by_client_order_id(&self, client_order_id: &str) -> StoreResult<Option<OrderIntent>> {
        let sql = format!("{SELECT_COLUMNS} WHERE client_order_id = ?");
        let row = sqlx::query(&sql)
            .bind(client_order_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(intent_from_row).transpose()
    }

    /// Intents in any of `states`, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row holds unknown codes.
    pub async fn list_by_states(&self, states: &[IntentState]) -> StoreResult<Vec<OrderIntent>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!("{SELECT_COLUMNS} WHERE state IN ({placeholders}) ORDER BY created_at_ms ASC, order_intent_id ASC");
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter().map(intent_from_row).collect()
    }

    /// Intents for `symbol` with `action`, newest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row holds unknown codes.
    pub async fn list_for_symbol(&self, symbol: &str, action: IntentAction) -> StoreResult<Vec<OrderIntent>> {
        let sql = format!("{SELECT_COLUMNS} WHERE symbol = ? AND action = ? ORDER BY created_at_ms DESC, order_intent_id ASC");
        let rows = sqlx::query(&sql)
            .bind(symbol)
            .bind(action.as_str())
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(intent_from_row).collect()
    }

    /// Intents with `action` created in `[from_ms, to_ms)`, optionally for one symbol
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_created(
        &self,
        action: IntentAction,
        symbol: Option<&str>,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<i64> {
        let count: i64 = sqlx::query(
            r"
            SELECT COUNT(*) AS n FROM order_intents
            WHERE action = ? AND (? IS NULL OR symbol = ?)
              AND created_at_ms >= ? AND created_at_ms < ?
            ",
        )
        .bind(action.as_str())
        .bind(symbol)
        .bind(symbol)
        .bind(from_ms)
        .bind(to_ms)
        .fetch_one(self.store.pool())
        .await?
        .try_get("n")?;
        Ok(count)
    }

    /// Intents for `symbol` last updated into `state` at or after `from_ms`
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_in_state_since(&self, symbol: &str, state: IntentState, from_ms: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM order_intents WHERE symbol = ? AND state = ? AND updated_at_ms >= ?",
        )
        .bind(symbol)
        .bind(state.as_str())
        .bind(from_ms)
        .fetch_one(self.store.pool())
        .await?
        .try_get("n")?;
        Ok(count)
    }

    /// Intent counts per state for intents created in `[from_ms, to_ms)`
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row holds an unknown state.
    pub async fn counts_by_state(&self, from_ms: i64, to_ms: i64) -> StoreResult<Vec<(IntentState, i64)>> {
        let rows = sqlx::query(
            r"
            SELECT state, COUNT(*) AS n FROM order_intents
            WHERE created_at_ms >= ? AND created_at_ms < ?
            GROUP BY state ORDER BY state
            ",
        )
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<(IntentState, i64)> {
                let state: String = row.try_get("state")?;
                Ok((parse_code("state", &state)?, row.try_get("n")?))
            })
            .collect()
    }
}

fn parse_code<T: FromStr>(column: &str, value: &str) -> StoreResult<T> {
    value.parse().map_err(|_| StoreError::InvalidRow {
        table: "order_intents",
        detail: format!("{column} = {value:?}"),
    })
}

fn intent_from_row(row: &SqliteRow) -> StoreResult<OrderIntent> {
    let action: String = row.try_get("action")?;
    let state: String = row.try_get("state")?;
    Ok(OrderIntent {
        order_intent_id: row.try_get("order_intent_id")?,
        run_id: row.try_get("run_id")?,
        cycle_id: row.try_get("cycle_id")?,
        mode: row.try_get("mode")?,
        decision_id: row.try_get("decision_id")?,
        symbol: row.try_get("symbol")?,
        action: parse_code("action", &action)?,
        client_order_id: row.try_get("client_order_id")?,
        intent_payload_json: row.try_get("intent_payload_json")?,
        state: parse_code("state", &state)?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        exchange_oco_id: row.try_get("exchange_oco_id")?,
        last_error_code: row.try_get("last_error_code")?,
        last_error_detail_redacted: row.try_get("last_error_detail_redacted")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}
