//! Selection tables: universe eligibility, rankings and the top-K set

use crate::error::StoreResult;
use crate::store::Store;
use common::ReasonCode;
use sqlx::Row;

/// Which ranking pass produced a `cycle_rankings` row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingStage {
    /// Top-N liquidity/momentum/spread rank
    TopN,
    /// Deep-scan score
    Deep,
}

impl RankingStage {
    /// Column value
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TopN => "TOPN",
            Self::Deep => "DEEP",
        }
    }
}

/// Eligibility verdict for one symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniverseScanRow {
    /// Symbol
    pub symbol: String,
    /// Passed every eligibility floor
    pub eligible: bool,
    /// Why (or why not)
    pub reasons: Vec<ReasonCode>,
    /// 24h quote volume as a decimal string
    pub quote_volume: String,
    /// 24h trades
    pub trade_count: i64,
    /// 24h price change
    pub price_change_bps: i64,
}

/// One ranked symbol
#[derive(Debug, Clone, PartialEq)]
pub struct RankingRow {
    /// 1-based position
    pub rank: i64,
    /// Symbol
    pub symbol: String,
    /// Composite score
    pub score_x10000: i64,
    /// Component breakdown
    pub components: serde_json::Value,
}

/// One member of the top-K selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRow {
    /// 1-based position
    pub rank: i64,
    /// Symbol
    pub symbol: String,
    /// Deep-scan score
    pub score_x10000: i64,
    /// Selection reasons
    pub reasons: Vec<ReasonCode>,
}

/// Writer for the three selection tables of one cycle
#[derive(Debug, Clone)]
pub struct SelectionLog {
    store: Store,
}

impl SelectionLog {
    /// Log over `store`
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record universe verdicts; re-recording a (cycle, symbol) is ignored
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; the batch is rolled back.
    pub async fn record_universe(
        &self,
        run_id: &str,
        cycle_id: &str,
        rows: &[UniverseScanRow],
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut tx = self.store.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r"
                INSERT OR IGNORE INTO universe_scans (
                    run_id, cycle_id, symbol, eligible, reasons_json, quote_volume,
                    trade_count, price_change_bps, created_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(run_id)
            .bind(cycle_id)
            .bind(&row.symbol)
            .bind(row.eligible)
            .bind(serde_json::to_string(&ReasonCode::to_strings(&row.reasons))?)
            .bind(&row.quote_volume)
            .bind(row.trade_count)
            .bind(row.price_change_bps)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record one ranking pass
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails; the batch is rolled back.
    pub async fn record_ranking(
        &self,
        run_id: &str,
        cycle_id: &str,
        stage: RankingStage,
        rows: &[RankingRow],
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut tx = self.store.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r"
                INSERT OR IGNORE INTO cycle_rankings (
                    run_id, cycle_id, ranking_stage, rank, symbol, score_x10000,
                    components_json, created_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(run_id)
            .bind(cycle_id)
            .bind(stage.as_str())
            .bind(row.rank)
            .bind(&row.symbol)
            .bind(row.score_x10000)
            .bind(common::canonical_json(&row.components)?)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record the top-K set; every symbol must already have a universe row
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails, including a foreign-key
    /// violation; the batch is rolled back.
    pub async fn record_selection(
        &self,
        run_id: &str,
        cycle_id: &str,
        rows: &[SelectionRow],
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut tx = self.store.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r"
                INSERT OR IGNORE INTO cycle_selections (
                    run_id, cycle_id, rank, symbol, score_x10000, reasons_json, created_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(run_id)
            .bind(cycle_id)
            .bind(row.rank)
            .bind(&row.symbol)
            .bind(row.score_x10000)
            .bind(serde_json::to_string(&ReasonCode::to_strings(&row.reasons))?)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Symbols selected in `cycle_id`, by rank
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn selected_symbols(&self, cycle_id: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT symbol FROM cycle_selections WHERE cycle_id = ? ORDER BY rank ASC")
            .bind(cycle_id)
            .fetch_all(self.store.pool())
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("symbol").map_err(Into::into))
            .collect()
    }
}
