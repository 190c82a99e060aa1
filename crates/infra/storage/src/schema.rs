//! Versioned schema
//!
//! Column order is fixed; new columns only ever arrive in new migrations.

/// One migration: version and its statements, applied in a single transaction
pub struct Migration {
    /// Monotone version
    pub version: i64,
    /// Human label
    pub name: &'static str,
    /// DDL statements
    pub statements: &'static [&'static str],
}

/// Tables the agent cannot run without
pub const REQUIRED_TABLES: &[&str] = &[
    "audit_events",
    "ai_gate_events",
    "order_intents",
    "universe_scans",
    "cycle_rankings",
    "cycle_selections",
];

/// Every migration in order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "audit_and_intents",
        statements: &[
            r"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL CHECK (ts_ms > 0),
                run_id TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                stage TEXT NOT NULL,
                event_type TEXT NOT NULL,
                reasons_json TEXT NOT NULL,
                snapshot_id TEXT,
                decision_id TEXT,
                order_intent_id TEXT,
                exchange_time_ms INTEGER,
                local_received_ms INTEGER,
                data_json TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            )
            ",
            r"CREATE INDEX IF NOT EXISTS idx_audit_events_cycle ON audit_events (cycle_id, id)",
            r"CREATE INDEX IF NOT EXISTS idx_audit_events_type ON audit_events (event_type, ts_ms)",
            r"
            CREATE TABLE IF NOT EXISTS order_intents (
                order_intent_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                decision_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                client_order_id TEXT NOT NULL UNIQUE,
                intent_payload_json TEXT NOT NULL,
                state TEXT NOT NULL,
                exchange_order_id TEXT,
                exchange_oco_id TEXT,
                last_error_code TEXT,
                last_error_detail_redacted TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            ",
            r"CREATE INDEX IF NOT EXISTS idx_order_intents_state ON order_intents (state, updated_at_ms)",
            r"CREATE INDEX IF NOT EXISTS idx_order_intents_symbol ON order_intents (symbol, created_at_ms)",
        ],
    },
    Migration {
        version: 2,
        name: "ai_gate_events",
        statements: &[r"
            CREATE TABLE IF NOT EXISTS ai_gate_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                stage TEXT NOT NULL,
                event_type TEXT NOT NULL,
                snapshot_id TEXT NOT NULL,
                snapshot_hash TEXT NOT NULL,
                decision_id TEXT NOT NULL,
                input_hash TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                verdict TEXT NOT NULL,
                reasons_json TEXT NOT NULL,
                model TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                raw_hash TEXT,
                request_json_redacted TEXT,
                response_json_redacted TEXT,
                modified_decision_json_redacted TEXT,
                modify_applied INTEGER NOT NULL,
                error_code TEXT,
                error_detail_redacted TEXT,
                exchange_time_ms INTEGER,
                local_received_ms INTEGER,
                created_at_ms INTEGER NOT NULL
            )
            "],
    },
    Migration {
        version: 3,
        name: "selection_tables",
        statements: &[
            r"
            CREATE TABLE IF NOT EXISTS universe_scans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                eligible INTEGER NOT NULL,
                reasons_json TEXT NOT NULL,
                quote_volume TEXT NOT NULL,
                trade_count INTEGER NOT NULL,
                price_change_bps INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE (cycle_id, symbol)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS cycle_rankings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                ranking_stage TEXT NOT NULL CHECK (ranking_stage IN ('TOPN', 'DEEP')),
                rank INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                score_x10000 INTEGER NOT NULL,
                components_json TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE (cycle_id, ranking_stage, symbol)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS cycle_selections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                cycle_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                score_x10000 INTEGER NOT NULL,
                reasons_json TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE (cycle_id, symbol),
                FOREIGN KEY (cycle_id, symbol) REFERENCES universe_scans (cycle_id, symbol)
            )
            ",
        ],
    },
];
