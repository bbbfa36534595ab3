//! Durable schema and connection setup.
//!
//! Pragmas and `WITHOUT ROWID`/index choices follow the donor backend's
//! `signals::db_storage` schema: WAL journaling for concurrent reads
//! during writes, a sized page cache, and covering indexes for the query
//! shapes each component actually runs.

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS pattern_effectiveness (
    pattern_name TEXT NOT NULL,
    variant TEXT NOT NULL,
    domain TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    total_usages INTEGER NOT NULL,
    success_count INTEGER NOT NULL,
    failure_count INTEGER NOT NULL,
    success_rate REAL NOT NULL,
    avg_cost_usd REAL NOT NULL,
    avg_latency_ms INTEGER NOT NULL,
    error_types_json TEXT NOT NULL,
    judge_pass_rate REAL,
    judge_avg_score REAL,
    judge_criterion_scores_json TEXT,
    llm_provider TEXT NOT NULL,
    llm_model TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(pattern_name, variant, agent_id, window_start)
);

CREATE INDEX IF NOT EXISTS idx_pattern_effectiveness_pattern ON pattern_effectiveness(pattern_name);
CREATE INDEX IF NOT EXISTS idx_pattern_effectiveness_variant ON pattern_effectiveness(variant);
CREATE INDEX IF NOT EXISTS idx_pattern_effectiveness_agent ON pattern_effectiveness(agent_id);
CREATE INDEX IF NOT EXISTS idx_pattern_effectiveness_domain ON pattern_effectiveness(domain);
CREATE INDEX IF NOT EXISTS idx_pattern_effectiveness_window ON pattern_effectiveness(window_start, window_end);
CREATE INDEX IF NOT EXISTS idx_pattern_effectiveness_success_rate ON pattern_effectiveness(success_rate);

CREATE TABLE IF NOT EXISTS improvement_history (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    description TEXT NOT NULL,
    confidence REAL NOT NULL,
    impact INTEGER NOT NULL,
    target_agent_id TEXT,
    target_pattern TEXT,
    domain TEXT NOT NULL,
    status INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    applied_at INTEGER,
    applied_by TEXT,
    details_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_improvement_target_agent ON improvement_history(target_agent_id);
CREATE INDEX IF NOT EXISTS idx_improvement_domain ON improvement_history(domain);
CREATE INDEX IF NOT EXISTS idx_improvement_status ON improvement_history(status);
CREATE INDEX IF NOT EXISTS idx_improvement_created_at ON improvement_history(created_at);
CREATE INDEX IF NOT EXISTS idx_improvement_type ON improvement_history(type);

CREATE TABLE IF NOT EXISTS config_snapshots (
    improvement_id TEXT NOT NULL REFERENCES improvement_history(id),
    previous_config TEXT NOT NULL,
    new_config TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS metaagent_deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    domain TEXT NOT NULL,
    templates_json TEXT NOT NULL,
    selected_template TEXT NOT NULL,
    patterns_json TEXT NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT,
    cost_usd REAL NOT NULL,
    turns_used INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    metadata_json TEXT NOT NULL,
    session_count INTEGER NOT NULL,
    user_rating REAL,
    feedback_comments TEXT
);

CREATE INDEX IF NOT EXISTS idx_deployments_domain ON metaagent_deployments(domain);
CREATE INDEX IF NOT EXISTS idx_deployments_success ON metaagent_deployments(success);
CREATE INDEX IF NOT EXISTS idx_deployments_created_at ON metaagent_deployments(created_at);
CREATE INDEX IF NOT EXISTS idx_deployments_template ON metaagent_deployments(selected_template);
CREATE INDEX IF NOT EXISTS idx_deployments_agent ON metaagent_deployments(agent_id);
"#;

/// Open a connection and apply the schema. `path` may be `:memory:` for tests.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(conn)
}
