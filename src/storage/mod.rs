//! Durable store: pattern effectiveness rows, improvement lifecycle,
//! config snapshots, and the deployment metrics log.
//!
//! One `rusqlite::Connection` guarded by a `parking_lot::Mutex`, matching
//! the donor's single-writer-style usage in `signals::db_storage` and
//! `vault::vault_db` — writes serialize through the lock, reads are still
//! cheap enough (local SQLite, WAL mode) not to need a connection pool.

pub mod schema;

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{LearningError, Result};
use crate::types::{
    ConfigSnapshot, DeploymentMetric, Feedback, Impact, Improvement, ImprovementStatus,
    ImprovementType, PatternEffectivenessRow,
};

pub struct Store {
    conn: Mutex<rusqlite::Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(schema::open(path)?),
        })
    }

    // -- pattern_effectiveness ------------------------------------------------

    /// Upsert every row in one transaction. Last-flush-wins on the unique
    /// `(pattern_name, variant, agent_id, window_start)` key. An empty
    /// slice is a no-op that commits no rows.
    pub fn upsert_pattern_effectiveness(&self, rows: &[PatternEffectivenessRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for row in rows {
            let error_types_json = serde_json::to_string(&row.error_types).unwrap_or_default();
            let judge_criterion_scores_json = row
                .judge_criterion_scores
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default());
            tx.execute(
                "INSERT INTO pattern_effectiveness
                 (pattern_name, variant, domain, agent_id, window_start, window_end,
                  total_usages, success_count, failure_count, success_rate,
                  avg_cost_usd, avg_latency_ms, error_types_json,
                  judge_pass_rate, judge_avg_score, judge_criterion_scores_json,
                  llm_provider, llm_model, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
                 ON CONFLICT(pattern_name, variant, agent_id, window_start) DO UPDATE SET
                   domain = excluded.domain,
                   window_end = excluded.window_end,
                   total_usages = excluded.total_usages,
                   success_count = excluded.success_count,
                   failure_count = excluded.failure_count,
                   success_rate = excluded.success_rate,
                   avg_cost_usd = excluded.avg_cost_usd,
                   avg_latency_ms = excluded.avg_latency_ms,
                   error_types_json = excluded.error_types_json,
                   judge_pass_rate = excluded.judge_pass_rate,
                   judge_avg_score = excluded.judge_avg_score,
                   judge_criterion_scores_json = excluded.judge_criterion_scores_json,
                   llm_provider = excluded.llm_provider,
                   llm_model = excluded.llm_model,
                   created_at = excluded.created_at",
                params![
                    row.pattern_name,
                    row.variant,
                    row.domain,
                    row.agent_id,
                    row.window_start,
                    row.window_end,
                    row.total_usages,
                    row.success_count,
                    row.failure_count,
                    row.success_rate,
                    row.avg_cost_usd,
                    row.avg_latency_ms,
                    error_types_json,
                    row.judge_pass_rate,
                    row.judge_avg_score,
                    judge_criterion_scores_json,
                    row.llm_provider,
                    row.llm_model,
                    row.created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Rows in `[since, now]` for a domain (and optionally one agent).
    pub fn query_pattern_effectiveness(
        &self,
        domain: &str,
        agent_id: Option<&str>,
        since: i64,
    ) -> Result<Vec<PatternEffectivenessRow>> {
        let conn = self.conn.lock();
        let sql = match agent_id {
            Some(_) => {
                "SELECT pattern_name, variant, domain, agent_id, window_start, window_end,
                        total_usages, success_count, failure_count, success_rate,
                        avg_cost_usd, avg_latency_ms, error_types_json,
                        judge_pass_rate, judge_avg_score, judge_criterion_scores_json,
                        llm_provider, llm_model, created_at
                 FROM pattern_effectiveness
                 WHERE domain = ?1 AND agent_id = ?2 AND window_start >= ?3
                 ORDER BY window_start DESC"
            }
            None => {
                "SELECT pattern_name, variant, domain, agent_id, window_start, window_end,
                        total_usages, success_count, failure_count, success_rate,
                        avg_cost_usd, avg_latency_ms, error_types_json,
                        judge_pass_rate, judge_avg_score, judge_criterion_scores_json,
                        llm_provider, llm_model, created_at
                 FROM pattern_effectiveness
                 WHERE domain = ?1 AND window_start >= ?2
                 ORDER BY window_start DESC"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = match agent_id {
            Some(agent_id) => stmt
                .query_map(params![domain, agent_id, since], Self::row_to_effectiveness)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![domain, since], Self::row_to_effectiveness)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    fn row_to_effectiveness(row: &Row) -> rusqlite::Result<PatternEffectivenessRow> {
        let error_types_json: String = row.get(12)?;
        let judge_criterion_scores_json: Option<String> = row.get(15)?;
        Ok(PatternEffectivenessRow {
            pattern_name: row.get(0)?,
            variant: row.get(1)?,
            domain: row.get(2)?,
            agent_id: row.get(3)?,
            window_start: row.get(4)?,
            window_end: row.get(5)?,
            total_usages: row.get(6)?,
            success_count: row.get(7)?,
            failure_count: row.get(8)?,
            success_rate: row.get(9)?,
            avg_cost_usd: row.get(10)?,
            avg_latency_ms: row.get(11)?,
            error_types: serde_json::from_str(&error_types_json).unwrap_or_default(),
            judge_pass_rate: row.get(13)?,
            judge_avg_score: row.get(14)?,
            judge_criterion_scores: judge_criterion_scores_json
                .and_then(|s| serde_json::from_str(&s).ok()),
            llm_provider: row.get(16)?,
            llm_model: row.get(17)?,
            created_at: row.get(18)?,
        })
    }

    // -- improvement_history ---------------------------------------------------

    pub fn insert_improvement(&self, improvement: &Improvement) -> Result<()> {
        let conn = self.conn.lock();
        let details_json = serde_json::to_string(&improvement.details).unwrap_or_default();
        conn.execute(
            "INSERT INTO improvement_history
             (id, type, description, confidence, impact, target_agent_id, target_pattern,
              domain, status, created_at, applied_at, applied_by, details_json)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                improvement.id.to_string(),
                improvement.improvement_type.as_str(),
                improvement.description,
                improvement.confidence,
                impact_to_int(improvement.impact),
                improvement.target_agent_id,
                improvement.target_pattern,
                improvement.domain,
                status_to_int(improvement.status),
                improvement.created_at.timestamp(),
                improvement.applied_at.map(|t| t.timestamp()),
                improvement.applied_by,
                details_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_improvement(&self, id: Uuid) -> Result<Improvement> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, type, description, confidence, impact, target_agent_id, target_pattern,
                    domain, status, created_at, applied_at, applied_by, details_json
             FROM improvement_history WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_improvement,
        )
        .optional()?
        .ok_or_else(|| LearningError::NotFound(format!("improvement {id}")))
    }

    /// Persist a status transition. `applied_by`/`applied_at` follow the
    /// invariant: set together, iff status is Applied or RolledBack.
    pub fn update_improvement_status(
        &self,
        id: Uuid,
        status: ImprovementStatus,
        applied_by: Option<&str>,
    ) -> Result<()> {
        let applied_at = matches!(status, ImprovementStatus::Applied | ImprovementStatus::RolledBack)
            .then(Utc::now)
            .map(|t| t.timestamp());
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE improvement_history SET status = ?1, applied_at = ?2, applied_by = ?3 WHERE id = ?4",
            params![status_to_int(status), applied_at, applied_by, id.to_string()],
        )?;
        if changed == 0 {
            return Err(LearningError::NotFound(format!("improvement {id}")));
        }
        Ok(())
    }

    pub fn list_improvements(
        &self,
        agent_id: Option<&str>,
        domain: Option<&str>,
        status: Option<ImprovementStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Improvement>, u64)> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, type, description, confidence, impact, target_agent_id, target_pattern,
                    domain, status, created_at, applied_at, applied_by, details_json
             FROM improvement_history WHERE 1=1",
        );
        let mut count_sql = String::from("SELECT COUNT(*) FROM improvement_history WHERE 1=1");
        let mut conditions = Vec::new();
        if agent_id.is_some() {
            conditions.push(" AND target_agent_id = ?");
        }
        if domain.is_some() {
            conditions.push(" AND domain = ?");
        }
        if status.is_some() {
            conditions.push(" AND status = ?");
        }
        for (i, cond) in conditions.iter().enumerate() {
            let placeholder = cond.replacen('?', &format!("?{}", i + 1), 1);
            sql.push_str(&placeholder);
            count_sql.push_str(&placeholder);
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            conditions.len() + 1,
            conditions.len() + 2
        ));

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(a) = agent_id {
            params_vec.push(Box::new(a.to_string()));
        }
        if let Some(d) = domain {
            params_vec.push(Box::new(d.to_string()));
        }
        if let Some(s) = status {
            params_vec.push(Box::new(status_to_int(s)));
        }
        let count_params: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, count_params.as_slice(), |row| row.get(0))?;

        params_vec.push(Box::new(limit));
        params_vec.push(Box::new(offset));
        let query_params: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(query_params.as_slice(), Self::row_to_improvement)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((rows, total))
    }

    fn row_to_improvement(row: &Row) -> rusqlite::Result<Improvement> {
        let id: String = row.get(0)?;
        let type_str: String = row.get(1)?;
        let impact_int: i64 = row.get(4)?;
        let status_int: i64 = row.get(8)?;
        let created_at: i64 = row.get(9)?;
        let applied_at: Option<i64> = row.get(10)?;
        let details_json: String = row.get(12)?;
        Ok(Improvement {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            improvement_type: improvement_type_from_str(&type_str),
            description: row.get(2)?,
            confidence: row.get(3)?,
            impact: impact_from_int(impact_int),
            target_agent_id: row.get(5)?,
            target_pattern: row.get(6)?,
            domain: row.get(7)?,
            status: status_from_int(status_int),
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_else(Utc::now),
            applied_at: applied_at.and_then(|t| Utc.timestamp_opt(t, 0).single()),
            applied_by: row.get(11)?,
            details: serde_json::from_str(&details_json).unwrap_or_default(),
        })
    }

    // -- config_snapshots --------------------------------------------------

    pub fn insert_config_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO config_snapshots (improvement_id, previous_config, new_config, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.improvement_id.to_string(),
                snapshot.previous_config,
                snapshot.new_config,
                snapshot.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_config_snapshot(&self, improvement_id: Uuid) -> Result<Option<ConfigSnapshot>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT improvement_id, previous_config, new_config, created_at
             FROM config_snapshots WHERE improvement_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![improvement_id.to_string()],
            |row| {
                let created_at: i64 = row.get(3)?;
                Ok(ConfigSnapshot {
                    improvement_id,
                    previous_config: row.get(1)?,
                    new_config: row.get(2)?,
                    created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_else(Utc::now),
                })
            },
        )
        .optional()
        .map_err(LearningError::from)
    }

    // -- metaagent_deployments ----------------------------------------------

    pub fn record_deployment(&self, metric: &DeploymentMetric) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metaagent_deployments
             (agent_id, domain, templates_json, selected_template, patterns_json,
              success, error_message, cost_usd, turns_used, created_at, metadata_json,
              session_count, user_rating, feedback_comments)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                metric.agent_id,
                metric.domain,
                serde_json::to_string(&metric.templates_considered).unwrap_or_default(),
                metric.selected_template,
                serde_json::to_string(&metric.patterns_used).unwrap_or_default(),
                metric.success,
                metric.error_message,
                metric.cost_usd,
                metric.turns_used,
                metric.created_at.timestamp(),
                serde_json::to_string(&metric.metadata).unwrap_or_default(),
                metric.session_count,
                metric.user_rating,
                metric.feedback_comments,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn deployments_for_domain(&self, domain: Option<&str>) -> Result<Vec<DeploymentMetric>> {
        let conn = self.conn.lock();
        let sql_all = "SELECT id, agent_id, domain, templates_json, selected_template, patterns_json,
                              success, error_message, cost_usd, turns_used, created_at, metadata_json,
                              session_count, user_rating, feedback_comments
                       FROM metaagent_deployments ORDER BY created_at DESC";
        let sql_domain = "SELECT id, agent_id, domain, templates_json, selected_template, patterns_json,
                                 success, error_message, cost_usd, turns_used, created_at, metadata_json,
                                 session_count, user_rating, feedback_comments
                          FROM metaagent_deployments WHERE domain = ?1 ORDER BY created_at DESC";
        let rows: Vec<DeploymentMetric> = match domain {
            Some(d) => {
                let mut stmt = conn.prepare(sql_domain)?;
                let mapped: rusqlite::Result<Vec<DeploymentMetric>> = stmt.query_map(params![d], Self::row_to_deployment)?.collect();
                mapped?
            }
            None => {
                let mut stmt = conn.prepare(sql_all)?;
                let mapped: rusqlite::Result<Vec<DeploymentMetric>> = stmt.query_map([], Self::row_to_deployment)?.collect();
                mapped?
            }
        };
        Ok(rows)
    }

    pub fn recent_failures(&self, domain: &str, limit: u32) -> Result<Vec<DeploymentMetric>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, domain, templates_json, selected_template, patterns_json,
                    success, error_message, cost_usd, turns_used, created_at, metadata_json,
                    session_count, user_rating, feedback_comments
             FROM metaagent_deployments
             WHERE domain = ?1 AND success = 0
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![domain, limit], Self::row_to_deployment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Update the row matching `agent_id` with the latest `created_at`
    /// (Open Question resolved in SPEC_FULL.md §9: disambiguate by recency).
    pub fn update_deployment_feedback(&self, agent_id: &str, feedback: &Feedback) -> Result<()> {
        let conn = self.conn.lock();
        let target_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM metaagent_deployments WHERE agent_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(target_id) = target_id else {
            return Err(LearningError::NotFound(format!("deployment for agent {agent_id}")));
        };

        if let Some(success) = feedback.success {
            conn.execute(
                "UPDATE metaagent_deployments SET success = ?1 WHERE id = ?2",
                params![success, target_id],
            )?;
        }
        if let Some(error) = &feedback.error {
            conn.execute(
                "UPDATE metaagent_deployments SET error_message = ?1 WHERE id = ?2",
                params![error, target_id],
            )?;
        }
        if let Some(turns) = feedback.turns {
            conn.execute(
                "UPDATE metaagent_deployments SET turns_used = ?1 WHERE id = ?2",
                params![turns, target_id],
            )?;
        }
        if let Some(session_count) = feedback.session_count {
            conn.execute(
                "UPDATE metaagent_deployments SET session_count = ?1 WHERE id = ?2",
                params![session_count, target_id],
            )?;
        }
        if let Some(rating) = feedback.rating {
            conn.execute(
                "UPDATE metaagent_deployments SET user_rating = ?1 WHERE id = ?2",
                params![rating, target_id],
            )?;
        }
        if let Some(comments) = &feedback.comments {
            conn.execute(
                "UPDATE metaagent_deployments SET feedback_comments = ?1 WHERE id = ?2",
                params![comments, target_id],
            )?;
        }
        Ok(())
    }

    fn row_to_deployment(row: &Row) -> rusqlite::Result<DeploymentMetric> {
        let created_at: i64 = row.get(10)?;
        let templates_json: String = row.get(3)?;
        let patterns_json: String = row.get(5)?;
        let metadata_json: String = row.get(11)?;
        Ok(DeploymentMetric {
            id: Some(row.get(0)?),
            agent_id: row.get(1)?,
            domain: row.get(2)?,
            templates_considered: serde_json::from_str(&templates_json).unwrap_or_default(),
            selected_template: row.get(4)?,
            patterns_used: serde_json::from_str(&patterns_json).unwrap_or_default(),
            success: row.get::<_, i64>(6)? != 0,
            error_message: row.get(7)?,
            cost_usd: row.get(8)?,
            turns_used: row.get(9)?,
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_else(Utc::now),
            metadata: serde_json::from_str::<HashMap<String, String>>(&metadata_json).unwrap_or_default(),
            session_count: row.get(12)?,
            user_rating: row.get(13)?,
            feedback_comments: row.get(14)?,
        })
    }
}

fn impact_to_int(impact: Impact) -> i64 {
    match impact {
        Impact::Low => 0,
        Impact::Medium => 1,
        Impact::High => 2,
        Impact::Critical => 3,
    }
}

fn impact_from_int(v: i64) -> Impact {
    match v {
        0 => Impact::Low,
        1 => Impact::Medium,
        2 => Impact::High,
        _ => Impact::Critical,
    }
}

fn status_to_int(status: ImprovementStatus) -> i64 {
    match status {
        ImprovementStatus::Pending => 0,
        ImprovementStatus::Applied => 1,
        ImprovementStatus::RolledBack => 2,
        ImprovementStatus::Rejected => 3,
    }
}

fn status_from_int(v: i64) -> ImprovementStatus {
    match v {
        0 => ImprovementStatus::Pending,
        1 => ImprovementStatus::Applied,
        2 => ImprovementStatus::RolledBack,
        _ => ImprovementStatus::Rejected,
    }
}

fn improvement_type_from_str(s: &str) -> ImprovementType {
    match s {
        "pattern_add" => ImprovementType::PatternAdd,
        "pattern_remove" => ImprovementType::PatternRemove,
        "template_adjust" => ImprovementType::TemplateAdjust,
        _ => ImprovementType::ParameterTune,
    }
}
