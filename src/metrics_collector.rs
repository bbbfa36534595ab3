//! Metrics Collector: records deployment outcomes and answers the
//! success-rate / pattern-performance / template-performance / recent-failure
//! queries the Learning Engine and dashboards need.
//!
//! Serialized through the same `Store` mutex as the tracker; no separate
//! buffering layer, since deployment metrics are durable on arrival rather
//! than windowed in memory.

use std::sync::Arc;

use crate::error::Result;
use crate::storage::Store;
use crate::types::{DeploymentMetric, Feedback};

pub struct MetricsCollector {
    store: Arc<Store>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SuccessRate {
    pub total: u64,
    pub successes: u64,
}

impl SuccessRate {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct TemplatePerformance {
    pub template: String,
    pub deployments: u64,
    pub success_rate: f64,
    pub avg_cost_usd: f64,
    pub avg_turns: f64,
}

#[derive(Debug, Clone)]
pub struct PatternPerformance {
    pub pattern_name: String,
    pub deployments: u64,
    pub success_rate: f64,
    pub total_cost_usd: f64,
    pub avg_cost_usd: f64,
}

impl MetricsCollector {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn record_deployment(&self, metric: &DeploymentMetric) -> Result<i64> {
        self.store.record_deployment(metric)
    }

    pub fn success_rate(&self, domain: Option<&str>) -> Result<SuccessRate> {
        let deployments = self.store.deployments_for_domain(domain)?;
        let total = deployments.len() as u64;
        let successes = deployments.iter().filter(|d| d.success).count() as u64;
        Ok(SuccessRate { total, successes })
    }

    pub fn pattern_performance(&self, domain: &str) -> Result<Vec<PatternPerformance>> {
        let deployments = self.store.deployments_for_domain(Some(domain))?;
        let mut by_pattern: std::collections::HashMap<String, (u64, u64, f64)> = std::collections::HashMap::new();
        for deployment in &deployments {
            for pattern in &deployment.patterns_used {
                let entry = by_pattern.entry(pattern.clone()).or_insert((0, 0, 0.0));
                entry.0 += 1;
                if deployment.success {
                    entry.1 += 1;
                }
                entry.2 += deployment.cost_usd;
            }
        }
        let mut results: Vec<PatternPerformance> = by_pattern
            .into_iter()
            .map(|(pattern_name, (deployments, successes, total_cost_usd))| PatternPerformance {
                pattern_name,
                deployments,
                success_rate: successes as f64 / deployments.max(1) as f64,
                total_cost_usd,
                avg_cost_usd: total_cost_usd / deployments.max(1) as f64,
            })
            .collect();
        results.sort_by(|a, b| b.success_rate.partial_cmp(&a.success_rate).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    pub fn template_performance(&self, domain: &str) -> Result<Vec<TemplatePerformance>> {
        let deployments = self.store.deployments_for_domain(Some(domain))?;
        let mut by_template: std::collections::HashMap<String, Vec<&DeploymentMetric>> = std::collections::HashMap::new();
        for deployment in &deployments {
            by_template.entry(deployment.selected_template.clone()).or_default().push(deployment);
        }
        let mut results: Vec<TemplatePerformance> = by_template
            .into_iter()
            .map(|(template, rows)| {
                let n = rows.len().max(1) as f64;
                let successes = rows.iter().filter(|r| r.success).count() as f64;
                let avg_cost_usd = rows.iter().map(|r| r.cost_usd).sum::<f64>() / n;
                let avg_turns = rows.iter().map(|r| r.turns_used as f64).sum::<f64>() / n;
                TemplatePerformance {
                    template,
                    deployments: rows.len() as u64,
                    success_rate: successes / n,
                    avg_cost_usd,
                    avg_turns,
                }
            })
            .collect();
        results.sort_by(|a, b| b.success_rate.partial_cmp(&a.success_rate).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    pub fn recent_failures(&self, domain: &str, limit: u32) -> Result<Vec<DeploymentMetric>> {
        self.store.recent_failures(domain, limit)
    }

    pub fn update_deployment_feedback(&self, agent_id: &str, feedback: &Feedback) -> Result<()> {
        self.store.update_deployment_feedback(agent_id, feedback)
    }
}
