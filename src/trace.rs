// src/trace.rs
// Session trace: the telemetry aggregate emitted at session end

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ContextBudget, Critique, Plan, RetrievalDiagnostics, RouteMetadata, UsageTotals,
};

/// Aggregate of everything a session did: route, plan, budgets, retrieval
/// diagnostics, critique history and the ordered event names. Produced at the
/// end of a session regardless of success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTrace {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub context_budget: ContextBudget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalDiagnostics>,
    pub critiques: Vec<Critique>,
    /// True when the critic soft-failed and the accept verdict is a fallback,
    /// not a pass.
    pub critic_error: bool,
    /// Non-fatal diagnostics from soft-failing components.
    pub diagnostics: Vec<String>,
    /// Names of emitted events, in emission order.
    pub events: Vec<String>,
    pub usage: UsageTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionTrace {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Record a non-fatal diagnostic from a soft-failing component.
    pub fn diagnostic(&mut self, component: &str, message: impl std::fmt::Display) {
        self.diagnostics.push(format!("{component}: {message}"));
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_format() {
        let mut trace = SessionTrace::new("s1");
        trace.diagnostic("planner", "schema mismatch");
        assert_eq!(trace.diagnostics, vec!["planner: schema mismatch"]);
    }

    #[test]
    fn test_new_sets_start_time() {
        let trace = SessionTrace::new("s1");
        assert!(trace.started_at.is_some());
        assert!(trace.finished_at.is_none());
    }
}
