use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::ledger::{AgentRecord, StateEntry};
use crate::liveness::Liveness;
use crate::mirror::{marker_tag, STATUS_MARKER};

/// Session keys shown first, in this order.
const SESSION_KEYS: [&str; 5] = ["repo", "branch", "base", "runner", "stage"];

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub liveness: Liveness,
}

impl AgentStatus {
    fn model(&self) -> &str {
        self.record
            .settings
            .get("model")
            .map(String::as_str)
            .unwrap_or("?")
    }

    fn pid_label(&self) -> String {
        self.liveness
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "?".to_string())
    }
}

/// Composite, advisory view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub repo: String,
    pub pr_number: u64,
    pub state: BTreeMap<String, StateEntry>,
    pub agents: Vec<AgentStatus>,
    pub latest_seq: u64,
    pub observed_at: DateTime<Utc>,
}

impl StatusSnapshot {
    fn ordered_state(&self) -> impl Iterator<Item = &StateEntry> {
        let session = SESSION_KEYS.iter().filter_map(|key| self.state.get(*key));
        let rest = self
            .state
            .values()
            .filter(|entry| !SESSION_KEYS.contains(&entry.key.as_str()));
        session.chain(rest)
    }

    /// Terminal rendering for `duo status`.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "PR #{}", self.pr_number);
        let _ = writeln!(out, "{}", "-".repeat(40));
        for entry in self.ordered_state() {
            let _ = writeln!(out, "{}: {}", entry.key, entry.value);
        }
        if !self.agents.is_empty() {
            let _ = writeln!(out, "\nAgents:");
            for agent in &self.agents {
                let dot = if agent.liveness.alive { "●" } else { "○" };
                let _ = writeln!(
                    out,
                    "  {dot} {}: {} (pid={})",
                    agent.record.name,
                    agent.model(),
                    agent.pid_label()
                );
            }
        }
        let _ = writeln!(out, "\nmessages: {}", self.latest_seq);
        out
    }

    /// Markdown for the review-thread status comment. Carries no timestamps, so
    /// identical session state renders identically.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", marker_tag(STATUS_MARKER));
        let _ = writeln!(out, "### 🤝 Review status for {}#{}", self.repo, self.pr_number);
        let _ = writeln!(out);

        if !self.state.is_empty() {
            let _ = writeln!(out, "| key | value |");
            let _ = writeln!(out, "| --- | --- |");
            for entry in self.ordered_state() {
                let _ = writeln!(out, "| `{}` | {} |", entry.key, escape_cell(&entry.value));
            }
            let _ = writeln!(out);
        }

        if !self.agents.is_empty() {
            let _ = writeln!(out, "| agent | model | running |");
            let _ = writeln!(out, "| --- | --- | --- |");
            for agent in &self.agents {
                let running = if agent.liveness.alive { "🟢" } else { "⚪" };
                let _ = writeln!(
                    out,
                    "| {} | {} | {running} |",
                    agent.record.name,
                    escape_cell(agent.model())
                );
            }
            let _ = writeln!(out);
        }

        let _ = write!(out, "_{} messages exchanged_", self.latest_seq);
        out
    }
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}
