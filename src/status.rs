//! Status snapshot of a running master and its formatted output.
//!
//! Collects sessions, registrations, index allocations, agent capabilities
//! and PDU counters, printed on shutdown as text or JSON.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::{
    capabilities::Capability,
    index::IndexAllocation,
    registry::{OwnerKey, RegEntry},
    session::SessionInfo,
};

/// Output format for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
}

/// Running totals kept by the master.
#[derive(Debug, Default)]
pub struct Counters {
    pub pdus_received: AtomicU64,
    pub pdus_sent: AtomicU64,
    pub parse_errors: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub requests_processed: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pdus_received: self.pdus_received.load(Ordering::Relaxed),
            pdus_sent: self.pdus_sent.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub pdus_received: u64,
    pub pdus_sent: u64,
    pub parse_errors: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub requests_processed: u64,
}

/// One registration as shown in the report.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RegistrationInfo {
    pub context: String,
    pub region: String,
    pub owner: OwnerKey,
    pub priority: u8,
    pub timeout: u8,
}

impl From<&RegEntry> for RegistrationInfo {
    fn from(entry: &RegEntry) -> Self {
        RegistrationInfo {
            context: String::from_utf8_lossy(&entry.context).into_owned(),
            region: entry.region.to_string(),
            owner: entry.owner.key(),
            priority: entry.priority,
            timeout: entry.timeout,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub peers: usize,
    pub sessions: Vec<SessionInfo>,
    pub registrations: Vec<RegistrationInfo>,
    pub index_allocations: Vec<IndexAllocation>,
    pub capabilities: Vec<Capability>,
    pub counters: CounterSnapshot,
}

impl StatusReport {
    /// Prints the report in the given format.
    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Text => print!("{}", self.to_text()),
            OutputFormat::Json => {
                if let Ok(json) = serde_json::to_string(self) {
                    println!("{}", json);
                }
            }
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let c = &self.counters;
        out.push_str("\n--- AgentX Master Status ---\n");
        out.push_str(&format!("Started: {}\n", self.started_at.to_rfc3339()));
        out.push_str(&format!("Uptime: {:.1} seconds\n", self.uptime_seconds));
        out.push_str(&format!("Peers: {}\n", self.peers));
        out.push_str(&format!(
            "PDUs received: {}, sent: {}, parse errors: {}\n",
            c.pdus_received, c.pdus_sent, c.parse_errors
        ));
        out.push_str(&format!(
            "Sessions opened: {}, closed: {}\n",
            c.sessions_opened, c.sessions_closed
        ));
        out.push_str(&format!("Requests processed: {}\n", c.requests_processed));
        if !self.sessions.is_empty() {
            out.push_str("Sessions:\n");
            for s in &self.sessions {
                out.push_str(&format!(
                    "  {} via {} - {} \"{}\" ({:?}, {} timeouts)\n",
                    s.id, s.peer, s.subagent_id, s.description, s.state, s.consecutive_timeouts
                ));
            }
        }
        if !self.registrations.is_empty() {
            out.push_str("Registrations:\n");
            for r in &self.registrations {
                let context = if r.context.is_empty() { "default" } else { &r.context };
                out.push_str(&format!(
                    "  [{}] {} priority {} owner {:?}\n",
                    context, r.region, r.priority, r.owner
                ));
            }
        }
        if !self.index_allocations.is_empty() {
            out.push_str(&format!("Index allocations: {}\n", self.index_allocations.len()));
        }
        if !self.capabilities.is_empty() {
            out.push_str("Agent capabilities:\n");
            for cap in &self.capabilities {
                out.push_str(&format!("  {} \"{}\" (session {})\n", cap.id, cap.description, cap.session_id));
            }
        }
        out
    }
}
