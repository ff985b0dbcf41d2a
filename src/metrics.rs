//! Process-wide metrics rendered in Prometheus text exposition.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counter and gauge registry. Keys are pre-rendered
/// `name{label="value",…}` series so rendering is a straight dump.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, i64>>,
}

fn series(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
        .collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, 1);
    }

    pub fn add(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(series(name, labels)).or_insert(0) += delta;
        }
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(series(name, labels), value);
        }
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(&series(name, labels)).copied())
            .unwrap_or(0)
    }

    // Domain helpers -----------------------------------------------------

    pub fn tick(&self, chain_id: u64) {
        self.inc("watchtower_ticks_total", &[("chainId", &chain_id.to_string())]);
    }

    pub fn alert(&self, rule_id: &str, severity: &str, chain_id: u64) {
        self.inc(
            "watchtower_alerts_total",
            &[("ruleId", rule_id), ("severity", severity), ("chainId", &chain_id.to_string())],
        );
    }

    pub fn error(&self, error_type: &str, chain_id: u64) {
        self.inc(
            "watchtower_errors_total",
            &[("type", error_type), ("chainId", &chain_id.to_string())],
        );
    }

    pub fn last_block(&self, chain_id: u64, block: u64) {
        self.set_gauge(
            "watchtower_last_block",
            &[("chainId", &chain_id.to_string())],
            block as i64,
        );
    }

    pub fn action(&self, action_type: &str, status: &str, chain_id: u64) {
        self.inc(
            "watchtower_actions_total",
            &[("actionType", action_type), ("status", status), ("chainId", &chain_id.to_string())],
        );
    }

    pub fn active_scans(&self, chain_id: u64, value: i64) {
        self.set_gauge(
            "watchtower_active_scans",
            &[("chainId", &chain_id.to_string())],
            value,
        );
    }

    /// Prometheus text exposition, one block per metric family.
    pub fn render(&self) -> String {
        const HELP: &[(&str, &str, &str)] = &[
            ("watchtower_ticks_total", "counter", "Completed poller ticks per chain"),
            ("watchtower_alerts_total", "counter", "Findings emitted by rule and severity"),
            ("watchtower_errors_total", "counter", "Errors by type"),
            ("watchtower_actions_total", "counter", "Executor actions by type and status"),
            ("watchtower_last_block", "gauge", "Last processed block per chain"),
            ("watchtower_active_scans", "gauge", "Scans currently in flight per chain"),
        ];

        let counters = self.counters.lock().map(|c| c.clone()).unwrap_or_default();
        let gauges = self.gauges.lock().map(|g| g.clone()).unwrap_or_default();

        let mut out = String::new();
        for (family, kind, help) in HELP {
            let matching: Vec<(&String, String)> = counters
                .iter()
                .map(|(k, v)| (k, v.to_string()))
                .chain(gauges.iter().map(|(k, v)| (k, v.to_string())))
                .filter(|(k, _)| k.as_str() == *family || k.starts_with(&format!("{}{{", family)))
                .collect();
            if matching.is_empty() {
                continue;
            }
            out.push_str(&format!("# HELP {} {}\n", family, help));
            out.push_str(&format!("# TYPE {} {}\n", family, kind));
            for (key, value) in matching {
                out.push_str(&format!("{} {}\n", key, value));
            }
        }
        out
    }
}
