use std::fmt;

use serde::Serialize;

use crate::sampler::CollectionCounts;

/// Width of the label column in the text report.
const LABEL_WIDTH: usize = 20;

/// Summary of one run. Durations are averages in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub connection_avg_ms: f64,
    pub request_avg_ms: f64,
    pub response_avg_ms: f64,
    pub total_avg_ms: f64,
    pub requests_per_sec: f64,
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub processor_usage_pct: f64,
    pub collections: CollectionCounts,
}

impl Report {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let w = LABEL_WIDTH;
        writeln!(f, "{:<w$}{:.4} ms", "Conn. Average", self.connection_avg_ms)?;
        writeln!(f, "{:<w$}{:.4} ms", "Req. Average: ", self.request_avg_ms)?;
        writeln!(f, "{:<w$}{:.4} ms", "Resp. Average: ", self.response_avg_ms)?;
        writeln!(f, "{:<w$}{:.4} ms", "Total Average: ", self.total_avg_ms)?;
        writeln!(f, "{:<w$}{:.0}", "Req/sec: ", self.requests_per_sec.round())?;
        writeln!(f, "{:<w$}{}", "Errors: ", self.errors)?;
        writeln!(f, "{:<w$}{:05.2} %", "Processor usage:", self.processor_usage_pct)?;
        write!(
            f,
            "Gen 0: {}, Gen 1: {}, Gen 2: {}",
            self.collections.gen0, self.collections.gen1, self.collections.gen2
        )
    }
}
