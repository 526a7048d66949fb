//! Lenient resolution of command-line values into a [`RunConfig`].
//!
//! A missing or unparsable value is replaced by its default; bad input never
//! stops the run.

use std::str::FromStr;
use std::time::{Duration, Instant};

use rawload_common::{LoadError, Result, RunConfig, TargetAddr, DEFAULT_URI, GRACE_PERIOD};
use tracing::warn;
use url::Url;

/// Raw values as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct RawSettings {
    pub threads: Option<String>,
    pub duration: Option<String>,
    pub uri: Option<String>,
    pub measured: Option<String>,
    pub capacity: Option<String>,
}

pub fn resolve(raw: &RawSettings) -> RunConfig {
    let defaults = RunConfig::default();

    let thread_count = parse_or("threads", raw.threads.as_deref(), defaults.thread_count, |n: &usize| *n > 0);
    let duration_secs = parse_or(
        "duration",
        raw.duration.as_deref(),
        defaults.duration.as_secs_f64(),
        |secs: &f64| Duration::try_from_secs_f64(*secs).is_ok_and(fits_deadline),
    );
    let measured_threads = parse_or("measured", raw.measured.as_deref(), defaults.measured_threads, |_: &usize| true);
    let metrics_capacity = parse_or("capacity", raw.capacity.as_deref(), defaults.metrics_capacity, |_: &usize| true);

    let target = match raw.uri.as_deref().filter(|uri| !uri.is_empty()) {
        None => defaults.target.clone(),
        Some(uri) => parse_target(uri).unwrap_or_else(|e| {
            warn!(uri, error = %e, default = DEFAULT_URI, "using default target");
            defaults.target.clone()
        }),
    };

    RunConfig {
        thread_count,
        duration: Duration::from_secs_f64(duration_secs),
        target,
        measured_threads,
        metrics_capacity,
        ..defaults
    }
}

/// Split an `http://host[:port]/path` URI into the parts the workers need.
pub fn parse_target(uri: &str) -> Result<TargetAddr> {
    let url = Url::parse(uri).map_err(|e| LoadError::InvalidTarget(format!("{uri}: {e}")))?;
    if url.scheme() != "http" {
        return Err(LoadError::InvalidTarget(format!("unsupported scheme {:?}", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| LoadError::InvalidTarget(format!("{uri}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| LoadError::InvalidTarget(format!("{uri}: missing port")))?;

    Ok(TargetAddr {
        host: host.to_string(),
        port,
        path: url.path().to_string(),
    })
}

/// The run's completion deadline, `duration` plus the grace period from now,
/// must be representable.
fn fits_deadline(duration: Duration) -> bool {
    duration
        .checked_add(GRACE_PERIOD)
        .and_then(|wait| Instant::now().checked_add(wait))
        .is_some()
}

fn parse_or<T>(name: &str, raw: Option<&str>, default: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(setting = name, value = raw, default = ?default, "invalid value, using default");
            default
        }
    }
}
