use humantime::parse_duration;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use super::source::{parse_resources, parse_timeout, RawResourceBinding};
use crate::resource::ResourceBinding;
use crate::retry::RetryPolicy;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// When a destination hands delivery over to its durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Deliver inline; a failed dispatch settles the message as errored.
    #[default]
    Never,
    /// Attempt inline first and queue only retryable dispatch failures.
    OnFailure,
    /// Enqueue every message and settle it as queued immediately.
    Always,
}

impl QueuePolicy {
    pub(crate) fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "never" => Some(QueuePolicy::Never),
            "on_failure" => Some(QueuePolicy::OnFailure),
            "always" => Some(QueuePolicy::Always),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePolicy::Never => "never",
            QueuePolicy::OnFailure => "on_failure",
            QueuePolicy::Always => "always",
        }
    }
}

/// Delivery behavior of one destination within a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationSettings {
    pub name: String,
    pub enabled: bool,
    pub queue_policy: QueuePolicy,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    pub resources: Vec<ResourceBinding>,
}

impl DestinationSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            queue_policy: QueuePolicy::Never,
            retry: RetryPolicy::fixed(None, DEFAULT_RETRY_INTERVAL),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            resources: vec![ResourceBinding::default_binding()],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawDestination {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) enabled: Option<bool>,
    #[serde(default)]
    pub(crate) queue_policy: Option<String>,
    #[serde(default)]
    pub(crate) retry: Option<RawRetrySection>,
    #[serde(default)]
    pub(crate) send_timeout: Option<String>,
    #[serde(default)]
    pub(crate) resources: Vec<RawResourceBinding>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRetrySection {
    #[serde(default)]
    pub(crate) max_attempts: Option<u64>,
    #[serde(default)]
    pub(crate) backoff: Option<String>,
    #[serde(default)]
    pub(crate) initial_interval: Option<String>,
    #[serde(default)]
    pub(crate) max_interval: Option<String>,
    #[serde(default)]
    pub(crate) multiplier: Option<f64>,
    #[serde(default)]
    pub(crate) jitter: Option<f64>,
}

pub(crate) fn parse_destinations(
    raw_destinations: Vec<RawDestination>,
    source_resources: &[ResourceBinding],
    errors: &mut Vec<String>,
) -> Vec<DestinationSettings> {
    if raw_destinations.is_empty() {
        errors.push("channel must declare at least one destination".to_string());
        return Vec::new();
    }

    let mut seen = BTreeSet::new();
    let mut destinations = Vec::with_capacity(raw_destinations.len());

    for raw in raw_destinations {
        let RawDestination {
            name,
            enabled,
            queue_policy: raw_queue_policy,
            retry: raw_retry,
            send_timeout: raw_send_timeout,
            resources: raw_resources,
        } = raw;

        let name = name.trim().to_string();
        if name.is_empty() {
            errors.push("destination names must be non-empty".to_string());
            continue;
        }
        if !seen.insert(name.clone()) {
            errors.push(format!("destination `{name}` is declared more than once"));
            continue;
        }

        let queue_policy = match raw_queue_policy {
            None => QueuePolicy::default(),
            Some(value) => match QueuePolicy::from_raw(value.trim()) {
                Some(policy) => policy,
                None => {
                    errors.push(format!(
                        "destination `{name}` queue_policy must be one of `never`, `on_failure`, or `always` (got `{}`)",
                        value.trim()
                    ));
                    QueuePolicy::default()
                }
            },
        };

        let retry = parse_retry(raw_retry, &name, errors);
        let scope_label = format!("destination `{name}`");
        let send_timeout = parse_timeout(
            raw_send_timeout,
            DEFAULT_SEND_TIMEOUT,
            &format!("{scope_label} send_timeout"),
            errors,
        );

        // Destinations without their own resource list share the source's.
        let resources = if raw_resources.is_empty() {
            source_resources.to_vec()
        } else {
            parse_resources(raw_resources, &scope_label, errors)
        };

        destinations.push(DestinationSettings {
            name,
            enabled: enabled.unwrap_or(true),
            queue_policy,
            retry,
            send_timeout,
            resources,
        });
    }

    if !destinations.is_empty() && !destinations.iter().any(|destination| destination.enabled) {
        errors.push("channel must have at least one enabled destination".to_string());
    }

    destinations
}

fn parse_retry(
    raw: Option<RawRetrySection>,
    destination: &str,
    errors: &mut Vec<String>,
) -> RetryPolicy {
    let Some(raw) = raw else {
        return RetryPolicy::fixed(None, DEFAULT_RETRY_INTERVAL);
    };

    let max_attempts = match raw.max_attempts {
        None => None,
        Some(0) => {
            errors.push(format!(
                "destination `{destination}` retry max_attempts must be at least 1"
            ));
            None
        }
        Some(limit) => Some(limit.min(u64::from(u32::MAX)) as u32),
    };

    let initial_interval = parse_interval(
        raw.initial_interval,
        DEFAULT_RETRY_INTERVAL,
        destination,
        "initial_interval",
        errors,
    );

    let jitter = match raw.jitter {
        None => 0.0,
        Some(fraction) if (0.0..1.0).contains(&fraction) => fraction,
        Some(fraction) => {
            errors.push(format!(
                "destination `{destination}` retry jitter must be in [0.0, 1.0) (got {fraction})"
            ));
            0.0
        }
    };

    let backoff = raw.backoff.as_deref().map(str::trim).unwrap_or("fixed");
    let policy = match backoff {
        "fixed" => {
            if raw.max_interval.is_some() || raw.multiplier.is_some() {
                errors.push(format!(
                    "destination `{destination}` retry max_interval and multiplier only apply to `exponential` backoff"
                ));
            }
            RetryPolicy::fixed(max_attempts, initial_interval)
        }
        "exponential" => {
            let max_interval = parse_interval(
                raw.max_interval,
                initial_interval,
                destination,
                "max_interval",
                errors,
            );
            if max_interval < initial_interval {
                errors.push(format!(
                    "destination `{destination}` retry max_interval must be greater than or equal to initial_interval"
                ));
            }

            let multiplier = raw.multiplier.unwrap_or(2.0);
            if !(1.0..=10.0).contains(&multiplier) {
                errors.push(format!(
                    "destination `{destination}` retry multiplier must be between 1.0 and 10.0 (got {multiplier})"
                ));
            }

            RetryPolicy::exponential(max_attempts, initial_interval, max_interval, multiplier)
        }
        other => {
            errors.push(format!(
                "destination `{destination}` retry backoff must be `fixed` or `exponential` (got `{other}`)"
            ));
            RetryPolicy::fixed(max_attempts, initial_interval)
        }
    };

    policy.with_jitter(jitter)
}

fn parse_interval(
    raw: Option<String>,
    default: Duration,
    destination: &str,
    field: &str,
    errors: &mut Vec<String>,
) -> Duration {
    let Some(value) = raw else {
        return default;
    };
    match parse_duration(value.trim()) {
        Ok(duration) if duration > Duration::ZERO => duration,
        Ok(_) => {
            errors.push(format!(
                "destination `{destination}` retry {field} must be greater than zero"
            ));
            default
        }
        Err(_) => {
            errors.push(format!(
                "destination `{destination}` retry {field} must be a valid duration (e.g., `500ms`, `30s`)"
            ));
            default
        }
    }
}
