use humantime::parse_duration;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::resource::{ResourceBinding, DEFAULT_RESOURCE_GROUP, DEFAULT_RESOURCE_ID};

pub const RESPONSE_NONE: &str = "none";
pub const RESPONSE_AUTO_BEFORE: &str = "auto_before";
pub const RESPONSE_SOURCE_TRANSFORMED: &str = "source_transformed";
pub const RESPONSE_DESTINATIONS_COMPLETED: &str = "destinations_completed";
pub const RESPONSE_POSTPROCESSOR: &str = "postprocessor";

/// Response origins legal when the source acknowledges before processing
/// finishes. Anything else needs the processed message and cannot be served
/// from a read-ahead buffer.
pub const QUEUE_ON_RESPONSES: [&str; 2] = [RESPONSE_NONE, RESPONSE_AUTO_BEFORE];

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the source connector's reply to the caller comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RespondFrom {
    None,
    AutoBefore,
    SourceTransformed,
    #[default]
    DestinationsCompleted,
    Postprocessor,
    /// A named message binding, written by a destination or a transformer.
    Binding(String),
}

impl RespondFrom {
    pub(crate) fn from_raw(raw: &str) -> Self {
        match raw {
            RESPONSE_NONE => RespondFrom::None,
            RESPONSE_AUTO_BEFORE => RespondFrom::AutoBefore,
            RESPONSE_SOURCE_TRANSFORMED => RespondFrom::SourceTransformed,
            RESPONSE_DESTINATIONS_COMPLETED => RespondFrom::DestinationsCompleted,
            RESPONSE_POSTPROCESSOR => RespondFrom::Postprocessor,
            other => RespondFrom::Binding(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RespondFrom::None => RESPONSE_NONE,
            RespondFrom::AutoBefore => RESPONSE_AUTO_BEFORE,
            RespondFrom::SourceTransformed => RESPONSE_SOURCE_TRANSFORMED,
            RespondFrom::DestinationsCompleted => RESPONSE_DESTINATIONS_COMPLETED,
            RespondFrom::Postprocessor => RESPONSE_POSTPROCESSOR,
            RespondFrom::Binding(name) => name.as_str(),
        }
    }

    /// Whether this origin is available before destinations have run, which
    /// is what makes a read-ahead intake buffer legal.
    pub fn available_before_processing(&self) -> bool {
        QUEUE_ON_RESPONSES.contains(&self.as_str())
    }
}

/// Source-side behavior of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub respond_from: RespondFrom,
    pub respond_after_processing: bool,
    pub process_batch: bool,
    pub first_response: bool,
    pub processing_threads: usize,
    pub queue_buffer_size: usize,
    pub response_timeout: Duration,
    pub resources: Vec<ResourceBinding>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            respond_from: RespondFrom::DestinationsCompleted,
            respond_after_processing: true,
            process_batch: false,
            first_response: false,
            processing_threads: 1,
            queue_buffer_size: 0,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            resources: vec![ResourceBinding::default_binding()],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawSourceSection {
    #[serde(default)]
    pub(crate) respond_from: Option<String>,
    #[serde(default)]
    pub(crate) respond_after_processing: Option<bool>,
    #[serde(default)]
    pub(crate) process_batch: Option<bool>,
    #[serde(default)]
    pub(crate) first_response: Option<bool>,
    #[serde(default)]
    pub(crate) processing_threads: Option<u64>,
    #[serde(default)]
    pub(crate) queue_buffer_size: Option<u64>,
    #[serde(default)]
    pub(crate) response_timeout: Option<String>,
    #[serde(default)]
    pub(crate) resources: Vec<RawResourceBinding>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawResourceBinding {
    pub(crate) group: String,
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[serde(default)]
    #[serde(flatten)]
    pub(crate) extra_fields: BTreeMap<String, YamlValue>,
}

pub(crate) fn parse_source(raw: Option<RawSourceSection>, errors: &mut Vec<String>) -> SourceSettings {
    let raw = raw.unwrap_or_default();
    let defaults = SourceSettings::default();

    let respond_from = match raw.respond_from {
        None => defaults.respond_from,
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                errors.push(
                    "source respond_from must be a response key or a non-empty binding name"
                        .to_string(),
                );
                defaults.respond_from
            } else {
                RespondFrom::from_raw(trimmed)
            }
        }
    };

    let respond_after_processing = raw
        .respond_after_processing
        .unwrap_or(defaults.respond_after_processing);

    if !respond_after_processing && !respond_from.available_before_processing() {
        errors.push(format!(
            "source respond_after_processing=false requires respond_from `{RESPONSE_NONE}` or `{RESPONSE_AUTO_BEFORE}` (got `{}`)",
            respond_from.as_str()
        ));
    }

    let processing_threads = match raw.processing_threads {
        None => defaults.processing_threads,
        Some(0) => {
            errors.push("source processing_threads must be at least 1".to_string());
            defaults.processing_threads
        }
        Some(count) => count as usize,
    };

    let queue_buffer_size = match raw.queue_buffer_size {
        None => defaults.queue_buffer_size,
        Some(size) => size as usize,
    };

    if queue_buffer_size > 0 && respond_after_processing {
        errors.push(
            "source queue_buffer_size requires respond_after_processing=false".to_string(),
        );
    }

    let response_timeout = parse_timeout(
        raw.response_timeout,
        defaults.response_timeout,
        "source response_timeout",
        errors,
    );

    let resources = parse_resources(raw.resources, "source", errors);

    SourceSettings {
        respond_from,
        respond_after_processing,
        process_batch: raw.process_batch.unwrap_or(defaults.process_batch),
        first_response: raw.first_response.unwrap_or(defaults.first_response),
        processing_threads,
        queue_buffer_size,
        response_timeout,
        resources,
    }
}

pub(crate) fn parse_timeout(
    raw: Option<String>,
    default: Duration,
    field_label: &str,
    errors: &mut Vec<String>,
) -> Duration {
    let Some(value) = raw else {
        return default;
    };
    match parse_duration(value.trim()) {
        Ok(duration) if duration > Duration::ZERO => duration,
        Ok(_) => {
            errors.push(format!("{field_label} must be greater than zero"));
            default
        }
        Err(_) => {
            errors.push(format!(
                "{field_label} must be a valid duration (e.g., `500ms`, `30s`)"
            ));
            default
        }
    }
}

pub(crate) fn parse_resources(
    raw: Vec<RawResourceBinding>,
    scope_label: &str,
    errors: &mut Vec<String>,
) -> Vec<ResourceBinding> {
    if raw.is_empty() {
        return vec![ResourceBinding::default_binding()];
    }

    let mut bindings: Vec<ResourceBinding> = Vec::with_capacity(raw.len());
    for entry in raw {
        for key in entry.extra_fields.keys() {
            errors.push(format!(
                "{scope_label} resource entry has unknown key \"{key}\" (expected group, id)"
            ));
        }

        let group = entry.group.trim().to_string();
        if group.is_empty() {
            errors.push(format!(
                "{scope_label} resource entries must provide a non-empty group"
            ));
            continue;
        }
        if bindings.iter().any(|binding| binding.group == group) {
            errors.push(format!(
                "{scope_label} resource group `{group}` appears more than once"
            ));
            continue;
        }

        let resource_id = match entry.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            Some(_) => {
                errors.push(format!(
                    "{scope_label} resource group `{group}` has an empty id"
                ));
                continue;
            }
            None if group == DEFAULT_RESOURCE_GROUP => DEFAULT_RESOURCE_ID.to_string(),
            None => group.clone(),
        };

        bindings.push(ResourceBinding::new(group, resource_id));
    }

    if bindings.is_empty() {
        bindings.push(ResourceBinding::default_binding());
    }
    bindings
}
