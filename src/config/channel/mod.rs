mod destination;
mod migrate;
mod source;

use serde::de::Error as _;
use serde::Deserialize;
use serde_yaml::{self, Value as YamlValue};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub use destination::{
    DestinationSettings, QueuePolicy, DEFAULT_RETRY_INTERVAL, DEFAULT_SEND_TIMEOUT,
};
pub use migrate::CURRENT_SCHEMA_VERSION;
pub use source::{
    RespondFrom, SourceSettings, DEFAULT_RESPONSE_TIMEOUT, QUEUE_ON_RESPONSES,
    RESPONSE_AUTO_BEFORE, RESPONSE_DESTINATIONS_COMPLETED, RESPONSE_NONE, RESPONSE_POSTPROCESSOR,
    RESPONSE_SOURCE_TRANSFORMED,
};

/// A validated channel definition: one source, one or more destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDefinition {
    pub name: String,
    pub source: SourceSettings,
    pub destinations: Vec<DestinationSettings>,
}

const TOP_LEVEL_FIELDS: &str = "schema_version, name, source, destinations";

impl ChannelDefinition {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, ChannelConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ChannelConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ChannelConfigError> {
        let mut documents = serde_yaml::Deserializer::from_str(contents);
        let mut parsed = None;
        let mut extra_errors = Vec::new();

        for (index, document) in documents.by_ref().enumerate() {
            if index == 0 {
                parsed = Some(YamlValue::deserialize(document)?);
            } else {
                let _: YamlValue = YamlValue::deserialize(document)?;
                extra_errors
                    .push("error[root]: multiple YAML documents are not supported".to_string());
                break;
            }
        }

        let Some(mut doc) = parsed else {
            let err = serde_yaml::Error::custom(
                "channel definition must contain exactly one YAML document",
            );
            return Err(ChannelConfigError::Parse(err));
        };

        migrate::apply_migrations(&mut doc)?;
        let raw: RawChannelFile = serde_yaml::from_value(doc)?;
        Self::from_raw(raw, extra_errors).map_err(ChannelConfigError::Invalid)
    }

    fn from_raw(
        raw: RawChannelFile,
        mut errors: Vec<String>,
    ) -> Result<Self, ChannelValidationError> {
        let RawChannelFile {
            schema_version: _,
            name: raw_name,
            source: raw_source,
            destinations: raw_destinations,
            extra_fields,
        } = raw;

        for key in extra_fields.keys() {
            errors.push(format!(
                "error[root]: unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
            ));
        }

        let name = parse_name(raw_name, &mut errors);
        let source = source::parse_source(raw_source, &mut errors);
        let destinations =
            destination::parse_destinations(raw_destinations, &source.resources, &mut errors);

        if errors.is_empty() {
            Ok(Self {
                name,
                source,
                destinations,
            })
        } else {
            Err(ChannelValidationError::new(errors, CURRENT_SCHEMA_VERSION))
        }
    }

    /// One-line description used by the definition checker tool.
    pub fn summary(&self) -> String {
        let enabled = self
            .destinations
            .iter()
            .filter(|destination| destination.enabled)
            .count();
        format!(
            "channel `{}`: respond_from={} after_processing={} threads={} destinations={} ({} enabled)",
            self.name,
            self.source.respond_from.as_str(),
            self.source.respond_after_processing,
            self.source.processing_threads,
            self.destinations.len(),
            enabled,
        )
    }
}

fn parse_name(raw: Option<String>, errors: &mut Vec<String>) -> String {
    match raw {
        None => {
            errors.push("error[root]: name is required".to_string());
            String::new()
        }
        Some(value) => {
            let trimmed = value.trim();
            if !is_valid_name(trimmed) {
                errors.push(format!(
                    "channel name `{trimmed}` must start with an ASCII letter or digit and use only letters, digits, `.`, `_`, or `-`"
                ));
            }
            trimmed.to_string()
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[derive(Debug, Deserialize)]
struct RawChannelFile {
    #[serde(default)]
    schema_version: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    source: Option<source::RawSourceSection>,
    #[serde(default)]
    destinations: Vec<destination::RawDestination>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Error)]
pub enum ChannelConfigError {
    #[error("failed to read channel definition: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse channel definition: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("channel definition schema_version is invalid: {detail}")]
    InvalidVersion { detail: String },
    #[error("channel definition schema_version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u64 },
    #[error("channel definition migration `{name}` (from schema_version {from}) failed: {detail}")]
    Migration {
        from: u64,
        name: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Invalid(ChannelValidationError),
}

#[derive(Debug, Error)]
#[error("channel definition validation failed:\nschema_version: {schema_version}\n{rendered}")]
pub struct ChannelValidationError {
    schema_version: u64,
    rendered: String,
}

impl ChannelValidationError {
    pub fn new(messages: Vec<String>, schema_version: u64) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            schema_version,
            rendered,
        }
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}
