//! Schema migrations for channel definition documents.
//!
//! Definitions carry a `schema_version`; older documents are upgraded in
//! memory before deserialization. A document missing the field is treated as
//! version 1. Versions newer than [`CURRENT_SCHEMA_VERSION`] are rejected.

use serde_yaml::{Mapping, Value};

use super::ChannelConfigError;

pub const CURRENT_SCHEMA_VERSION: u64 = 4;

pub(crate) struct Migration {
    pub(crate) from: u64,
    pub(crate) name: &'static str,
    pub(crate) apply: fn(&mut Value) -> Result<(), String>,
}

pub(crate) const MIGRATIONS: [Migration; 3] = [
    Migration {
        from: 1,
        name: "split-respond-mode",
        apply: split_respond_mode,
    },
    Migration {
        from: 2,
        name: "add-processing-threads",
        apply: add_processing_threads,
    },
    Migration {
        from: 3,
        name: "rename-queue-on-failure",
        apply: rename_queue_on_failure,
    },
];

/// Upgrades `doc` in place to the current schema and returns the version the
/// document arrived with.
pub(crate) fn apply_migrations(doc: &mut Value) -> Result<u64, ChannelConfigError> {
    let version = read_schema_version(doc)?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(ChannelConfigError::UnsupportedVersion {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    for migration in MIGRATIONS.iter().filter(|step| step.from >= version) {
        (migration.apply)(doc).map_err(|detail| ChannelConfigError::Migration {
            from: migration.from,
            name: migration.name,
            detail,
        })?;
    }

    if let Some(root) = doc.as_mapping_mut() {
        root.insert(
            Value::from("schema_version"),
            Value::from(CURRENT_SCHEMA_VERSION),
        );
    }

    Ok(version)
}

fn read_schema_version(doc: &Value) -> Result<u64, ChannelConfigError> {
    let Some(value) = doc.as_mapping().and_then(|root| root.get("schema_version")) else {
        return Ok(1);
    };

    match value.as_u64() {
        Some(version) if version >= 1 => Ok(version),
        _ => Err(ChannelConfigError::InvalidVersion {
            detail: "schema_version must be a positive integer".to_string(),
        }),
    }
}

fn source_section(doc: &mut Value) -> Option<&mut Mapping> {
    doc.as_mapping_mut()?.get_mut("source")?.as_mapping_mut()
}

/// v1 carried a single `source.respond_mode` that coupled the response origin
/// to its timing. v2 splits it into `respond_from` plus
/// `respond_after_processing`.
fn split_respond_mode(doc: &mut Value) -> Result<(), String> {
    let Some(source) = source_section(doc) else {
        return Ok(());
    };
    let Some(mode) = source.remove("respond_mode") else {
        return Ok(());
    };

    let mode = mode
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| "respond_mode must be a string".to_string())?;

    let (respond_from, after_processing) = match mode.as_str() {
        "immediate" => ("auto_before", false),
        "completed" => ("destinations_completed", true),
        other => return Err(format!("unknown respond_mode `{other}`")),
    };

    source.insert(Value::from("respond_from"), Value::from(respond_from));
    source.insert(
        Value::from("respond_after_processing"),
        Value::from(after_processing),
    );
    Ok(())
}

/// v3 introduced configurable source concurrency; older documents get the
/// previous fixed behavior of one processing thread.
fn add_processing_threads(doc: &mut Value) -> Result<(), String> {
    let Some(source) = source_section(doc) else {
        return Ok(());
    };
    if !source.contains_key("processing_threads") {
        source.insert(Value::from("processing_threads"), Value::from(1u64));
    }
    Ok(())
}

/// v4 replaced the per-destination `queue_on_failure` boolean with the
/// three-valued `queue_policy`.
fn rename_queue_on_failure(doc: &mut Value) -> Result<(), String> {
    let Some(destinations) = doc
        .as_mapping_mut()
        .and_then(|root| root.get_mut("destinations"))
        .and_then(Value::as_sequence_mut)
    else {
        return Ok(());
    };

    for entry in destinations {
        let Some(destination) = entry.as_mapping_mut() else {
            continue;
        };
        let Some(flag) = destination.remove("queue_on_failure") else {
            continue;
        };
        let Some(enabled) = flag.as_bool() else {
            return Err("queue_on_failure must be a boolean".to_string());
        };
        if destination.contains_key("queue_policy") {
            return Err(
                "destination sets both queue_on_failure and queue_policy".to_string(),
            );
        }
        let policy = if enabled { "on_failure" } else { "never" };
        destination.insert(Value::from("queue_policy"), Value::from(policy));
    }
    Ok(())
}
