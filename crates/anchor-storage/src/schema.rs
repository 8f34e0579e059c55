//! Document schema and migrations.
//!
//! Stored documents are normalized once, here, into a typed [`StorageData`].
//! Nothing downstream backfills missing fields.

use std::collections::HashSet;

use anchor_core::lists::UnifiedList;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::history::HISTORY_LIMIT;
use crate::models::{StorageData, SCHEMA_VERSION};

/// Flat list fields that version 0 documents kept at the root.
const LEGACY_LIST_KEYS: &[&str] = &[
    "blockingMode",
    "blockedSites",
    "blockedApps",
    "allowedPaths",
    "productiveSites",
    "productiveApps",
    "productiveMode",
];

/// Parses a stored document, migrating and normalizing it.
///
/// Never fails: unreadable input yields defaults and individually invalid
/// fields fall back to their default value.
pub fn load_document(raw: &str) -> StorageData {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Stored document is corrupt, using defaults: {}", e);
            return StorageData::default();
        }
    };

    let Value::Object(mut obj) = value else {
        warn!("Stored document is not an object, using defaults");
        return StorageData::default();
    };

    run_migrations(&mut obj);
    let mut data = decode_lenient(obj);
    normalize(&mut data);
    data
}

/// Brings an untyped document up to [`SCHEMA_VERSION`].
fn run_migrations(obj: &mut Map<String, Value>) {
    let current_version = obj
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    if current_version > SCHEMA_VERSION {
        warn!(
            "Document schema {} is newer than supported {}, loading anyway",
            current_version, SCHEMA_VERSION
        );
        return;
    }

    if current_version < SCHEMA_VERSION {
        info!(
            "Migrating document from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(obj);
        }

        obj.insert("schemaVersion".into(), Value::from(SCHEMA_VERSION));
    }
}

/// Version 1: flat list fields move into a single default list.
fn migrate_v1(obj: &mut Map<String, Value>) {
    let mut legacy = Map::new();
    for key in LEGACY_LIST_KEYS {
        if let Some(value) = obj.remove(*key) {
            legacy.insert((*key).to_string(), value);
        }
    }

    if legacy.is_empty() {
        return;
    }

    let has_lists = obj
        .get("lists")
        .and_then(Value::as_array)
        .is_some_and(|lists| !lists.is_empty());
    if has_lists {
        return;
    }

    let default = UnifiedList::default();
    legacy.insert("id".into(), Value::from(default.id.clone()));
    legacy.insert("name".into(), Value::from(default.name));
    obj.insert("lists".into(), Value::Array(vec![Value::Object(legacy)]));
    obj.insert("activeListId".into(), Value::from(default.id));
}

/// Decodes field by field, so one bad key does not discard the rest.
fn decode_lenient(obj: Map<String, Value>) -> StorageData {
    let whole = Value::Object(obj.clone());
    if let Ok(data) = serde_json::from_value::<StorageData>(whole) {
        return data;
    }

    let mut kept = Map::new();
    for (key, value) in obj {
        let mut single = Map::new();
        single.insert(key.clone(), value.clone());
        match serde_json::from_value::<StorageData>(Value::Object(single)) {
            Ok(_) => {
                kept.insert(key, value);
            }
            Err(e) => warn!(key = %key, "Dropping invalid stored field: {}", e),
        }
    }

    serde_json::from_value(Value::Object(kept)).unwrap_or_else(|e| {
        warn!("Stored document still invalid after repair, using defaults: {}", e);
        StorageData::default()
    })
}

/// Enforces document invariants. Idempotent.
pub fn normalize(data: &mut StorageData) {
    data.schema_version = SCHEMA_VERSION;
    data.work_minutes = data.work_minutes.max(1);

    let mut seen = HashSet::new();
    data.lists.retain(|list| !list.id.trim().is_empty() && seen.insert(list.id.clone()));
    for list in &mut data.lists {
        list.normalize();
    }
    if data.lists.is_empty() {
        data.lists.push(UnifiedList::default());
    }
    if !data.lists.iter().any(|l| l.id == data.active_list_id) {
        data.active_list_id = data.lists[0].id.clone();
    }

    data.nuclear_sites.retain(|entry| !entry.domains.is_empty());

    if data.session_history.len() > HISTORY_LIMIT {
        let excess = data.session_history.len() - HISTORY_LIMIT;
        data.session_history.drain(..excess);
    }
}
