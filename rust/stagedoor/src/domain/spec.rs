//! Task-spec import/export.
//!
//! A task spec is the portable JSON description of a schedulable purchase:
//! catalog ids, buyer ids, the per-buyer address map and the executor knobs.
//! Exporting and re-importing a spec must reproduce an equivalent draft —
//! one that builds a byte-identical payload given the same buyer and
//! address data. Buyer records themselves are not embedded; imports rejoin
//! the ids against the freshly fetched catalog.

use std::collections::HashMap;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::buyer::{Address, Buyer};
use super::task::{AttemptMode, ExecuteOptions, Selection, Task, TaskDraft};
use crate::error::TaskError;

/// Wall-clock formats accepted for the start-time string.
const START_TIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Portable description of one schedulable purchase task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub project_id: String,
    pub screen_id: String,
    pub sku_id: String,
    /// Buyer ids in selection order.
    pub buyer_ids: Vec<String>,
    /// Chosen address per buyer id.
    #[serde(default)]
    pub buyer_addresses: HashMap<String, Address>,
    /// Local wall-clock start time string; empty means "run immediately".
    #[serde(default)]
    pub time_start: String,
    /// Attempt interval in milliseconds.
    pub interval: u64,
    pub mode: AttemptMode,
    pub total_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Clock offset in effect at export time, in milliseconds. Informational
    /// only on import; a fresh sync always supersedes it.
    #[serde(default)]
    pub time_offset: f64,
}

impl TaskSpec {
    /// Export a task's schedulable shape.
    #[must_use]
    pub fn from_task(task: &Task, time_offset: f64) -> Self {
        Self {
            project_id: task.selection.project_id.clone(),
            screen_id: task.selection.screen_id.clone(),
            sku_id: task.selection.sku_id.clone(),
            buyer_ids: task.buyers.iter().map(|b| b.id.clone()).collect(),
            buyer_addresses: task.address_overrides.clone(),
            time_start: task.fire_time.map(format_start_time).unwrap_or_default(),
            interval: task.options.interval_ms,
            mode: task.options.mode,
            total_attempts: task.options.total_attempts,
            proxy: task.options.proxy.clone(),
            time_offset,
        }
    }

    /// Serialize to pretty JSON, the on-disk interchange format.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a spec from its JSON form.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Rejoin the spec against catalog data into a creatable draft.
    ///
    /// `catalog` is the buyer list fetched for the project; ids present in
    /// the spec but absent from the catalog reject the whole import, since
    /// a silently shrunken buyer list would change the payload's count.
    pub fn into_draft(self, selection: Selection, catalog: &[Buyer]) -> Result<TaskDraft, TaskError> {
        let mut buyers = Vec::with_capacity(self.buyer_ids.len());
        for id in &self.buyer_ids {
            let buyer = catalog
                .iter()
                .find(|b| b.id == *id)
                .ok_or_else(|| TaskError::invalid_spec(format!("unknown buyer id: {id}")))?;
            buyers.push(buyer.clone());
        }

        let fire_time = if self.time_start.trim().is_empty() {
            None
        } else {
            Some(parse_start_time(&self.time_start).ok_or_else(|| {
                TaskError::invalid_spec(format!("unparseable start time: {}", self.time_start))
            })?)
        };

        Ok(TaskDraft {
            selection,
            buyers,
            contact_overrides: HashMap::new(),
            address_overrides: self.buyer_addresses,
            contact_mode: Default::default(),
            shared_contact: None,
            fire_time,
            options: ExecuteOptions {
                interval_ms: self.interval,
                mode: self.mode,
                total_attempts: self.total_attempts,
                proxy: self.proxy,
            },
        })
    }
}

/// Parse a local wall-clock start time string.
#[must_use]
pub fn parse_start_time(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    for format in START_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            if let Some(local) = Local.from_local_datetime(&naive).single() {
                return Some(local.with_timezone(&Utc));
            }
        }
    }
    None
}

/// Format a fire time back into the local wall-clock string form.
#[must_use]
pub fn format_start_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
