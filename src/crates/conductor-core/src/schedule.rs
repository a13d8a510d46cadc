//! Cron scheduler - time-triggered ensemble dispatch
//!
//! The scheduler owns no execution logic: it parses the 5-field cron
//! expressions declared on ensembles, computes fire times, and hands each
//! firing to a [`Dispatcher`] (usually a thin wrapper over
//! [`crate::driver::Engine::run`]). Each dispatch carries the schedule's
//! declared `input` plus firing metadata under the reserved
//! [`SCHEDULE_METADATA_KEY`]:
//!
//! ```json
//! {
//!   "window": "daily",
//!   "$schedule": {
//!     "cron": "0 3 * * *",
//!     "scheduledTime": "2026-08-01T03:00:00Z",
//!     "triggeredAt": "2026-08-01T03:00:00.118Z"
//!   }
//! }
//! ```

use crate::error::{EngineError, Result};
use crate::executor::scope::CancelScope;
use crate::flow::{Ensemble, ScheduleDef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;

/// Reserved input key carrying firing metadata
pub const SCHEDULE_METADATA_KEY: &str = "$schedule";

/// Receives scheduled firings. Implementations route to the engine.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, ensemble: &str, input: Value);
}

/// One registered cron binding
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub ensemble: String,
    pub def: ScheduleDef,
    schedule: Schedule,
}

impl ScheduleEntry {
    /// Parse a standard 5-field cron expression. The underlying parser
    /// wants a seconds field, so firings are pinned to second zero.
    pub fn new(ensemble: impl Into<String>, def: ScheduleDef) -> Result<Self> {
        let fields: Vec<&str> = def.cron.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::Validation(format!(
                "cron expression '{}' must have 5 fields",
                def.cron
            )));
        }
        let with_seconds = format!("0 {}", def.cron);
        let schedule = Schedule::from_str(&with_seconds).map_err(|e| {
            EngineError::Validation(format!("invalid cron expression '{}': {e}", def.cron))
        })?;
        Ok(Self {
            ensemble: ensemble.into(),
            def,
            schedule,
        })
    }

    /// The next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Assemble the dispatch input: declared input plus firing metadata.
    pub fn build_input(&self, scheduled_time: DateTime<Utc>, triggered_at: DateTime<Utc>) -> Value {
        let mut input = match &self.def.input {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
            None => Map::new(),
        };
        input.insert(
            SCHEDULE_METADATA_KEY.to_string(),
            json!({
                "cron": self.def.cron,
                "scheduledTime": scheduled_time,
                "triggeredAt": triggered_at,
            }),
        );
        Value::Object(input)
    }
}

/// Holds entries and drives the firing loop
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register all enabled schedules of an ensemble.
    pub fn add_ensemble(&mut self, ensemble: &Ensemble) -> Result<usize> {
        let mut added = 0;
        for def in &ensemble.schedules {
            if !def.enabled {
                continue;
            }
            self.entries
                .push(ScheduleEntry::new(&ensemble.name, def.clone())?);
            added += 1;
        }
        Ok(added)
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// The soonest upcoming firing across all entries.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<(usize, DateTime<Utc>)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| entry.next_after(after).map(|at| (i, at)))
            .min_by_key(|(_, at)| *at)
    }

    /// Firing loop: sleep to each fire time, dispatch, repeat. Runs until
    /// the scope is cancelled or no entry has a future firing.
    pub async fn run(&self, dispatcher: Arc<dyn Dispatcher>, scope: CancelScope) {
        loop {
            let now = Utc::now();
            let Some((index, fire_at)) = self.next_fire(now) else {
                tracing::info!("scheduler has no upcoming firings, stopping");
                return;
            };

            let wait = (fire_at - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = scope.cancelled() => {
                    tracing::info!("scheduler stopped");
                    return;
                }
            }

            let entry = &self.entries[index];
            let triggered_at = Utc::now();
            let input = entry.build_input(fire_at, triggered_at);
            tracing::debug!(
                ensemble = %entry.ensemble,
                cron = %entry.def.cron,
                "dispatching scheduled run"
            );
            dispatcher.dispatch(&entry.ensemble, input).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn def(cron: &str) -> ScheduleDef {
        ScheduleDef {
            cron: cron.to_string(),
            input: Some(json!({"window": "daily"})),
            enabled: true,
        }
    }

    #[test]
    fn test_five_field_expressions_parse() {
        assert!(ScheduleEntry::new("e", def("0 3 * * *")).is_ok());
        assert!(ScheduleEntry::new("e", def("*/5 * * * *")).is_ok());
        assert!(ScheduleEntry::new("e", def("not a cron")).is_err());
        assert!(ScheduleEntry::new("e", def("0 3 * *")).is_err());
        assert!(ScheduleEntry::new("e", def("0 0 3 * * *")).is_err());
    }

    #[test]
    fn test_next_fire_time() {
        let entry = ScheduleEntry::new("e", def("0 3 * * *")).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let next = entry.next_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_build_input_carries_metadata() {
        let entry = ScheduleEntry::new("e", def("0 3 * * *")).unwrap();
        let scheduled = Utc.with_ymd_and_hms(2026, 8, 1, 3, 0, 0).unwrap();
        let triggered = scheduled + chrono::Duration::milliseconds(118);
        let input = entry.build_input(scheduled, triggered);

        assert_eq!(input["window"], json!("daily"));
        let metadata = &input[SCHEDULE_METADATA_KEY];
        assert_eq!(metadata["cron"], json!("0 3 * * *"));
        assert!(metadata["scheduledTime"].as_str().unwrap().starts_with("2026-08-01T03:00:00"));
    }

    #[test]
    fn test_scheduler_picks_soonest_entry() {
        let mut scheduler = Scheduler::new();
        let mut hourly = Ensemble::new("hourly", vec![]);
        hourly.schedules = vec![def("0 * * * *")];
        let mut daily = Ensemble::new("daily", vec![]);
        daily.schedules = vec![def("0 3 * * *")];

        scheduler.add_ensemble(&hourly).unwrap();
        scheduler.add_ensemble(&daily).unwrap();

        let after = Utc.with_ymd_and_hms(2026, 8, 1, 4, 30, 0).unwrap();
        let (index, at) = scheduler.next_fire(after).unwrap();
        assert_eq!(scheduler.entries()[index].ensemble, "hourly");
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 8, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn test_disabled_schedules_are_skipped() {
        let mut scheduler = Scheduler::new();
        let mut ensemble = Ensemble::new("off", vec![]);
        let mut disabled = def("0 3 * * *");
        disabled.enabled = false;
        ensemble.schedules = vec![disabled];
        assert_eq!(scheduler.add_ensemble(&ensemble).unwrap(), 0);
        assert!(scheduler.next_fire(Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut scheduler = Scheduler::new();
        let mut ensemble = Ensemble::new("e", vec![]);
        ensemble.schedules = vec![def("0 3 * * *")];
        scheduler.add_ensemble(&ensemble).unwrap();

        struct Nop;
        #[async_trait]
        impl Dispatcher for Nop {
            async fn dispatch(&self, _ensemble: &str, _input: Value) {}
        }

        let scope = CancelScope::new();
        let stop = scope.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop.cancel();
        });

        scheduler.run(Arc::new(Nop), scope).await;
        handle.await.unwrap();
    }
}
