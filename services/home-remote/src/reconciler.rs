//! Translate inbound live-socket frames into state updates
//!
//! Frames are JSON objects whose top-level keys each describe one kind of
//! change. Parsing is permissive: a frame that is not a JSON object, or a key
//! whose value has the wrong shape, simply contributes no update.

use serde_json::{Map, Value};
use tracing::debug;

use crate::store::{
    CollectionKey, DeviceCollection, DeviceRecord, DeviceStore, SensorKey, StateUpdate,
};

pub const HUMIDITY: &str = "humidity";
pub const TEMPERATURE: &str = "temperature";
pub const SWITCH_BOT_LIST: &str = "switchBotList";
pub const CHECKER_LIST: &str = "checkerList";
pub const DEVICE: &str = "device";
pub const CHECKER: &str = "checker";
pub const SWITCH_BOT: &str = "switchBot";

/// Parse a frame into the ordered list of updates it implies
pub fn parse_frame(text: &str) -> Vec<StateUpdate> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => updates_for(&fields),
        Ok(other) => {
            debug!("Ignoring non-object frame: {}", other);
            Vec::new()
        }
        Err(e) => {
            debug!("Ignoring unparsable frame: {}", e);
            Vec::new()
        }
    }
}

fn updates_for(fields: &Map<String, Value>) -> Vec<StateUpdate> {
    let mut updates = Vec::new();

    for (key, sensor) in [
        (HUMIDITY, SensorKey::Humidity),
        (TEMPERATURE, SensorKey::Temperature),
    ] {
        if let Some(value) = fields.get(key).and_then(numeric) {
            let stored = if value > 0.0 { Some(value) } else { None };
            updates.push(StateUpdate::SetSensor(sensor, stored));
        }
    }

    for (key, collection) in [
        (SWITCH_BOT_LIST, CollectionKey::SwitchBots),
        (CHECKER_LIST, CollectionKey::Checkers),
    ] {
        if let Some(Value::Array(items)) = fields.get(key) {
            let records = items.iter().filter_map(DeviceRecord::from_value).collect();
            updates.push(StateUpdate::ReplaceCollection(
                collection,
                DeviceCollection::new(records),
            ));
        }
    }

    if let Some(record) = fields.get(DEVICE).and_then(DeviceRecord::from_value) {
        updates.push(StateUpdate::MergeExisting(CollectionKey::SwitchBots, record));
    }
    if let Some(record) = fields.get(CHECKER).and_then(DeviceRecord::from_value) {
        updates.push(StateUpdate::Upsert(CollectionKey::Checkers, record));
    }
    if let Some(record) = fields.get(SWITCH_BOT).and_then(DeviceRecord::from_value) {
        updates.push(StateUpdate::Upsert(CollectionKey::SwitchBots, record));
    }

    updates
}

/// A finite JSON number, or a string holding one
fn numeric(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

/// Applies inbound frames to a [`DeviceStore`]
#[derive(Debug, Clone)]
pub struct UpdateReconciler {
    store: DeviceStore,
}

impl UpdateReconciler {
    pub fn new(store: DeviceStore) -> Self {
        Self { store }
    }

    /// Parse `text` and apply its updates as one batch
    pub fn reconcile(&self, text: &str) -> bool {
        let updates = parse_frame(text);
        debug!("Frame produced {} update(s)", updates.len());
        self.store.apply_batch(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reconciler() -> (UpdateReconciler, DeviceStore) {
        let store = DeviceStore::new();
        (UpdateReconciler::new(store.clone()), store)
    }

    #[test]
    fn positive_sensor_values_are_stored() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"humidity": 45.5, "temperature": 23}"#);
        let state = store.snapshot();
        assert_eq!(state.humidity, Some(45.5));
        assert_eq!(state.temperature, Some(23.0));
    }

    #[test]
    fn non_positive_temperature_becomes_null() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"temperature": 20}"#);
        reconciler.reconcile(r#"{"temperature": -1}"#);
        assert_eq!(store.snapshot().temperature, None);
    }

    #[test]
    fn zero_humidity_becomes_null() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"humidity": 50}"#);
        reconciler.reconcile(r#"{"humidity": 0}"#);
        assert_eq!(store.snapshot().humidity, None);
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"temperature": "24.5"}"#);
        assert_eq!(store.snapshot().temperature, Some(24.5));
    }

    #[test]
    fn non_numeric_sensor_values_are_ignored() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"temperature": 22, "humidity": 40}"#);
        reconciler.reconcile(r#"{"temperature": "warm", "humidity": null}"#);
        let state = store.snapshot();
        assert_eq!(state.temperature, Some(22.0));
        assert_eq!(state.humidity, Some(40.0));
    }

    #[test]
    fn absent_fields_leave_state_untouched() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"temperature": 22}"#);
        reconciler.reconcile(r#"{"humidity": 40}"#);
        assert_eq!(store.snapshot().temperature, Some(22.0));
    }

    #[test]
    fn unparsable_frame_changes_nothing() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"temperature": 22, "switchBotList": [{"id": 1}]}"#);
        let before = store.snapshot();

        assert!(!reconciler.reconcile("{not json"));
        assert!(!reconciler.reconcile("[1, 2, 3]"));
        assert!(!reconciler.reconcile(""));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn list_payloads_replace_collections() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"switchBotList": [{"id": 1, "a": 1}, {"id": 2}]}"#);
        reconciler.reconcile(r#"{"switchBotList": [{"id": 3}], "checkerList": [{"id": 9}, 5]}"#);
        let state = store.snapshot();
        assert_eq!(state.switch_bot_list.len(), 1);
        assert_eq!(state.switch_bot_list.records()[0].id(), Some(&json!(3)));
        assert_eq!(state.checker_list.len(), 1);
    }

    #[test]
    fn device_delta_merges_only_known_bots() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"switchBotList": [{"id": 1, "a": 1}, {"id": 2, "a": 2}]}"#);
        reconciler.reconcile(r#"{"device": {"id": 1, "b": 9}}"#);
        reconciler.reconcile(r#"{"device": {"id": 5, "b": 9}}"#);

        let bots = store.snapshot().switch_bot_list;
        assert_eq!(bots.len(), 2);
        assert_eq!(
            bots.records()[0].fields(),
            json!({"id": 1, "a": 1, "b": 9}).as_object().unwrap()
        );
        assert_eq!(
            bots.records()[1].fields(),
            json!({"id": 2, "a": 2}).as_object().unwrap()
        );
    }

    #[test]
    fn switch_bot_delta_appends_new_bots() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"switchBotList": [{"id": 1, "a": 1}, {"id": 2, "a": 2}]}"#);
        reconciler.reconcile(r#"{"switchBot": {"id": 3, "a": 3}}"#);

        let ids: Vec<_> = store
            .snapshot()
            .switch_bot_list
            .records()
            .iter()
            .map(|r| r.id().cloned())
            .collect();
        assert_eq!(ids, vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);
    }

    #[test]
    fn checker_delta_upserts() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(r#"{"checker": {"id": "door", "open": false, "battery": 80}}"#);
        reconciler.reconcile(r#"{"checker": {"id": "door", "open": true}}"#);

        let checkers = store.snapshot().checker_list;
        assert_eq!(checkers.len(), 1);
        let door = checkers.find(&json!("door")).unwrap();
        assert_eq!(door.get("open"), Some(&json!(true)));
        assert_eq!(door.get("battery"), Some(&json!(80)));
    }

    #[test]
    fn keys_in_one_frame_apply_in_order() {
        let (reconciler, store) = reconciler();
        reconciler.reconcile(
            r#"{"switchBot": {"id": 2, "on": true}, "switchBotList": [{"id": 1}],
                "device": {"id": 1, "on": false}}"#,
        );
        let bots = store.snapshot().switch_bot_list;
        assert_eq!(bots.len(), 2);
        assert_eq!(bots.records()[0].get("on"), Some(&json!(false)));
        assert_eq!(bots.records()[1].id(), Some(&json!(2)));
    }

    #[test]
    fn parse_frame_ignores_unknown_keys() {
        assert!(parse_frame(r#"{"method": "PING", "other": 1}"#).is_empty());
    }
}
