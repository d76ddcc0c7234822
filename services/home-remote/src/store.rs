//! Shared device state and the updates that mutate it
//!
//! Every change to the aggregate is expressed as a [`StateUpdate`], a pure
//! function from the old state to the new one. [`DeviceStore::apply_batch`]
//! applies the updates produced for one inbound frame in order and publishes
//! the result once, so readers never observe half of a frame.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

/// A device known to the backend (sensor, bot, or checker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRecord(Map<String, Value>);

impl DeviceRecord {
    /// Build a record from a JSON object; anything else is rejected
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(|fields| Self(fields.clone()))
    }

    /// The stable identifier, if the record carries one
    pub fn id(&self) -> Option<&Value> {
        self.0.get("id").filter(|id| !id.is_null())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Overwrite only the fields present in `delta`
    pub fn merge(&mut self, delta: &DeviceRecord) {
        for (key, value) in &delta.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

/// Ordered collection of device records with unique identifiers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceCollection(Vec<DeviceRecord>);

impl DeviceCollection {
    /// Build a collection, keeping the first occurrence of each identifier
    pub fn new(records: Vec<DeviceRecord>) -> Self {
        let mut collection = Self::default();
        for record in records {
            let duplicate = record
                .id()
                .is_some_and(|id| collection.position(id).is_some());
            if !duplicate {
                collection.0.push(record);
            }
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn records(&self) -> &[DeviceRecord] {
        &self.0
    }

    pub fn find(&self, id: &Value) -> Option<&DeviceRecord> {
        self.position(id).map(|index| &self.0[index])
    }

    fn position(&self, id: &Value) -> Option<usize> {
        self.0
            .iter()
            .position(|record| record.id().is_some_and(|other| same_id(other, id)))
    }

    /// Merge `delta` into the record with the same id. Returns false, and
    /// leaves the collection untouched, when no such record exists.
    pub fn merge_existing(&mut self, delta: &DeviceRecord) -> bool {
        let Some(id) = delta.id() else {
            return false;
        };
        match self.position(id) {
            Some(index) => {
                self.0[index].merge(delta);
                true
            }
            None => false,
        }
    }

    /// Merge `delta` into the record with the same id, or append it
    pub fn upsert(&mut self, delta: &DeviceRecord) {
        if delta.id().is_none() {
            return;
        }
        if !self.merge_existing(delta) {
            self.0.push(delta.clone());
        }
    }
}

/// Numbers match by value (`1` and `1.0` are one id); everything else,
/// including a number against its string form, must be equal
fn same_id(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_f64() || y.is_f64() => {
            x.as_f64() == y.as_f64()
        }
        _ => a == b,
    }
}

/// The aggregate state the UI reads from.
///
/// Sensor readings are kept as `f64` because the backend may send them as
/// numbers or numeric strings, so an integer reading serializes back as a
/// float (`23` becomes `23.0`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub humidity: Option<f64>,
    pub temperature: Option<f64>,
    pub switch_bot_list: DeviceCollection,
    pub checker_list: DeviceCollection,
    pub profile: Option<Value>,
}

/// Which device collection an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKey {
    SwitchBots,
    Checkers,
}

/// Which scalar sensor value an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKey {
    Humidity,
    Temperature,
}

/// A single change to the aggregate state
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    SetSensor(SensorKey, Option<f64>),
    ReplaceCollection(CollectionKey, DeviceCollection),
    MergeExisting(CollectionKey, DeviceRecord),
    Upsert(CollectionKey, DeviceRecord),
    SetProfile(Value),
}

impl StateUpdate {
    /// Produce the next state from `state`
    pub fn apply(&self, mut state: DeviceState) -> DeviceState {
        match self {
            StateUpdate::SetSensor(SensorKey::Humidity, value) => state.humidity = *value,
            StateUpdate::SetSensor(SensorKey::Temperature, value) => state.temperature = *value,
            StateUpdate::ReplaceCollection(key, collection) => {
                *collection_mut(&mut state, *key) = collection.clone();
            }
            StateUpdate::MergeExisting(key, delta) => {
                collection_mut(&mut state, *key).merge_existing(delta);
            }
            StateUpdate::Upsert(key, delta) => collection_mut(&mut state, *key).upsert(delta),
            StateUpdate::SetProfile(profile) => state.profile = Some(profile.clone()),
        }
        state
    }
}

fn collection_mut(state: &mut DeviceState, key: CollectionKey) -> &mut DeviceCollection {
    match key {
        CollectionKey::SwitchBots => &mut state.switch_bot_list,
        CollectionKey::Checkers => &mut state.checker_list,
    }
}

/// Handle to the shared device state
#[derive(Debug, Clone)]
pub struct DeviceStore {
    sender: Arc<watch::Sender<DeviceState>>,
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(DeviceState::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> DeviceState {
        self.sender.borrow().clone()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.sender.subscribe()
    }

    /// Apply `updates` in order as one step. Readers are notified only if
    /// the resulting state differs from the previous one.
    pub fn apply_batch(&self, updates: Vec<StateUpdate>) -> bool {
        if updates.is_empty() {
            return false;
        }
        self.sender.send_if_modified(|state| {
            let next = updates
                .iter()
                .fold(state.clone(), |acc, update| update.apply(acc));
            if next == *state {
                return false;
            }
            *state = next;
            true
        })
    }
}
