use crate::device::DeviceSnapshot;
use chrono::{DateTime, Utc};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use static_assertions::const_assert;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::{uuid, Uuid};

pub const EVENT_NAME: &str = "SensorReadingEvent";
pub const METER_DEVICE_ID: Uuid = uuid!("de286df4-71ea-427e-8519-104830ae1559");
pub const EV_DEVICE_ID: Uuid = uuid!("85fd20a9-c85c-4dc0-a6c9-2e20d5df1de2");

pub const MAX_CHARACTERISTICS: usize = 8;
const METER_CHARACTERISTICS: usize = 1;
const EV_CHARACTERISTICS: usize = 3;

const_assert!(METER_CHARACTERISTICS <= MAX_CHARACTERISTICS);
const_assert!(EV_CHARACTERISTICS <= MAX_CHARACTERISTICS);

pub type Characteristics = Vec<Characteristic, MAX_CHARACTERISTICS>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("characteristic {0} does not fit in an event (max {MAX_CHARACTERISTICS})")]
    CharacteristicsFull(String),
}

/// Collects characteristics in order, failing instead of dropping any.
pub fn characteristics(
    items: impl IntoIterator<Item = Characteristic>,
) -> Result<Characteristics, TelemetryError> {
    let mut list = Characteristics::new();
    for item in items {
        list.push(item)
            .map_err(|rejected| TelemetryError::CharacteristicsFull(rejected.name))?;
    }
    Ok(list)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Meter,
    ElectricVehicle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Decimal,
    Boolean,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRef {
    pub id: Uuid,
    #[serde(rename = "Type")]
    pub kind: DeviceType,
}

/// One named reading. The value always travels as a string, typed by
/// `value_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Characteristic {
    pub name: String,
    pub value: String,
    pub value_type: ValueType,
}

impl Characteristic {
    pub fn decimal(name: &str, value: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            value_type: ValueType::Decimal,
        }
    }

    /// Booleans go out as `"True"` / `"False"`.
    pub fn boolean(name: &str, value: bool) -> Self {
        Self {
            name: name.to_string(),
            value: if value { "True" } else { "False" }.to_string(),
            value_type: ValueType::Boolean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryEvent {
    pub event_instance_id: Uuid,
    pub event_name: String,
    pub event_time: DateTime<Utc>,
    pub device: DeviceRef,
    pub characteristics: Characteristics,
}

impl TelemetryEvent {
    pub fn to_json_bytes(&self) -> Result<alloc::vec::Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn characteristic(&self, name: &str) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.name == name)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Uuid;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Hands out 1, 2, 3, ... as UUIDs.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Uuid {
        Uuid::from_u128(u128::from(self.next.fetch_add(1, Ordering::Relaxed)) + 1)
    }
}

/// Turns a device snapshot into the meter event and the EV event, in that
/// order.
pub struct TelemetrySerializer {
    clock: Box<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

impl TelemetrySerializer {
    pub fn new(clock: impl Clock + 'static, ids: impl IdGenerator + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            ids: Box::new(ids),
        }
    }

    pub fn system() -> Self {
        Self::new(SystemClock, RandomIds)
    }

    pub fn serialize(&self, snapshot: &DeviceSnapshot) -> Result<[TelemetryEvent; 2], TelemetryError> {
        Ok([self.meter_event(snapshot)?, self.ev_event(snapshot)?])
    }

    pub fn meter_event(&self, snapshot: &DeviceSnapshot) -> Result<TelemetryEvent, TelemetryError> {
        let characteristics = characteristics([Characteristic::decimal(
            "power_consumption_wh",
            snapshot.total_power_wh(),
        )])?;
        Ok(self.event(DeviceType::Meter, METER_DEVICE_ID, characteristics))
    }

    pub fn ev_event(&self, snapshot: &DeviceSnapshot) -> Result<TelemetryEvent, TelemetryError> {
        let characteristics = characteristics([
            Characteristic::boolean("ev_plugged_in", snapshot.ev_plugged_in),
            Characteristic::decimal("ev_battery_level", snapshot.ev_battery_percent),
            Characteristic::boolean("ev_charging", snapshot.ev_charging),
        ])?;
        Ok(self.event(DeviceType::ElectricVehicle, EV_DEVICE_ID, characteristics))
    }

    fn event(&self, kind: DeviceType, id: Uuid, characteristics: Characteristics) -> TelemetryEvent {
        TelemetryEvent {
            event_instance_id: self.ids.next_id(),
            event_name: EVENT_NAME.to_string(),
            event_time: self.clock.now(),
            device: DeviceRef { id, kind },
            characteristics,
        }
    }
}

impl Default for TelemetrySerializer {
    fn default() -> Self {
        Self::system()
    }
}

/// Decodes the characteristics the way the downstream enrichment stage does:
/// decimals become floats, booleans become 1/0, strings pass through. A
/// decimal that does not parse is kept as its raw string.
pub fn flatten_characteristics(event: &TelemetryEvent) -> Map<String, Value> {
    event
        .characteristics
        .iter()
        .map(|c| {
            let value = match c.value_type {
                ValueType::Decimal => c
                    .value
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map_or_else(|| Value::String(c.value.clone()), Value::Number),
                ValueType::Boolean => Value::from(u8::from(c.value.eq_ignore_ascii_case("true"))),
                ValueType::String => Value::String(c.value.clone()),
            };
            (c.name.clone(), value)
        })
        .collect()
}
