use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const INITIAL_BASE_LOAD_WH: u32 = 1000;
pub const INITIAL_BATTERY_PERCENT: u8 = 50;
pub const LOAD_STEP_WH: u32 = 100;
pub const BATTERY_STEP_PERCENT: u8 = 10;
pub const BATTERY_MAX_PERCENT: u8 = 100;
// Extra draw while the EV is charging
pub const EV_CHARGING_LOAD_WH: u32 = 1000;

const_assert!(LOAD_STEP_WH > 0);
const_assert!(BATTERY_STEP_PERCENT > 0);
const_assert!(INITIAL_BATTERY_PERCENT <= BATTERY_MAX_PERCENT);

/// A single state change, produced either by an operator keystroke or by a
/// remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    IncreaseLoad,
    DecreaseLoad,
    IncreaseBattery,
    DecreaseBattery,
    TogglePlug,
    SetCharging(bool),
    NoOp,
}

/// Immutable copy of the device fields taken inside one critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub base_load_wh: u32,
    pub ev_plugged_in: bool,
    pub ev_charging: bool,
    pub ev_battery_percent: u8,
}

impl DeviceSnapshot {
    /// Meter reading: base load plus the charging draw. Never stored.
    pub fn total_power_wh(&self) -> u32 {
        let charging = if self.ev_charging { EV_CHARGING_LOAD_WH } else { 0 };
        self.base_load_wh.saturating_add(charging)
    }
}

/// Mutable model of the meter and the EV. Holds no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    base_load_wh: u32,
    ev_plugged_in: bool,
    ev_charging: bool,
    ev_battery_percent: u8,
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            base_load_wh: INITIAL_BASE_LOAD_WH,
            ev_plugged_in: false,
            ev_charging: false,
            ev_battery_percent: INITIAL_BATTERY_PERCENT,
        }
    }

    pub fn increase_load(&mut self) {
        self.base_load_wh = self.base_load_wh.saturating_add(LOAD_STEP_WH);
    }

    pub fn decrease_load(&mut self) {
        self.base_load_wh = self.base_load_wh.saturating_sub(LOAD_STEP_WH);
    }

    pub fn increase_battery(&mut self) {
        self.ev_battery_percent = self
            .ev_battery_percent
            .saturating_add(BATTERY_STEP_PERCENT)
            .min(BATTERY_MAX_PERCENT);
    }

    pub fn decrease_battery(&mut self) {
        self.ev_battery_percent = self.ev_battery_percent.saturating_sub(BATTERY_STEP_PERCENT);
    }

    /// Plugging in leaves charging untouched; unplugging aborts it.
    pub fn toggle_plug(&mut self) {
        self.ev_plugged_in = !self.ev_plugged_in;
        if !self.ev_plugged_in {
            self.ev_charging = false;
        }
    }

    /// Remote charging control. Does not require the EV to be plugged in.
    pub fn set_charging(&mut self, on: bool) {
        self.ev_charging = on;
    }

    pub fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::IncreaseLoad => self.increase_load(),
            Mutation::DecreaseLoad => self.decrease_load(),
            Mutation::IncreaseBattery => self.increase_battery(),
            Mutation::DecreaseBattery => self.decrease_battery(),
            Mutation::TogglePlug => self.toggle_plug(),
            Mutation::SetCharging(on) => self.set_charging(on),
            Mutation::NoOp => {}
        }

        debug_assert!(
            self.ev_battery_percent <= BATTERY_MAX_PERCENT,
            "battery level {} above {}",
            self.ev_battery_percent,
            BATTERY_MAX_PERCENT
        );
        debug_assert!(
            mutation != Mutation::TogglePlug || self.ev_plugged_in || !self.ev_charging,
            "unplugging must stop charging"
        );
    }

    pub fn total_power_wh(&self) -> u32 {
        self.snapshot().total_power_wh()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            base_load_wh: self.base_load_wh,
            ev_plugged_in: self.ev_plugged_in,
            ev_charging: self.ev_charging,
            ev_battery_percent: self.ev_battery_percent,
        }
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

/// The one shared instance of [`DeviceState`]. Every read and write takes the
/// same lock for exactly one operation; the lock is never held across I/O.
#[derive(Debug, Clone, Default)]
pub struct SharedDevice {
    inner: Arc<Mutex<DeviceState>>,
}

impl SharedDevice {
    pub fn new() -> Self {
        Self::with_state(DeviceState::new())
    }

    pub fn with_state(state: DeviceState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Applies the mutation and returns the state it produced, both under
    /// one lock acquisition.
    pub async fn apply(&self, mutation: Mutation) -> DeviceSnapshot {
        let mut state = self.inner.lock().await;
        state.apply(mutation);
        state.snapshot()
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        self.inner.lock().await.snapshot()
    }
}
