use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One measured channel of a meter data payload.
///
/// All counters are in Wh, power in W. `settlement_energy` accumulates since the
/// last settlement reset and only goes back to zero when the device applies a
/// `reset_settlement` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyChannel {
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
    #[serde(default)]
    pub daily_energy: Option<f64>,
    #[serde(default)]
    pub total_energy: Option<f64>,
    #[serde(default)]
    pub settlement_energy: Option<f64>,
}

/// Channels carried by a [`MeterDataSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Battery,
    Export,
    Import,
    SmartLoad,
    HomeLoad,
    SolarInput,
    SolarOutput,
    NetSolar,
    NetGrid,
}

impl Channel {
    pub const ALL: [Channel; 9] = [
        Channel::Battery,
        Channel::Export,
        Channel::Import,
        Channel::SmartLoad,
        Channel::HomeLoad,
        Channel::SolarInput,
        Channel::SolarOutput,
        Channel::NetSolar,
        Channel::NetGrid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Battery => "battery",
            Channel::Export => "export",
            Channel::Import => "import",
            Channel::SmartLoad => "smart_load",
            Channel::HomeLoad => "home_load",
            Channel::SolarInput => "solar_input",
            Channel::SolarOutput => "solar_output",
            Channel::NetSolar => "net_solar",
            Channel::NetGrid => "net_grid",
        }
    }
}

/// Energy measurement payload published on the meter data topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterDataSnapshot {
    #[serde(default, alias = "meterId")]
    pub meter_id: Option<String>,
    /// Device clock, epoch seconds or milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub battery: Option<EnergyChannel>,
    #[serde(default)]
    pub export: Option<EnergyChannel>,
    #[serde(default)]
    pub import: Option<EnergyChannel>,
    #[serde(default)]
    pub smart_load: Option<EnergyChannel>,
    #[serde(default)]
    pub home_load: Option<EnergyChannel>,
    #[serde(default)]
    pub solar_input: Option<EnergyChannel>,
    #[serde(default)]
    pub solar_output: Option<EnergyChannel>,
    #[serde(default)]
    pub net_solar: Option<EnergyChannel>,
    #[serde(default)]
    pub net_grid: Option<EnergyChannel>,
}

impl MeterDataSnapshot {
    pub fn channel(&self, channel: Channel) -> Option<&EnergyChannel> {
        match channel {
            Channel::Battery => self.battery.as_ref(),
            Channel::Export => self.export.as_ref(),
            Channel::Import => self.import.as_ref(),
            Channel::SmartLoad => self.smart_load.as_ref(),
            Channel::HomeLoad => self.home_load.as_ref(),
            Channel::SolarInput => self.solar_input.as_ref(),
            Channel::SolarOutput => self.solar_output.as_ref(),
            Channel::NetSolar => self.net_solar.as_ref(),
            Channel::NetGrid => self.net_grid.as_ref(),
        }
    }

    /// Raw export and import settlement counters, as reported.
    pub fn settlement_counters(&self) -> (Option<f64>, Option<f64>) {
        (
            self.export.as_ref().and_then(|c| c.settlement_energy),
            self.import.as_ref().and_then(|c| c.settlement_energy),
        )
    }

    /// Net grid power in W, positive when exporting.
    ///
    /// Prefers the device-computed `net_grid` block and falls back to
    /// `export.power - import.power`.
    pub fn net_power_w(&self) -> Option<f64> {
        if let Some(p) = self.net_grid.as_ref().and_then(|c| c.power) {
            if p.is_finite() {
                return Some(p);
            }
        }

        let export = self.export.as_ref().and_then(|c| c.power);
        let import = self.import.as_ref().and_then(|c| c.power);
        match (export, import) {
            (None, None) => None,
            (e, i) => {
                let net = e.unwrap_or(0.0) - i.unwrap_or(0.0);
                net.is_finite().then_some(net)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiStatus {
    #[serde(default)]
    pub connected: Option<bool>,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttStatus {
    #[serde(default)]
    pub connected: Option<bool>,
    #[serde(default)]
    pub reconnects: Option<u32>,
}

/// Device and connectivity metadata published on the meter status topic.
///
/// Only used for health views; settlement never reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterStatusSnapshot {
    #[serde(default, alias = "meterId")]
    pub meter_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub wifi: Option<WifiStatus>,
    /// Current grid relay mode as reported by the device (`import`, `export`, `off`).
    #[serde(default)]
    pub grid_mode: Option<String>,
    #[serde(default)]
    pub mqtt: Option<MqttStatus>,
    #[serde(default)]
    pub free_memory: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub sensors: BTreeMap<String, bool>,
}

/// Normalise a device timestamp to epoch milliseconds.
///
/// Devices report either seconds or milliseconds; anything below 10^11 is
/// taken as seconds. Non-positive values are rejected.
pub fn device_timestamp_ms(raw: i64) -> Option<i64> {
    if raw <= 0 {
        None
    } else if raw < 100_000_000_000 {
        raw.checked_mul(1000)
    } else {
        Some(raw)
    }
}
