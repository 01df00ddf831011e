pub mod hourly_aggregate;
pub mod meter_owner;
pub mod meter_snapshot;
pub mod settlement;
pub mod time_series;

pub use hourly_aggregate::{hour_start_ms, ChannelStats, HourlyAggregate, HOUR_MS};
pub use meter_owner::MeterOwner;
pub use meter_snapshot::{
    device_timestamp_ms, Channel, EnergyChannel, MeterDataSnapshot, MeterStatusSnapshot, MqttStatus,
    WifiStatus,
};
pub use settlement::{
    settlement_id, NewSettlement, ParseEnumError, SettlementFinalization, SettlementRecord,
    SettlementStatus, SettlementTrigger,
};
pub use time_series::{
    datetime_from_millis, millis_from_datetime, EntryKind, LatestReading, TimeSeriesEntry,
};
