use serde::{Deserialize, Serialize};

/// Owning account of a meter as known by the meter registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MeterOwner {
    pub meter_id: String,
    pub owner_id: String,
    /// Ledger address of the owner's primary wallet.
    pub owner_address: Option<String>,
    /// Ledger address registered for the meter itself, if any.
    pub meter_address: Option<String>,
}
