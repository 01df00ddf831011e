use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use super::{ledger_call, EnergyFlow, SettlementError, SettlementEstimate};
use crate::{
    clock::Clock,
    commands::{CommandChannel, GridMode, MeterCommand},
    ledger::LedgerClient,
    persistence::MeterRegistry,
};

/// True when the projected burn, scaled by the margin, would consume the balance.
pub fn should_shut_down(projected_burn: f64, balance: f64, margin: f64) -> bool {
    projected_burn > 0.0 && projected_burn * margin >= balance
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownDecision {
    NotImporting,
    NoOwnerAddress,
    Safe { projected_burn: f64, balance: f64 },
    CoolingDown,
    ShutDown { projected_burn: f64, balance: f64 },
}

/// Cuts an importing meter off the grid before it can burn more tokens than
/// its owner holds. The ledger still rejects overdrawn settlements; this only
/// stops the meter earlier.
pub struct AutoShutdownMonitor {
    registry: Arc<dyn MeterRegistry>,
    ledger: Arc<dyn LedgerClient>,
    commands: Arc<dyn CommandChannel>,
    clock: Arc<dyn Clock>,
    token_address: String,
    margin: f64,
    cooldown_ms: i64,
    ledger_timeout: Duration,
    last_sent: Mutex<HashMap<String, i64>>,
}

impl AutoShutdownMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn MeterRegistry>,
        ledger: Arc<dyn LedgerClient>,
        commands: Arc<dyn CommandChannel>,
        clock: Arc<dyn Clock>,
        token_address: impl Into<String>,
        margin: f64,
        cooldown: Duration,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            commands,
            clock,
            token_address: token_address.into(),
            margin,
            cooldown_ms: cooldown.as_millis() as i64,
            ledger_timeout,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, estimate: &SettlementEstimate) -> Result<ShutdownDecision, SettlementError> {
        if estimate.status != EnergyFlow::Importing {
            return Ok(ShutdownDecision::NotImporting);
        }

        let meter_id = estimate.meter_id.as_str();
        let Some(address) = self
            .registry
            .owner_of(meter_id)
            .await?
            .and_then(|o| o.owner_address)
        else {
            return Ok(ShutdownDecision::NoOwnerAddress);
        };

        let balance = ledger_call(
            self.ledger_timeout,
            self.ledger.get_token_balance(&address, &self.token_address),
        )
        .await?;
        let projected_burn = (-estimate.projected_etk_amount).max(0.0);

        if !should_shut_down(projected_burn, balance, self.margin) {
            return Ok(ShutdownDecision::Safe { projected_burn, balance });
        }

        let now = self.clock.now_ms();
        if let Some(at) = self.last_sent.lock().await.get(meter_id) {
            if now - at < self.cooldown_ms {
                return Ok(ShutdownDecision::CoolingDown);
            }
        }

        tracing::warn!(
            meter_id,
            projected_burn,
            balance,
            margin = self.margin,
            "projected burn exceeds balance, switching meter off grid"
        );
        // A failed publish leaves no cooldown, so the next tick retries.
        self.commands.send(meter_id, MeterCommand::grid(GridMode::Off)).await?;
        self.last_sent.lock().await.insert(meter_id.to_string(), now);
        metrics::counter!("auto_shutdown_commands_total").increment(1);

        Ok(ShutdownDecision::ShutDown { projected_burn, balance })
    }
}
