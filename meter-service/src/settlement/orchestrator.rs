use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{stream, StreamExt};
use meter_client::domain::{
    datetime_from_millis, millis_from_datetime, MeterOwner, NewSettlement, SettlementFinalization,
    SettlementRecord, SettlementStatus, SettlementTrigger,
};

use super::{ledger_call, PowerSampleBuffer, SettlementError};
use crate::{
    clock::Clock,
    commands::{CommandChannel, MeterCommand},
    config::SettlementConfig,
    ledger::{signed_etk_amount, LedgerClient, TxReceipt},
    persistence::{MeterRegistry, RepositoryError, SettlementRepository},
    telemetry::TelemetryStore,
};

/// What one settlement attempt for one meter ended in.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// Another cycle is already settling this meter.
    InFlight,
    NoReading,
    /// The latest reading predates the previous settlement.
    StaleReading,
    BelowMinimum { net_wh: f64, min_wh: f64 },
    NoOwner,
    NotAuthorized,
    /// Submitted to the ledger; the record stays PENDING with its tx hash.
    Submitted(SettlementRecord),
    Failed(SettlementRecord),
}

impl SettlementOutcome {
    fn label(&self) -> &'static str {
        match self {
            SettlementOutcome::InFlight => "in_flight",
            SettlementOutcome::NoReading => "no_reading",
            SettlementOutcome::StaleReading => "stale_reading",
            SettlementOutcome::BelowMinimum { .. } => "below_minimum",
            SettlementOutcome::NoOwner => "no_owner",
            SettlementOutcome::NotAuthorized => "not_authorized",
            SettlementOutcome::Submitted(_) => "submitted",
            SettlementOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub meters: usize,
    pub submitted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub unresolved: usize,
}

/// Counter values a meter reported when its settlement reset could not be
/// delivered. Energy up to these values is already on the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SettledCounters {
    export_wh: f64,
    import_wh: f64,
}

/// Removes the meter from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    meter_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.meter_id);
    }
}

/// Settles meters against the ledger. One instance per meter population; the
/// in-flight set, undelivered-reset counters and unrecorded tx hashes live in
/// this process only.
pub struct SettlementOrchestrator {
    store: Arc<dyn TelemetryStore>,
    settlements: Arc<dyn SettlementRepository>,
    registry: Arc<dyn MeterRegistry>,
    ledger: Arc<dyn LedgerClient>,
    commands: Arc<dyn CommandChannel>,
    buffer: Arc<PowerSampleBuffer>,
    clock: Arc<dyn Clock>,
    settings: SettlementConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Meters whose last reset command failed.
    unreset: Mutex<HashMap<String, SettledCounters>>,
    /// Ledger tx hashes that could not be written to their record, by settlement id.
    unrecorded_tx: Mutex<HashMap<String, String>>,
}

impl SettlementOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        settlements: Arc<dyn SettlementRepository>,
        registry: Arc<dyn MeterRegistry>,
        ledger: Arc<dyn LedgerClient>,
        commands: Arc<dyn CommandChannel>,
        buffer: Arc<PowerSampleBuffer>,
        clock: Arc<dyn Clock>,
        settings: SettlementConfig,
    ) -> Self {
        Self {
            store,
            settlements,
            registry,
            ledger,
            commands,
            buffer,
            clock,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            unreset: Mutex::new(HashMap::new()),
            unrecorded_tx: Mutex::new(HashMap::new()),
        }
    }

    fn ledger_timeout(&self) -> Duration {
        self.settings.ledger_timeout()
    }

    fn claim(&self, meter_id: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(meter_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            meter_id: meter_id.to_string(),
        })
    }

    fn settled_counters(&self, meter_id: &str) -> Option<SettledCounters> {
        self.unreset
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(meter_id)
            .copied()
    }

    fn set_settled_counters(&self, meter_id: &str, counters: Option<SettledCounters>) {
        let mut unreset = self.unreset.lock().unwrap_or_else(PoisonError::into_inner);
        match counters {
            Some(c) => unreset.insert(meter_id.to_string(), c),
            None => unreset.remove(meter_id),
        };
    }

    /// The ledger tx hash for a record, including one not yet written to the repository.
    fn known_tx_hash(&self, record: &SettlementRecord) -> Option<String> {
        record.blockchain_tx_hash.clone().or_else(|| {
            self.unrecorded_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&record.settlement_id)
                .cloned()
        })
    }

    fn forget_unrecorded_tx(&self, settlement_id: &str) {
        self.unrecorded_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(settlement_id);
    }

    /// Settle every meter with a live data reading, `workers` at a time.
    pub async fn settle_all(&self) -> CycleReport {
        if !self.settings.enabled {
            tracing::debug!("periodic settlement disabled");
            return CycleReport::default();
        }

        let meters: Vec<String> = match self.store.get_all_latest_data().await {
            Ok(latest) => latest.into_keys().collect(),
            Err(e) => {
                tracing::error!(error = %e, "settlement cycle skipped, telemetry store unavailable");
                return CycleReport::default();
            }
        };

        let mut report = CycleReport {
            meters: meters.len(),
            ..Default::default()
        };

        let outcomes: Vec<(String, Result<SettlementOutcome, SettlementError>)> = stream::iter(meters)
            .map(|meter_id| async move {
                let result = self.settle_meter(&meter_id, SettlementTrigger::Periodic).await;
                (meter_id, result)
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        for (meter_id, result) in outcomes {
            match result {
                Ok(SettlementOutcome::Submitted(_)) => report.submitted += 1,
                Ok(SettlementOutcome::Failed(_)) => report.failed += 1,
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(%meter_id, error = %e, "settlement cycle for meter abandoned");
                }
            }
        }

        tracing::info!(
            meters = report.meters,
            submitted = report.submitted,
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors,
            "settlement cycle complete"
        );
        report
    }

    /// On-demand settlement by the meter's owner.
    pub async fn settle_meter_manual(
        &self,
        meter_id: &str,
        caller_owner_id: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let owner = self
            .registry
            .owner_of(meter_id)
            .await?
            .ok_or_else(|| SettlementError::UnknownMeter(meter_id.to_string()))?;
        if owner.owner_id != caller_owner_id {
            return Err(SettlementError::Forbidden {
                meter_id: meter_id.to_string(),
            });
        }
        self.settle_meter(meter_id, SettlementTrigger::Manual).await
    }

    pub async fn settle_meter(
        &self,
        meter_id: &str,
        trigger: SettlementTrigger,
    ) -> Result<SettlementOutcome, SettlementError> {
        let Some(_guard) = self.claim(meter_id) else {
            tracing::debug!(meter_id, "settlement already in flight");
            return Ok(SettlementOutcome::InFlight);
        };

        let outcome = self.settle_claimed(meter_id, trigger).await;
        if let Ok(o) = &outcome {
            metrics::counter!("settlements_total", "outcome" => o.label()).increment(1);
        }
        outcome
    }

    async fn settle_claimed(
        &self,
        meter_id: &str,
        trigger: SettlementTrigger,
    ) -> Result<SettlementOutcome, SettlementError> {
        let Some(latest) = self.store.get_latest_data(meter_id).await? else {
            tracing::debug!(meter_id, "no live reading, nothing to settle");
            return Ok(SettlementOutcome::NoReading);
        };

        let previous = self.settlements.latest_not_failed(meter_id).await?;
        if let Some(prev) = &previous {
            // The device may not have applied the last reset yet.
            if latest.received_at <= millis_from_datetime(prev.created_at_backend) {
                tracing::debug!(
                    meter_id,
                    previous = %prev.settlement_id,
                    "latest reading predates previous settlement"
                );
                return Ok(SettlementOutcome::StaleReading);
            }
        }

        let (export, import) = latest.payload.settlement_counters();
        let raw = SettledCounters {
            export_wh: counter_or_zero(meter_id, "export", export),
            import_wh: counter_or_zero(meter_id, "import", import),
        };

        // Without a delivered reset the counters still include settled energy.
        let (export_wh, import_wh) = match self.settled_counters(meter_id) {
            Some(base) if raw.export_wh >= base.export_wh && raw.import_wh >= base.import_wh => {
                tracing::debug!(meter_id, ?base, "meter not reset since last settlement, settling the increase");
                (raw.export_wh - base.export_wh, raw.import_wh - base.import_wh)
            }
            Some(_) => {
                tracing::info!(meter_id, "meter counters reset");
                self.set_settled_counters(meter_id, None);
                (raw.export_wh, raw.import_wh)
            }
            None => (raw.export_wh, raw.import_wh),
        };
        let net_wh = export_wh - import_wh;

        let min_wh = ledger_call(self.ledger_timeout(), self.ledger.get_min_settlement_wh()).await?;
        if net_wh == 0.0 || net_wh.abs() < min_wh {
            tracing::debug!(meter_id, net_wh, min_wh, "net energy below settlement minimum");
            return Ok(SettlementOutcome::BelowMinimum { net_wh, min_wh });
        }

        let Some((owner, owner_address)) = self.resolve_owner(meter_id).await? else {
            return Ok(SettlementOutcome::NoOwner);
        };

        if !self.ensure_authorized(meter_id, &owner, &owner_address).await? {
            return Ok(SettlementOutcome::NotAuthorized);
        }

        let etk_amount = ledger_call(self.ledger_timeout(), signed_etk_amount(self.ledger.as_ref(), net_wh)).await?;

        let now = self.clock.now();
        let period_start_time = previous
            .as_ref()
            .map(|p| p.period_end_time)
            .unwrap_or_else(|| now - self.settings.interval());

        let record = self
            .settlements
            .create_pending(NewSettlement {
                meter_id: meter_id.to_string(),
                owner_id: owner.owner_id.clone(),
                period_start_time,
                period_end_time: now,
                raw_export_wh: export_wh,
                raw_import_wh: import_wh,
                net_wh_from_grid: net_wh,
                etk_amount_credited: etk_amount,
                settlement_trigger: trigger,
                created_at_backend: now,
            })
            .await?;

        // Fractional Wh are discarded toward zero on the ledger side.
        let ledger_wh = net_wh.trunc() as i64;

        let submitted = ledger_call(
            self.ledger_timeout(),
            self.ledger.process_energy_settlement(
                &owner_address,
                meter_id,
                &owner_address,
                ledger_wh,
                &record.settlement_id,
            ),
        )
        .await;

        match submitted {
            Ok(tx_hash) => {
                tracing::info!(
                    meter_id,
                    settlement_id = %record.settlement_id,
                    net_wh,
                    etk_amount,
                    %tx_hash,
                    "settlement submitted"
                );

                // The energy is on the ledger from here on, whatever else fails.
                let record = match self.settlements.attach_tx_hash(&record.settlement_id, &tx_hash).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        tracing::error!(
                            meter_id,
                            settlement_id = %record.settlement_id,
                            %tx_hash,
                            error = %e,
                            "failed to record tx hash, holding it for reconciliation"
                        );
                        self.unrecorded_tx
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(record.settlement_id.clone(), tx_hash.clone());
                        SettlementRecord {
                            blockchain_tx_hash: Some(tx_hash.clone()),
                            ..record
                        }
                    }
                };

                match self.commands.send(meter_id, MeterCommand::reset_settlement()).await {
                    Ok(_) => self.set_settled_counters(meter_id, None),
                    Err(e) => {
                        tracing::error!(meter_id, error = %e, "failed to send settlement reset to meter");
                        self.set_settled_counters(meter_id, Some(raw));
                    }
                }
                self.buffer.clear(meter_id).await;

                Ok(SettlementOutcome::Submitted(record))
            }
            Err(e) => {
                tracing::error!(
                    meter_id,
                    settlement_id = %record.settlement_id,
                    error = %e,
                    "ledger submission failed"
                );
                let record = self
                    .settlements
                    .finalize(
                        &record.settlement_id,
                        SettlementFinalization {
                            status: SettlementStatus::Failed,
                            blockchain_tx_hash: None,
                            etk_amount_credited: None,
                            failure_reason: Some(e.to_string()),
                            confirmed_at_on_chain: self.clock.now(),
                        },
                    )
                    .await?;
                Ok(SettlementOutcome::Failed(record))
            }
        }
    }

    async fn resolve_owner(&self, meter_id: &str) -> Result<Option<(MeterOwner, String)>, SettlementError> {
        let Some(owner) = self.registry.owner_of(meter_id).await? else {
            tracing::warn!(meter_id, "meter has no registered owner, not settling");
            return Ok(None);
        };
        let Some(address) = owner.owner_address.clone().filter(|a| !a.is_empty()) else {
            tracing::warn!(meter_id, owner_id = %owner.owner_id, "owner has no ledger address, not settling");
            return Ok(None);
        };
        Ok(Some((owner, address)))
    }

    /// Check both authorizations and make a single authorization attempt when
    /// either is missing.
    async fn ensure_authorized(
        &self,
        meter_id: &str,
        owner: &MeterOwner,
        owner_address: &str,
    ) -> Result<bool, SettlementError> {
        let timeout = self.ledger_timeout();
        let meter_ok = ledger_call(timeout, self.ledger.is_meter_id_authorized(meter_id)).await?;
        let address_ok = ledger_call(timeout, self.ledger.is_meter_authorized(owner_address)).await?;
        if meter_ok && address_ok {
            return Ok(true);
        }

        let meter_address = owner.meter_address.as_deref().unwrap_or(owner_address);
        tracing::info!(meter_id, meter_ok, address_ok, "meter not authorized, attempting authorization");
        match ledger_call(timeout, self.ledger.authorize_meter(owner_address, meter_id, meter_address)).await {
            Ok(tx_hash) => {
                tracing::info!(meter_id, %tx_hash, "meter authorized");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(meter_id, error = %e, "meter authorization failed, skipping this cycle");
                Ok(false)
            }
        }
    }

    /// Record the on-chain outcome of a submitted settlement.
    ///
    /// A supplied token amount takes the sign of the record's net energy.
    pub async fn confirm_settlement(
        &self,
        settlement_id: &str,
        tx_hash: &str,
        success: bool,
        etk_amount: Option<f64>,
    ) -> Result<SettlementRecord, SettlementError> {
        let record = self
            .settlements
            .get(settlement_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(settlement_id.to_string()))?;

        match self.known_tx_hash(&record) {
            None => return Err(SettlementError::NotSubmitted(settlement_id.to_string())),
            Some(known) if known != tx_hash => {
                return Err(SettlementError::TxHashMismatch {
                    settlement_id: settlement_id.to_string(),
                })
            }
            Some(_) => {}
        }

        let etk_amount = etk_amount.map(|a| a.abs().copysign(record.net_wh_from_grid));
        let status = if success {
            SettlementStatus::Success
        } else {
            SettlementStatus::Failed
        };

        let record = self
            .settlements
            .finalize(
                settlement_id,
                SettlementFinalization {
                    status,
                    blockchain_tx_hash: Some(tx_hash.to_string()),
                    etk_amount_credited: etk_amount,
                    failure_reason: (!success).then(|| "transaction failed on chain".to_string()),
                    confirmed_at_on_chain: self.clock.now(),
                },
            )
            .await?;
        self.forget_unrecorded_tx(settlement_id);

        tracing::info!(settlement_id, status = %record.status, "settlement confirmed");
        Ok(record)
    }

    /// Resolve PENDING records older than the pending timeout.
    pub async fn reconcile_pending(&self) -> Result<ReconcileReport, SettlementError> {
        let minutes = i64::from(self.settings.pending_timeout_minutes);
        let before = datetime_from_millis(self.clock.now_ms() - minutes * 60_000);
        let stale = self.settlements.stale_pending(before).await?;

        let mut report = ReconcileReport {
            examined: stale.len(),
            ..Default::default()
        };

        for record in stale {
            let sid = record.settlement_id.as_str();
            let tx_hash = self.known_tx_hash(&record);
            let resolution = match tx_hash.as_deref() {
                None => Some((SettlementStatus::Failed, Some("never submitted to ledger".to_string()))),
                Some(tx_hash) => {
                    match ledger_call(self.ledger_timeout(), self.ledger.transaction_receipt(tx_hash)).await {
                        Ok(TxReceipt::Confirmed) => Some((SettlementStatus::Success, None)),
                        Ok(TxReceipt::Reverted) => {
                            Some((SettlementStatus::Failed, Some("transaction reverted".to_string())))
                        }
                        Ok(TxReceipt::Unknown) => {
                            tracing::warn!(settlement_id = sid, tx_hash, "settlement still unconfirmed");
                            None
                        }
                        Err(e) => {
                            tracing::warn!(settlement_id = sid, error = %e, "receipt lookup failed");
                            None
                        }
                    }
                }
            };

            let Some((status, failure_reason)) = resolution else {
                report.unresolved += 1;
                continue;
            };

            let fin = SettlementFinalization {
                status,
                blockchain_tx_hash: tx_hash.clone(),
                etk_amount_credited: None,
                failure_reason,
                confirmed_at_on_chain: self.clock.now(),
            };
            match self.settlements.finalize(sid, fin).await {
                Ok(done) => {
                    self.forget_unrecorded_tx(sid);
                    tracing::info!(settlement_id = sid, status = %done.status, "stale settlement reconciled");
                    match done.status {
                        SettlementStatus::Success => report.confirmed += 1,
                        _ => report.failed += 1,
                    }
                }
                Err(RepositoryError::AlreadyFinal { .. }) => {
                    self.forget_unrecorded_tx(sid);
                    tracing::debug!(settlement_id = sid, "settlement finalized concurrently");
                }
                Err(e) => {
                    tracing::error!(settlement_id = sid, error = %e, "failed to reconcile settlement");
                    report.unresolved += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                confirmed = report.confirmed,
                failed = report.failed,
                unresolved = report.unresolved,
                "pending settlement reconciliation complete"
            );
        }
        Ok(report)
    }
}

fn counter_or_zero(meter_id: &str, name: &str, value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v,
        Some(v) => {
            tracing::warn!(meter_id, counter = name, value = v, "non-finite settlement counter, using 0");
            0.0
        }
        None => {
            tracing::warn!(meter_id, counter = name, "missing settlement counter, using 0");
            0.0
        }
    }
}
