//! Shared fakes and fixtures for integration tests.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use meter_client::domain::{
    EnergyChannel, LatestReading, MeterDataSnapshot, MeterOwner, NewSettlement, SettlementFinalization,
    SettlementRecord,
};
use time::OffsetDateTime;
use meter_service::{
    clock::{Clock, ManualClock},
    commands::{CommandChannel, CommandError, MeterCommand},
    config::SettlementConfig,
    ledger::{LedgerClient, LedgerError, TxReceipt},
    persistence::{
        InMemoryMeterRegistry, InMemorySettlementRepository, RepositoryError, SettlementFilter, SettlementRepository,
    },
    settlement::{AutoShutdownMonitor, PowerSampleBuffer, PowerSampler, SettlementEstimator, SettlementOrchestrator},
    telemetry::{InMemoryTelemetryStore, TelemetryStore},
};

/// 2024-01-01T00:05:00Z, on a five-minute boundary.
pub const NOW: i64 = 1_704_067_500_000;

/// Tokens per Wh used by [`FakeLedger`].
pub const RATE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitBehavior {
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub owner: String,
    pub meter_id: String,
    pub user_address: String,
    pub net_wh: i64,
    pub settlement_id: String,
}

struct LedgerState {
    min_wh: f64,
    balance: f64,
    authorized: bool,
    authorize_succeeds: bool,
    authorize_calls: usize,
    submit: SubmitBehavior,
    submissions: Vec<Submission>,
    receipts: HashMap<String, TxReceipt>,
}

/// In-process ledger with scriptable responses.
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                min_wh: 100.0,
                balance: 1_000.0,
                authorized: true,
                authorize_succeeds: true,
                authorize_calls: 0,
                submit: SubmitBehavior::Succeed,
                submissions: Vec::new(),
                receipts: HashMap::new(),
            }),
        }
    }

    pub fn set_min_wh(&self, v: f64) {
        self.state.lock().unwrap().min_wh = v;
    }

    pub fn set_balance(&self, v: f64) {
        self.state.lock().unwrap().balance = v;
    }

    pub fn set_authorized(&self, authorized: bool, authorize_succeeds: bool) {
        let mut s = self.state.lock().unwrap();
        s.authorized = authorized;
        s.authorize_succeeds = authorize_succeeds;
    }

    pub fn set_submit(&self, b: SubmitBehavior) {
        self.state.lock().unwrap().submit = b;
    }

    pub fn set_receipt(&self, tx_hash: &str, receipt: TxReceipt) {
        self.state.lock().unwrap().receipts.insert(tx_hash.to_string(), receipt);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn authorize_calls(&self) -> usize {
        self.state.lock().unwrap().authorize_calls
    }
}

#[async_trait::async_trait]
impl LedgerClient for FakeLedger {
    async fn get_token_balance(&self, _address: &str, _token: &str) -> Result<f64, LedgerError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn get_min_settlement_wh(&self) -> Result<f64, LedgerError> {
        Ok(self.state.lock().unwrap().min_wh)
    }

    async fn calculate_etk_amount(&self, wh: f64) -> Result<f64, LedgerError> {
        Ok(wh * RATE)
    }

    async fn is_meter_authorized(&self, _address: &str) -> Result<bool, LedgerError> {
        Ok(self.state.lock().unwrap().authorized)
    }

    async fn is_meter_id_authorized(&self, _meter_id: &str) -> Result<bool, LedgerError> {
        Ok(self.state.lock().unwrap().authorized)
    }

    async fn authorize_meter(&self, _owner: &str, _meter_id: &str, _meter_address: &str) -> Result<String, LedgerError> {
        let mut s = self.state.lock().unwrap();
        s.authorize_calls += 1;
        if s.authorize_succeeds {
            s.authorized = true;
            Ok("0xauth".to_string())
        } else {
            Err(LedgerError::Rejected("owner mismatch".to_string()))
        }
    }

    async fn process_energy_settlement(
        &self,
        owner: &str,
        meter_id: &str,
        user_address: &str,
        net_wh: i64,
        settlement_id: &str,
    ) -> Result<String, LedgerError> {
        let behavior = {
            let mut s = self.state.lock().unwrap();
            s.submissions.push(Submission {
                owner: owner.to_string(),
                meter_id: meter_id.to_string(),
                user_address: user_address.to_string(),
                net_wh,
                settlement_id: settlement_id.to_string(),
            });
            s.submit
        };
        match behavior {
            SubmitBehavior::Succeed => Ok(format!("0xtx_{settlement_id}")),
            SubmitBehavior::Fail => Err(LedgerError::Rejected("execution reverted".to_string())),
            SubmitBehavior::Hang => std::future::pending().await,
        }
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<TxReceipt, LedgerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .receipts
            .get(tx_hash)
            .copied()
            .unwrap_or(TxReceipt::Unknown))
    }
}

/// Command channel that records instead of publishing.
#[derive(Default)]
pub struct RecordingCommandChannel {
    sent: Mutex<Vec<(String, MeterCommand)>>,
    failing: AtomicBool,
}

impl RecordingCommandChannel {
    pub fn sent(&self) -> Vec<(String, MeterCommand)> {
        self.sent.lock().unwrap().clone()
    }

    /// While set, every send fails and nothing is recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl CommandChannel for RecordingCommandChannel {
    async fn send(&self, meter_id: &str, command: MeterCommand) -> Result<String, CommandError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CommandError::Transport("bridge down".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((meter_id.to_string(), command));
        Ok(format!("corr-{}", sent.len()))
    }
}

/// Settlement repository whose next `n` tx hash writes fail.
pub struct FailingAttachRepository {
    inner: Arc<InMemorySettlementRepository>,
    attach_failures: AtomicUsize,
}

impl FailingAttachRepository {
    pub fn new(inner: Arc<InMemorySettlementRepository>, attach_failures: usize) -> Self {
        Self {
            inner,
            attach_failures: AtomicUsize::new(attach_failures),
        }
    }
}

#[async_trait::async_trait]
impl SettlementRepository for FailingAttachRepository {
    async fn create_pending(&self, new: NewSettlement) -> Result<SettlementRecord, RepositoryError> {
        self.inner.create_pending(new).await
    }

    async fn attach_tx_hash(&self, settlement_id: &str, tx_hash: &str) -> Result<SettlementRecord, RepositoryError> {
        let remaining = self.attach_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.attach_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::Database(anyhow::anyhow!("connection reset")));
        }
        self.inner.attach_tx_hash(settlement_id, tx_hash).await
    }

    async fn finalize(
        &self,
        settlement_id: &str,
        fin: SettlementFinalization,
    ) -> Result<SettlementRecord, RepositoryError> {
        self.inner.finalize(settlement_id, fin).await
    }

    async fn get(&self, settlement_id: &str) -> Result<Option<SettlementRecord>, RepositoryError> {
        self.inner.get(settlement_id).await
    }

    async fn history(&self, filter: &SettlementFilter) -> Result<Vec<SettlementRecord>, RepositoryError> {
        self.inner.history(filter).await
    }

    async fn latest_not_failed(&self, meter_id: &str) -> Result<Option<SettlementRecord>, RepositoryError> {
        self.inner.latest_not_failed(meter_id).await
    }

    async fn stale_pending(&self, before: OffsetDateTime) -> Result<Vec<SettlementRecord>, RepositoryError> {
        self.inner.stale_pending(before).await
    }
}

pub fn owner(meter_id: &str, owner_id: &str) -> MeterOwner {
    MeterOwner {
        meter_id: meter_id.to_string(),
        owner_id: owner_id.to_string(),
        owner_address: Some(format!("0xowner_{owner_id}")),
        meter_address: Some(format!("0xmeter_{meter_id}")),
    }
}

pub fn counters(export_wh: f64, import_wh: f64) -> MeterDataSnapshot {
    MeterDataSnapshot {
        export: Some(EnergyChannel {
            settlement_energy: Some(export_wh),
            ..Default::default()
        }),
        import: Some(EnergyChannel {
            settlement_energy: Some(import_wh),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryTelemetryStore>,
    pub settlements: Arc<InMemorySettlementRepository>,
    pub registry: Arc<InMemoryMeterRegistry>,
    pub ledger: Arc<FakeLedger>,
    pub commands: Arc<RecordingCommandChannel>,
    pub buffer: Arc<PowerSampleBuffer>,
    pub estimator: Arc<SettlementEstimator>,
    pub orchestrator: Arc<SettlementOrchestrator>,
}

pub fn settlement_config() -> SettlementConfig {
    SettlementConfig {
        ledger_timeout_ms: 200,
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(settlement_config())
}

pub fn harness_with(settings: SettlementConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(InMemoryTelemetryStore::new(
        clock.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(7200),
    ));
    let settlements = Arc::new(InMemorySettlementRepository::new());
    let registry = Arc::new(InMemoryMeterRegistry::new());
    let ledger = Arc::new(FakeLedger::new());
    let commands = Arc::new(RecordingCommandChannel::default());
    let buffer = Arc::new(PowerSampleBuffer::new(Duration::from_secs(600)));

    let estimator = Arc::new(SettlementEstimator::new(
        store.clone(),
        buffer.clone(),
        ledger.clone(),
        clock.clone(),
        settings.interval(),
        50.0,
        settings.ledger_timeout(),
    ));
    let orchestrator = Arc::new(SettlementOrchestrator::new(
        store.clone(),
        settlements.clone(),
        registry.clone(),
        ledger.clone(),
        commands.clone(),
        buffer.clone(),
        clock.clone(),
        settings,
    ));

    Harness {
        clock,
        store,
        settlements,
        registry,
        ledger,
        commands,
        buffer,
        estimator,
        orchestrator,
    }
}

impl Harness {
    /// Store a latest data reading received now.
    pub async fn publish(&self, meter_id: &str, payload: MeterDataSnapshot) {
        let now = self.clock.now_ms();
        self.store
            .store_latest_data(LatestReading {
                meter_id: meter_id.to_string(),
                timestamp: now,
                received_at: now,
                payload,
            })
            .await
            .unwrap();
    }

    pub async fn publish_counters(&self, meter_id: &str, export_wh: f64, import_wh: f64) {
        self.publish(meter_id, counters(export_wh, import_wh)).await;
    }

    /// An orchestrator sharing this harness's fakes but writing to `settlements`.
    pub fn orchestrator_with(&self, settlements: Arc<dyn SettlementRepository>) -> SettlementOrchestrator {
        SettlementOrchestrator::new(
            self.store.clone(),
            settlements,
            self.registry.clone(),
            self.ledger.clone(),
            self.commands.clone(),
            self.buffer.clone(),
            self.clock.clone(),
            settlement_config(),
        )
    }

    pub fn monitor(&self, cooldown: Duration) -> Arc<AutoShutdownMonitor> {
        Arc::new(AutoShutdownMonitor::new(
            self.registry.clone(),
            self.ledger.clone(),
            self.commands.clone(),
            self.clock.clone(),
            "0xtoken",
            1.05,
            cooldown,
            Duration::from_millis(200),
        ))
    }

    pub fn sampler(&self, monitor: Option<Arc<AutoShutdownMonitor>>) -> PowerSampler {
        PowerSampler::new(
            self.store.clone(),
            self.buffer.clone(),
            self.clock.clone(),
            self.estimator.clone(),
            monitor,
        )
    }
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
