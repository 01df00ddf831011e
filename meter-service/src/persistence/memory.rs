use std::collections::{BTreeMap, HashMap};

use meter_client::domain::{
    settlement_id, HourlyAggregate, MeterOwner, NewSettlement, SettlementFinalization,
    SettlementRecord, SettlementStatus,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    AggregateRepository, MeterRegistry, RepositoryError, SettlementFilter, SettlementRepository,
};

/// Aggregates held in process, keyed like the durable table.
#[derive(Default)]
pub struct InMemoryAggregateRepository {
    rows: Mutex<BTreeMap<(String, OffsetDateTime), HourlyAggregate>>,
}

impl InMemoryAggregateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<HourlyAggregate> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl AggregateRepository for InMemoryAggregateRepository {
    async fn upsert(&self, rows: &[HourlyAggregate]) -> Result<u64, RepositoryError> {
        let mut map = self.rows.lock().await;
        for row in rows {
            map.insert((row.meter_id.clone(), row.hour_start), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn history(&self, meter_id: &str, since: OffsetDateTime) -> Result<Vec<HourlyAggregate>, RepositoryError> {
        let map = self.rows.lock().await;
        let mut out: Vec<HourlyAggregate> = map
            .values()
            .filter(|a| a.meter_id == meter_id && a.hour_start >= since)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.hour_start);
        Ok(out)
    }

    async fn older_than(&self, before: OffsetDateTime, limit: i64) -> Result<Vec<HourlyAggregate>, RepositoryError> {
        let map = self.rows.lock().await;
        let mut out: Vec<HourlyAggregate> = map.values().filter(|a| a.hour_start < before).cloned().collect();
        out.sort_by(|a, b| a.hour_start.cmp(&b.hour_start).then_with(|| a.meter_id.cmp(&b.meter_id)));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn count_older_than(&self, before: OffsetDateTime) -> Result<i64, RepositoryError> {
        let map = self.rows.lock().await;
        Ok(map.values().filter(|a| a.hour_start < before).count() as i64)
    }

    async fn delete(&self, keys: &[(String, OffsetDateTime)]) -> Result<u64, RepositoryError> {
        let mut map = self.rows.lock().await;
        let removed = keys.iter().filter(|k| map.remove(*k).is_some()).count();
        Ok(removed as u64)
    }
}

#[derive(Default)]
struct SettlementTable {
    next_id: i64,
    records: Vec<SettlementRecord>,
}

/// Settlement records held in process with the same guarded transitions as the
/// durable table.
#[derive(Default)]
pub struct InMemorySettlementRepository {
    table: Mutex<SettlementTable>,
}

impl InMemorySettlementRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<SettlementRecord> {
        self.table.lock().await.records.clone()
    }

    /// Insert a record as-is, for seeding history.
    pub async fn insert(&self, record: SettlementRecord) {
        let mut t = self.table.lock().await;
        t.next_id = t.next_id.max(record.id);
        t.records.push(record);
    }
}

fn pending_mut<'a>(
    records: &'a mut [SettlementRecord],
    settlement_id: &str,
) -> Result<&'a mut SettlementRecord, RepositoryError> {
    let rec = records
        .iter_mut()
        .find(|r| r.settlement_id == settlement_id)
        .ok_or_else(|| RepositoryError::NotFound(settlement_id.to_string()))?;
    if rec.status.is_terminal() {
        return Err(RepositoryError::AlreadyFinal {
            settlement_id: settlement_id.to_string(),
            status: rec.status,
        });
    }
    Ok(rec)
}

#[async_trait::async_trait]
impl SettlementRepository for InMemorySettlementRepository {
    async fn create_pending(&self, new: NewSettlement) -> Result<SettlementRecord, RepositoryError> {
        let mut t = self.table.lock().await;
        t.next_id += 1;
        let id = t.next_id;

        let record = SettlementRecord {
            id,
            settlement_id: settlement_id(id, new.created_at_backend),
            meter_id: new.meter_id,
            owner_id: new.owner_id,
            period_start_time: new.period_start_time,
            period_end_time: new.period_end_time,
            raw_export_wh: new.raw_export_wh,
            raw_import_wh: new.raw_import_wh,
            net_wh_from_grid: new.net_wh_from_grid,
            etk_amount_credited: new.etk_amount_credited,
            status: SettlementStatus::Pending,
            settlement_trigger: new.settlement_trigger,
            blockchain_tx_hash: None,
            failure_reason: None,
            created_at_backend: new.created_at_backend,
            confirmed_at_on_chain: None,
        };
        t.records.push(record.clone());
        Ok(record)
    }

    async fn attach_tx_hash(&self, settlement_id: &str, tx_hash: &str) -> Result<SettlementRecord, RepositoryError> {
        let mut t = self.table.lock().await;
        let rec = pending_mut(&mut t.records, settlement_id)?;
        rec.blockchain_tx_hash = Some(tx_hash.to_string());
        Ok(rec.clone())
    }

    async fn finalize(
        &self,
        settlement_id: &str,
        fin: SettlementFinalization,
    ) -> Result<SettlementRecord, RepositoryError> {
        let mut t = self.table.lock().await;
        let rec = pending_mut(&mut t.records, settlement_id)?;
        rec.status = fin.status;
        if let Some(hash) = fin.blockchain_tx_hash {
            rec.blockchain_tx_hash = Some(hash);
        }
        if let Some(amount) = fin.etk_amount_credited {
            rec.etk_amount_credited = amount;
        }
        rec.failure_reason = fin.failure_reason;
        rec.confirmed_at_on_chain = Some(fin.confirmed_at_on_chain);
        Ok(rec.clone())
    }

    async fn get(&self, settlement_id: &str) -> Result<Option<SettlementRecord>, RepositoryError> {
        let t = self.table.lock().await;
        Ok(t.records.iter().find(|r| r.settlement_id == settlement_id).cloned())
    }

    async fn history(&self, filter: &SettlementFilter) -> Result<Vec<SettlementRecord>, RepositoryError> {
        let t = self.table.lock().await;
        let mut out: Vec<SettlementRecord> = t
            .records
            .iter()
            .filter(|r| filter.meter_id.as_deref().map_or(true, |m| r.meter_id == m))
            .filter(|r| filter.owner_id.as_deref().map_or(true, |o| r.owner_id == o))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.created_at_backend
                .cmp(&a.created_at_backend)
                .then_with(|| b.id.cmp(&a.id))
        });
        out.truncate(filter.limit.max(0) as usize);
        Ok(out)
    }

    async fn latest_not_failed(&self, meter_id: &str) -> Result<Option<SettlementRecord>, RepositoryError> {
        let t = self.table.lock().await;
        Ok(t.records
            .iter()
            .filter(|r| r.meter_id == meter_id && r.status != SettlementStatus::Failed)
            .max_by(|a, b| {
                a.created_at_backend
                    .cmp(&b.created_at_backend)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned())
    }

    async fn stale_pending(&self, before: OffsetDateTime) -> Result<Vec<SettlementRecord>, RepositoryError> {
        let t = self.table.lock().await;
        let mut out: Vec<SettlementRecord> = t
            .records
            .iter()
            .filter(|r| r.status == SettlementStatus::Pending && r.created_at_backend < before)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at_backend);
        Ok(out)
    }
}

#[derive(Default)]
pub struct InMemoryMeterRegistry {
    owners: Mutex<HashMap<String, MeterOwner>>,
    last_seen: Mutex<HashMap<String, OffsetDateTime>>,
}

impl InMemoryMeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, owner: MeterOwner) {
        self.owners.lock().await.insert(owner.meter_id.clone(), owner);
    }

    pub async fn last_seen(&self, meter_id: &str) -> Option<OffsetDateTime> {
        self.last_seen.lock().await.get(meter_id).copied()
    }
}

#[async_trait::async_trait]
impl MeterRegistry for InMemoryMeterRegistry {
    async fn touch_last_seen(&self, meter_id: &str, at: OffsetDateTime) -> Result<(), RepositoryError> {
        self.last_seen.lock().await.insert(meter_id.to_string(), at);
        Ok(())
    }

    async fn owner_of(&self, meter_id: &str) -> Result<Option<MeterOwner>, RepositoryError> {
        Ok(self.owners.lock().await.get(meter_id).cloned())
    }
}
