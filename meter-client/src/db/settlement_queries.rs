use anyhow::{Context, Result};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{
    settlement_id, NewSettlement, SettlementFinalization, SettlementRecord, SettlementStatus,
};

const SETTLEMENT_COLUMNS: &str = "id, settlement_id, meter_id, owner_id, period_start_time, \
    period_end_time, raw_export_wh, raw_import_wh, net_wh_from_grid, etk_amount_credited, status, \
    settlement_trigger, blockchain_tx_hash, failure_reason, created_at_backend, confirmed_at_on_chain";

#[derive(Debug, Clone, sqlx::FromRow)]
struct SettlementRow {
    id: i64,
    settlement_id: String,
    meter_id: String,
    owner_id: String,
    period_start_time: OffsetDateTime,
    period_end_time: OffsetDateTime,
    raw_export_wh: f64,
    raw_import_wh: f64,
    net_wh_from_grid: f64,
    etk_amount_credited: f64,
    status: String,
    settlement_trigger: String,
    blockchain_tx_hash: Option<String>,
    failure_reason: Option<String>,
    created_at_backend: OffsetDateTime,
    confirmed_at_on_chain: Option<OffsetDateTime>,
}

impl TryFrom<SettlementRow> for SettlementRecord {
    type Error = anyhow::Error;

    fn try_from(r: SettlementRow) -> Result<Self> {
        Ok(SettlementRecord {
            id: r.id,
            status: r.status.parse()?,
            settlement_trigger: r.settlement_trigger.parse()?,
            settlement_id: r.settlement_id,
            meter_id: r.meter_id,
            owner_id: r.owner_id,
            period_start_time: r.period_start_time,
            period_end_time: r.period_end_time,
            raw_export_wh: r.raw_export_wh,
            raw_import_wh: r.raw_import_wh,
            net_wh_from_grid: r.net_wh_from_grid,
            etk_amount_credited: r.etk_amount_credited,
            blockchain_tx_hash: r.blockchain_tx_hash,
            failure_reason: r.failure_reason,
            created_at_backend: r.created_at_backend,
            confirmed_at_on_chain: r.confirmed_at_on_chain,
        })
    }
}

fn into_records(rows: Vec<SettlementRow>) -> Result<Vec<SettlementRecord>> {
    rows.into_iter().map(SettlementRecord::try_from).collect()
}

/// Create a `PENDING` record. The row id is drawn first so the public
/// settlement id can embed it.
pub async fn insert_pending_settlement(pool: &PgPool, new: &NewSettlement) -> Result<SettlementRecord> {
    let mut tx = pool.begin().await?;

    let id: i64 = sqlx::query_scalar("SELECT nextval('energy_settlements_id_seq')")
        .fetch_one(&mut *tx)
        .await?;
    let sid = settlement_id(id, new.created_at_backend);

    let sql = format!(
        r#"
        INSERT INTO energy_settlements (
            id, settlement_id, meter_id, owner_id, period_start_time, period_end_time,
            raw_export_wh, raw_import_wh, net_wh_from_grid, etk_amount_credited,
            status, settlement_trigger, created_at_backend
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING {SETTLEMENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, SettlementRow>(&sql)
        .bind(id)
        .bind(&sid)
        .bind(&new.meter_id)
        .bind(&new.owner_id)
        .bind(new.period_start_time)
        .bind(new.period_end_time)
        .bind(new.raw_export_wh)
        .bind(new.raw_import_wh)
        .bind(new.net_wh_from_grid)
        .bind(new.etk_amount_credited)
        .bind(SettlementStatus::Pending.as_str())
        .bind(new.settlement_trigger.as_str())
        .bind(new.created_at_backend)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("inserting settlement {sid}"))?;

    tx.commit().await?;
    row.try_into()
}

/// Record the ledger transaction hash on a record that is still pending.
///
/// Returns `None` when no pending record with that id exists.
pub async fn attach_tx_hash(
    pool: &PgPool,
    settlement_id: &str,
    tx_hash: &str,
) -> Result<Option<SettlementRecord>> {
    let sql = format!(
        r#"
        UPDATE energy_settlements
        SET blockchain_tx_hash = $2
        WHERE settlement_id = $1
          AND status = 'PENDING'
        RETURNING {SETTLEMENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, SettlementRow>(&sql)
        .bind(settlement_id)
        .bind(tx_hash)
        .fetch_optional(pool)
        .await?;

    row.map(SettlementRecord::try_from).transpose()
}

/// Apply a terminal transition. Only pending rows are touched, so a terminal
/// record can never be rewritten; `None` means nothing matched.
pub async fn finalize_settlement(
    pool: &PgPool,
    settlement_id: &str,
    fin: &SettlementFinalization,
) -> Result<Option<SettlementRecord>> {
    let sql = format!(
        r#"
        UPDATE energy_settlements
        SET status                = $2,
            blockchain_tx_hash    = COALESCE($3, blockchain_tx_hash),
            etk_amount_credited   = COALESCE($4, etk_amount_credited),
            failure_reason        = $5,
            confirmed_at_on_chain = $6
        WHERE settlement_id = $1
          AND status = 'PENDING'
        RETURNING {SETTLEMENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, SettlementRow>(&sql)
        .bind(settlement_id)
        .bind(fin.status.as_str())
        .bind(&fin.blockchain_tx_hash)
        .bind(fin.etk_amount_credited)
        .bind(&fin.failure_reason)
        .bind(fin.confirmed_at_on_chain)
        .fetch_optional(pool)
        .await?;

    row.map(SettlementRecord::try_from).transpose()
}

pub async fn fetch_settlement(pool: &PgPool, settlement_id: &str) -> Result<Option<SettlementRecord>> {
    let sql = format!("SELECT {SETTLEMENT_COLUMNS} FROM energy_settlements WHERE settlement_id = $1");
    let row = sqlx::query_as::<_, SettlementRow>(&sql)
        .bind(settlement_id)
        .fetch_optional(pool)
        .await?;

    row.map(SettlementRecord::try_from).transpose()
}

/// Newest-first history, optionally filtered by meter and/or owner.
pub async fn settlement_history(
    pool: &PgPool,
    meter_id: Option<&str>,
    owner_id: Option<&str>,
    limit: i64,
) -> Result<Vec<SettlementRecord>> {
    let sql = format!(
        r#"
        SELECT {SETTLEMENT_COLUMNS}
        FROM energy_settlements
        WHERE ($1::text IS NULL OR meter_id = $1)
          AND ($2::text IS NULL OR owner_id = $2)
        ORDER BY created_at_backend DESC, id DESC
        LIMIT $3
        "#
    );
    let rows = sqlx::query_as::<_, SettlementRow>(&sql)
        .bind(meter_id)
        .bind(owner_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    into_records(rows)
}

/// Most recent record for a meter that did not fail.
pub async fn latest_open_or_settled(pool: &PgPool, meter_id: &str) -> Result<Option<SettlementRecord>> {
    let sql = format!(
        r#"
        SELECT {SETTLEMENT_COLUMNS}
        FROM energy_settlements
        WHERE meter_id = $1
          AND status <> 'FAILED'
        ORDER BY created_at_backend DESC, id DESC
        LIMIT 1
        "#
    );
    let row = sqlx::query_as::<_, SettlementRow>(&sql)
        .bind(meter_id)
        .fetch_optional(pool)
        .await?;

    row.map(SettlementRecord::try_from).transpose()
}

/// Pending records created before `before`, oldest first.
pub async fn stale_pending_settlements(
    pool: &PgPool,
    before: OffsetDateTime,
) -> Result<Vec<SettlementRecord>> {
    let sql = format!(
        r#"
        SELECT {SETTLEMENT_COLUMNS}
        FROM energy_settlements
        WHERE status = 'PENDING'
          AND created_at_backend < $1
        ORDER BY created_at_backend
        "#
    );
    let rows = sqlx::query_as::<_, SettlementRow>(&sql)
        .bind(before)
        .fetch_all(pool)
        .await?;

    into_records(rows)
}
