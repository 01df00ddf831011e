use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::MeterOwner;

pub async fn touch_last_seen(pool: &PgPool, meter_id: &str, at: OffsetDateTime) -> Result<u64> {
    let res = sqlx::query("UPDATE meters SET last_seen_at = $2 WHERE meter_id = $1")
        .bind(meter_id)
        .bind(at)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Owner of a meter together with the owner's primary wallet address.
pub async fn meter_owner(pool: &PgPool, meter_id: &str) -> Result<Option<MeterOwner>> {
    let owner = sqlx::query_as::<_, MeterOwner>(
        r#"
        SELECT
            m.meter_id,
            m.owner_id::text AS owner_id,
            w.address        AS owner_address,
            m.ledger_address AS meter_address
        FROM meters m
        LEFT JOIN wallets w
          ON w.user_id = m.owner_id
         AND w.is_primary
        WHERE m.meter_id = $1
          AND m.owner_id IS NOT NULL
        LIMIT 1
        "#,
    )
    .bind(meter_id)
    .fetch_optional(pool)
    .await?;

    Ok(owner)
}
