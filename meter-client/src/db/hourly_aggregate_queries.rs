use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{Channel, ChannelStats, HourlyAggregate};

#[derive(Debug, Clone, sqlx::FromRow)]
struct HourlyAggregateRow {
    meter_id: String,
    hour_start: OffsetDateTime,
    sample_count: i64,
    channels: Json<BTreeMap<Channel, ChannelStats>>,
}

impl From<HourlyAggregateRow> for HourlyAggregate {
    fn from(r: HourlyAggregateRow) -> Self {
        HourlyAggregate {
            meter_id: r.meter_id,
            hour_start: r.hour_start,
            sample_count: r.sample_count,
            channels: r.channels.0,
        }
    }
}

/// Insert or replace hourly rows keyed by `(meter_id, hour_start)`.
///
/// Re-running the same window rewrites the same rows, so the periodic driver
/// can overlap with itself safely.
pub async fn upsert_hourly_aggregates(pool: &PgPool, rows: &[HourlyAggregate]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO hourly_aggregates (meter_id, hour_start, sample_count, channels) ",
    );
    builder.push_values(rows, |mut b, a| {
        b.push_bind(&a.meter_id)
            .push_bind(a.hour_start)
            .push_bind(a.sample_count)
            .push_bind(Json(&a.channels));
    });
    builder.push(
        " ON CONFLICT (meter_id, hour_start) DO UPDATE SET \
         sample_count = EXCLUDED.sample_count, channels = EXCLUDED.channels",
    );

    let res = builder.build().execute(pool).await?;
    Ok(res.rows_affected())
}

/// Hourly rows for one meter from `since` onwards, oldest first.
pub async fn hourly_history(
    pool: &PgPool,
    meter_id: &str,
    since: OffsetDateTime,
) -> Result<Vec<HourlyAggregate>> {
    let rows = sqlx::query_as::<_, HourlyAggregateRow>(
        r#"
        SELECT meter_id, hour_start, sample_count, channels
        FROM hourly_aggregates
        WHERE meter_id = $1
          AND hour_start >= $2
        ORDER BY hour_start
        "#,
    )
    .bind(meter_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Oldest rows with `hour_start < before`, capped at `limit`.
pub async fn aggregates_before(
    pool: &PgPool,
    before: OffsetDateTime,
    limit: i64,
) -> Result<Vec<HourlyAggregate>> {
    let rows = sqlx::query_as::<_, HourlyAggregateRow>(
        r#"
        SELECT meter_id, hour_start, sample_count, channels
        FROM hourly_aggregates
        WHERE hour_start < $1
        ORDER BY hour_start, meter_id
        LIMIT $2
        "#,
    )
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn count_aggregates_before(pool: &PgPool, before: OffsetDateTime) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hourly_aggregates WHERE hour_start < $1")
        .bind(before)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Delete exactly the given `(meter_id, hour_start)` keys.
pub async fn delete_aggregates(pool: &PgPool, keys: &[(String, OffsetDateTime)]) -> Result<u64> {
    if keys.is_empty() {
        return Ok(0);
    }

    let (meter_ids, hours): (Vec<String>, Vec<OffsetDateTime>) = keys.iter().cloned().unzip();
    let res = sqlx::query(
        r#"
        DELETE FROM hourly_aggregates
        WHERE (meter_id, hour_start) IN (
            SELECT * FROM UNNEST($1::text[], $2::timestamptz[])
        )
        "#,
    )
    .bind(meter_ids)
    .bind(hours)
    .execute(pool)
    .await?;

    Ok(res.rows_affected())
}
