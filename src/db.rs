use anyhow::Context;
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ingest;
use crate::models::{ClusterRecord, Session, SessionConfig, SessionStatus, TimePoint};

const SEED_SESSION: &str = "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<Uuid> {
    let session_id = Uuid::parse_str(SEED_SESSION)?;
    let window_start = Utc
        .with_ymd_and_hms(2024, 1, 1, 6, 0, 0)
        .single()
        .context("invalid seed window")?;
    let window_end = window_start + Duration::hours(30);

    sqlx::query(
        r#"
        INSERT INTO opinion_map.sessions (id, zone, status, progress, window_start, window_end)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status, progress = EXCLUDED.progress,
            window_start = EXCLUDED.window_start, window_end = EXCLUDED.window_end
        "#,
    )
    .bind(session_id)
    .bind("paris-transit")
    .bind(SessionStatus::Completed.as_str())
    .bind(100.0_f32)
    .bind(window_start)
    .bind(window_end)
    .execute(pool)
    .await?;

    let clusters = vec![
        (-1_i64, "Unclustered", vec![], None),
        (0, "Metro strike delays", vec!["metro", "strike", "delay"], Some(-0.62_f32)),
        (1, "Bike lane expansion", vec!["velo", "lanes", "rivoli"], Some(0.41)),
        (2, "Night bus service", vec!["noctilien", "night", "bus"], Some(0.05)),
    ];

    for (cluster_id, label, keywords, sentiment) in clusters {
        let keywords: Vec<String> = keywords.into_iter().map(str::to_string).collect();
        sqlx::query(
            r#"
            INSERT INTO opinion_map.clusters
            (session_id, cluster_id, label, keywords, sentiment)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id, cluster_id) DO UPDATE
            SET label = EXCLUDED.label, keywords = EXCLUDED.keywords,
                sentiment = EXCLUDED.sentiment
            "#,
        )
        .bind(session_id)
        .bind(cluster_id)
        .bind(label)
        .bind(&keywords)
        .bind(sentiment)
        .execute(pool)
        .await?;
    }

    // The strike dominates the morning, bike lanes the afternoon.
    for i in 0..60_i64 {
        let created_at = window_start + Duration::minutes(i * 29 + (i % 7) * 3);
        let cluster_id = match (i % 10, created_at.hour() < 12) {
            (0, _) => -1,
            (9, _) => 2,
            (_, true) => 0,
            (n, false) if n % 3 == 0 => 0,
            _ => 1,
        };
        let platform = if i % 4 == 0 { "tiktok" } else { "twitter" };

        sqlx::query(
            r#"
            INSERT INTO opinion_map.points
            (id, session_id, point_key, cluster_id, created_at, platform, author, likes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (session_id, point_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(format!("seed-{i:03}"))
        .bind(cluster_id)
        .bind(created_at)
        .bind(platform)
        .bind(format!("@commuter{}", i % 13))
        .bind(i * 7 % 120)
        .execute(pool)
        .await?;
    }

    refresh_point_counts(pool, session_id).await?;
    Ok(session_id)
}

async fn refresh_point_counts(pool: &PgPool, session_id: Uuid) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE opinion_map.clusters c
        SET point_count = (
            SELECT COUNT(*) FROM opinion_map.points p
            WHERE p.session_id = c.session_id AND p.cluster_id = c.cluster_id
        )
        WHERE c.session_id = $1
        "#,
    )
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_session(pool: &PgPool, session_id: Uuid) -> anyhow::Result<Session> {
    let row = sqlx::query(
        "SELECT id, zone, status, progress, window_start, window_end \
         FROM opinion_map.sessions WHERE id = $1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("session {session_id} not found"))?;

    let status: String = row.get("status");
    let window_start: DateTime<Utc> = row.get("window_start");
    let window_end: DateTime<Utc> = row.get("window_end");

    Ok(Session {
        id: row.get("id"),
        zone: row.get("zone"),
        status: SessionStatus::parse(&status)
            .with_context(|| format!("unknown session status {status:?}"))?,
        progress: row.get("progress"),
        config: SessionConfig {
            start_date: window_start.to_rfc3339(),
            end_date: window_end.to_rfc3339(),
        },
    })
}

pub async fn fetch_clusters(pool: &PgPool, session_id: Uuid) -> anyhow::Result<Vec<ClusterRecord>> {
    let rows = sqlx::query(
        "SELECT cluster_id, label, point_count, keywords, sentiment, coherence \
         FROM opinion_map.clusters WHERE session_id = $1 ORDER BY cluster_id",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ClusterRecord {
            cluster_id: row.get("cluster_id"),
            label: row.get("label"),
            point_count: row.get("point_count"),
            keywords: row.get("keywords"),
            sentiment: row.get("sentiment"),
            coherence: row.get("coherence"),
        })
        .collect())
}

/// Only the fields the evolution chart reads.
pub async fn fetch_time_points(pool: &PgPool, session_id: Uuid) -> anyhow::Result<Vec<TimePoint>> {
    let rows = sqlx::query(
        "SELECT cluster_id, created_at FROM opinion_map.points \
         WHERE session_id = $1 ORDER BY created_at",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| TimePoint {
            created_at: row.get("created_at"),
            cluster_id: row.get("cluster_id"),
        })
        .collect())
}

pub async fn import_csv(
    pool: &PgPool,
    session_id: Uuid,
    points_path: &std::path::Path,
    clusters_path: Option<&std::path::Path>,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct PointRow {
        point_key: String,
        cluster_id: i64,
        created_at: String,
        platform: Option<String>,
        author: Option<String>,
        content: Option<String>,
        likes: Option<i64>,
    }

    #[derive(serde::Deserialize)]
    struct ClusterRow {
        cluster_id: i64,
        label: String,
        keywords: Option<String>,
        sentiment: Option<f32>,
        coherence: Option<f32>,
    }

    if let Some(path) = clusters_path {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        for result in reader.deserialize::<ClusterRow>() {
            let row = result?;
            let keywords: Vec<String> = row
                .keywords
                .unwrap_or_default()
                .split(';')
                .map(str::trim)
                .filter(|keyword| !keyword.is_empty())
                .map(str::to_string)
                .collect();

            sqlx::query(
                r#"
                INSERT INTO opinion_map.clusters
                (session_id, cluster_id, label, keywords, sentiment, coherence)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (session_id, cluster_id) DO UPDATE
                SET label = EXCLUDED.label, keywords = EXCLUDED.keywords,
                    sentiment = EXCLUDED.sentiment, coherence = EXCLUDED.coherence
                "#,
            )
            .bind(session_id)
            .bind(row.cluster_id)
            .bind(&row.label)
            .bind(&keywords)
            .bind(row.sentiment)
            .bind(row.coherence)
            .execute(pool)
            .await?;
        }
    }

    let mut reader = csv::Reader::from_path(points_path)
        .with_context(|| format!("failed to open {}", points_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<PointRow>() {
        let row = result?;
        let Some(created_at) = ingest::parse_timestamp(&row.created_at) else {
            warn!(
                point = %row.point_key,
                created_at = %row.created_at,
                "skipping point with unparsable timestamp"
            );
            continue;
        };

        let result = sqlx::query(
            r#"
            INSERT INTO opinion_map.points
            (id, session_id, point_key, cluster_id, created_at, platform, author, content, likes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (session_id, point_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(&row.point_key)
        .bind(row.cluster_id)
        .bind(created_at)
        .bind(&row.platform)
        .bind(&row.author)
        .bind(&row.content)
        .bind(row.likes)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    refresh_point_counts(pool, session_id).await?;
    info!(%session_id, inserted, "imported points");
    Ok(inserted)
}
