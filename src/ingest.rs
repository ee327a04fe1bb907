use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::models::{ClusterRecord, PointRecord, Session, TimePoint};

const OFFSET_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M:%S%#z",
    "%Y-%m-%dT%H:%M%#z",
];

const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub skipped: usize,
}

/// Parses an ISO-8601 instant. Timestamps without an offset are taken as UTC,
/// a bare date as midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let with_offset = DateTime::parse_from_rfc3339(raw).ok().or_else(|| {
        OFFSET_FORMATS
            .iter()
            .find_map(|format| DateTime::parse_from_str(raw, format).ok())
    });
    if let Some(parsed) = with_offset {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Keeps the points whose timestamp parses; the rest are logged and skipped.
pub fn to_time_points(records: &[PointRecord]) -> (Vec<TimePoint>, IngestSummary) {
    let mut points = Vec::with_capacity(records.len());
    let mut summary = IngestSummary::default();

    for record in records {
        match parse_timestamp(&record.created_at) {
            Some(created_at) => {
                points.push(TimePoint {
                    created_at,
                    cluster_id: record.cluster_id,
                });
                summary.accepted += 1;
            }
            None => {
                warn!(
                    point = %record.id,
                    created_at = %record.created_at,
                    "skipping point with unparsable timestamp"
                );
                summary.skipped += 1;
            }
        }
    }

    (points, summary)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PointsPayload {
    Bare(Vec<PointRecord>),
    Wrapped { points: Vec<PointRecord> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClustersPayload {
    Bare(Vec<ClusterRecord>),
    Wrapped { clusters: Vec<ClusterRecord> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SessionPayload {
    Wrapped { session: Session },
    Bare(Session),
}

pub fn parse_points_json(body: &str) -> anyhow::Result<Vec<PointRecord>> {
    let payload: PointsPayload =
        serde_json::from_str(body).context("points payload is not a point array")?;
    Ok(match payload {
        PointsPayload::Bare(points) | PointsPayload::Wrapped { points } => points,
    })
}

pub fn parse_clusters_json(body: &str) -> anyhow::Result<Vec<ClusterRecord>> {
    let payload: ClustersPayload =
        serde_json::from_str(body).context("clusters payload is not a cluster array")?;
    Ok(match payload {
        ClustersPayload::Bare(clusters) | ClustersPayload::Wrapped { clusters } => clusters,
    })
}

pub fn parse_session_json(body: &str) -> anyhow::Result<Session> {
    let payload: SessionPayload =
        serde_json::from_str(body).context("session payload is not a session resource")?;
    Ok(match payload {
        SessionPayload::Wrapped { session } | SessionPayload::Bare(session) => session,
    })
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

pub fn load_points_json(path: &Path) -> anyhow::Result<Vec<PointRecord>> {
    parse_points_json(&read(path)?).with_context(|| format!("in {}", path.display()))
}

pub fn load_clusters_json(path: &Path) -> anyhow::Result<Vec<ClusterRecord>> {
    parse_clusters_json(&read(path)?).with_context(|| format!("in {}", path.display()))
}

pub fn load_session_json(path: &Path) -> anyhow::Result<Session> {
    parse_session_json(&read(path)?).with_context(|| format!("in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;

    fn record(id: &str, created_at: &str) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            cluster_id: 0,
            created_at: created_at.to_string(),
            platform: None,
            author: None,
            content: None,
            likes: None,
        }
    }

    #[test]
    fn parses_offsets_and_naive_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01T00:15:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T01:15:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T00:15:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01 00:15:00.000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T00:15Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T01:15+0100"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T00:15:00+0000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T00:15:00.000+0000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T00:15"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-01-01"),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("2024-01-01T25:00Z"), None);
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn skips_unparsable_points() {
        let records = vec![
            record("a", "2024-01-01T00:15:00Z"),
            record("b", "2024-13-45T99:00:00Z"),
            record("c", "2024-01-01T00:45:00.250Z"),
        ];

        let (points, summary) = to_time_points(&records);

        assert_eq!(points.len(), 2);
        assert_eq!(
            summary,
            IngestSummary {
                accepted: 2,
                skipped: 1
            }
        );
    }

    #[test]
    fn accepts_bare_and_wrapped_payloads() {
        let bare = r#"[{"id":"1","cluster_id":-1,"created_at":"2024-01-01T00:00:00Z"}]"#;
        let wrapped = r#"{"points":[{"id":"1","cluster_id":2,"created_at":"2024-01-01T00:00:00Z","likes":12}]}"#;
        assert_eq!(parse_points_json(bare).unwrap()[0].cluster_id, -1);
        assert_eq!(parse_points_json(wrapped).unwrap()[0].likes, Some(12));

        let clusters = r#"{"clusters":[{"cluster_id":0,"label":"Transit strike","point_count":40,"keywords":["metro","strike"],"sentiment":-0.4}]}"#;
        let parsed = parse_clusters_json(clusters).unwrap();
        assert_eq!(parsed[0].label, "Transit strike");
        assert_eq!(parsed[0].coherence, None);
    }

    #[test]
    fn parses_session_resource() {
        let body = r#"{"session":{"id":"3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2","zone":"paris","status":"clustering","progress":62.5,"config":{"start_date":"2024-01-01T00:00:00Z","end_date":"2024-01-02T00:00:00Z"}}}"#;
        let session = parse_session_json(body).unwrap();
        assert_eq!(session.status, SessionStatus::Clustering);
        assert_eq!(session.zone, "paris");
    }

    #[test]
    fn rejects_non_array_points() {
        assert!(parse_points_json(r#"{"items":[]}"#).is_err());
    }
}
