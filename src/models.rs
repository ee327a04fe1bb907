use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Cluster id the pipeline assigns to points it could not cluster.
pub const OUTLIER_CLUSTER: i64 = -1;

/// The two fields of a point the bucketing needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePoint {
    pub created_at: DateTime<Utc>,
    pub cluster_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: i64,
    pub label: String,
}

/// A point as returned by the points endpoint or stored in `opinion_map.points`.
#[derive(Debug, Clone, Deserialize)]
pub struct PointRecord {
    pub id: String,
    pub cluster_id: i64,
    pub created_at: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub likes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterRecord {
    pub cluster_id: i64,
    pub label: String,
    #[serde(default)]
    pub point_count: i64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sentiment: Option<f32>,
    #[serde(default)]
    pub coherence: Option<f32>,
}

impl ClusterRecord {
    pub fn to_cluster(&self) -> Cluster {
        Cluster {
            id: self.cluster_id,
            label: self.label.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Vectorizing,
    Reducing,
    Clustering,
    Labeling,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Vectorizing => "vectorizing",
            SessionStatus::Reducing => "reducing",
            SessionStatus::Clustering => "clustering",
            SessionStatus::Labeling => "labeling",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "vectorizing" => Some(SessionStatus::Vectorizing),
            "reducing" => Some(SessionStatus::Reducing),
            "clustering" => Some(SessionStatus::Clustering),
            "labeling" => Some(SessionStatus::Labeling),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Echo of the configuration an analysis run was started with.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(default)]
    pub zone: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub progress: f32,
    pub config: SessionConfig,
}

/// One row of the stacked evolution chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub starts_at: NaiveDateTime,
    pub date: String,
    pub counts: BTreeMap<i64, u64>,
}

impl Bucket {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn count(&self, cluster_id: i64) -> Option<u64> {
        self.counts.get(&cluster_id).copied()
    }
}

pub fn cluster_column(cluster_id: i64) -> String {
    format!("cluster_{cluster_id}")
}

impl Serialize for Bucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.counts.len() + 1))?;
        map.serialize_entry("date", &self.date)?;
        for (cluster_id, count) in &self.counts {
            map.serialize_entry(&cluster_column(*cluster_id), count)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn bucket_serializes_flat_cluster_columns() {
        let bucket = Bucket {
            starts_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            date: "00:00".to_string(),
            counts: BTreeMap::from([(OUTLIER_CLUSTER, 2), (0, 1), (1, 0)]),
        };

        let value = serde_json::to_value(&bucket).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "date": "00:00",
                "cluster_-1": 2,
                "cluster_0": 1,
                "cluster_1": 0
            })
        );
        assert_eq!(bucket.total(), 3);
    }

    #[test]
    fn session_status_uses_lowercase_names() {
        let status: SessionStatus = serde_json::from_str("\"labeling\"").unwrap();
        assert_eq!(status, SessionStatus::Labeling);
        assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Reducing.is_terminal());
    }

    #[test]
    fn point_record_ignores_extra_fields() {
        let record: PointRecord = serde_json::from_str(
            r#"{"id":"t-1","cluster_id":3,"created_at":"2024-01-01T00:15:00Z","x":0.4,"retweets":9}"#,
        )
        .unwrap();
        assert_eq!(record.cluster_id, 3);
        assert!(record.likes.is_none());
    }
}
