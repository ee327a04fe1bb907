use std::fmt::Write;

use crate::evolution::EvolutionSeries;
use crate::models::{cluster_column, Bucket, Cluster, Session, OUTLIER_CLUSTER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTotal {
    pub cluster_id: i64,
    pub label: String,
    pub count: u64,
    /// Label of the busiest bucket; the earliest one wins a tie.
    pub peak: Option<String>,
}

pub fn cluster_totals(series: &EvolutionSeries, clusters: &[Cluster]) -> Vec<ClusterTotal> {
    let mut totals: Vec<ClusterTotal> = clusters
        .iter()
        .map(|cluster| {
            let mut count = 0u64;
            let mut peak: Option<&Bucket> = None;
            for bucket in &series.buckets {
                let value = bucket.count(cluster.id).unwrap_or(0);
                count += value;
                let busier = peak.map_or(value > 0, |best| {
                    value > best.count(cluster.id).unwrap_or(0)
                });
                if busier {
                    peak = Some(bucket);
                }
            }
            ClusterTotal {
                cluster_id: cluster.id,
                label: cluster.label.clone(),
                count,
                peak: peak.map(|bucket| bucket.date.clone()),
            }
        })
        .collect();

    totals.sort_by(|a, b| b.count.cmp(&a.count).then(a.cluster_id.cmp(&b.cluster_id)));
    totals
}

pub fn render_json(series: &EvolutionSeries) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&series.buckets)?)
}

pub fn render_csv(series: &EvolutionSeries, clusters: &[Cluster]) -> anyhow::Result<String> {
    let mut ids: Vec<i64> = clusters.iter().map(|cluster| cluster.id).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["date".to_string()];
    header.extend(ids.iter().map(|id| cluster_column(*id)));
    writer.write_record(&header)?;

    for bucket in &series.buckets {
        let mut record = vec![bucket.date.clone()];
        record.extend(
            ids.iter()
                .map(|id| bucket.count(*id).unwrap_or(0).to_string()),
        );
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("failed to flush csv output: {}", err.error()))?;
    Ok(String::from_utf8(bytes)?)
}

pub fn build_report(session: &Session, clusters: &[Cluster], series: &EvolutionSeries) -> String {
    let totals = cluster_totals(series, clusters);
    let mut output = String::new();

    let _ = writeln!(output, "# Opinion Evolution Report");
    let _ = writeln!(
        output,
        "Zone {} (session {}, {})",
        if session.zone.is_empty() { "unnamed" } else { session.zone.as_str() },
        session.id,
        session.status.as_str()
    );
    let _ = writeln!(
        output,
        "Window {} to {}, bucketed by {}",
        session.config.start_date,
        session.config.end_date,
        series.granularity.as_str()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Cluster Volume");

    if series.assigned == 0 {
        let _ = writeln!(output, "No points recorded for this window.");
    } else {
        for total in totals.iter() {
            let _ = writeln!(
                output,
                "- {} ({}): {} points{}",
                total.label,
                if total.cluster_id == OUTLIER_CLUSTER {
                    "outliers".to_string()
                } else {
                    format!("cluster {}", total.cluster_id)
                },
                total.count,
                total
                    .peak
                    .as_deref()
                    .map(|peak| format!(", peak at {peak}"))
                    .unwrap_or_default()
            );
        }
    }

    if series.out_of_range > 0 || series.unknown_cluster > 0 {
        let _ = writeln!(
            output,
            "\n{} points fell outside the window, {} belonged to unknown clusters.",
            series.out_of_range, series.unknown_cluster
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Timeline");

    let mut ids: Vec<i64> = clusters.iter().map(|cluster| cluster.id).collect();
    ids.sort_unstable();
    ids.dedup();
    let columns: Vec<String> = ids.iter().map(|id| cluster_column(*id)).collect();
    let _ = writeln!(output, "| date | {} |", columns.join(" | "));
    let _ = writeln!(output, "|---|{}", "---|".repeat(columns.len()));
    for bucket in &series.buckets {
        let cells: Vec<String> = ids
            .iter()
            .map(|id| bucket.count(*id).unwrap_or(0).to_string())
            .collect();
        let _ = writeln!(
            output,
            "| {} | {} |",
            bucket.starts_at.format("%Y-%m-%d %H:%M"),
            cells.join(" | ")
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::{build_evolution, AnalysisWindow};
    use crate::models::{SessionConfig, SessionStatus, TimePoint};
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn fixture() -> (Session, Vec<Cluster>, EvolutionSeries) {
        let session = Session {
            id: Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2").unwrap(),
            zone: "marseille".to_string(),
            status: SessionStatus::Completed,
            progress: 100.0,
            config: SessionConfig {
                start_date: "2024-01-01T00:00:00Z".to_string(),
                end_date: "2024-01-01T02:30:00Z".to_string(),
            },
        };
        let clusters = vec![
            Cluster {
                id: 1,
                label: "Port expansion".to_string(),
            },
            Cluster {
                id: 0,
                label: "Beach closures".to_string(),
            },
        ];
        let points = vec![
            TimePoint {
                created_at: at("2024-01-01T00:15:00Z"),
                cluster_id: 0,
            },
            TimePoint {
                created_at: at("2024-01-01T00:45:00Z"),
                cluster_id: 1,
            },
            TimePoint {
                created_at: at("2024-01-01T01:10:00Z"),
                cluster_id: 0,
            },
        ];
        let window = AnalysisWindow::from_config(&session.config).unwrap();
        let series = build_evolution(&window, &clusters, &points, &Utc);
        (session, clusters, series)
    }

    #[test]
    fn totals_are_sorted_by_volume() {
        let (_, clusters, series) = fixture();
        let totals = cluster_totals(&series, &clusters);

        assert_eq!(totals[0].cluster_id, 0);
        assert_eq!(totals[0].count, 2);
        assert_eq!(totals[0].peak.as_deref(), Some("00:00"));
        assert_eq!(totals[1].cluster_id, 1);
        assert_eq!(totals[1].count, 1);
    }

    #[test]
    fn csv_has_one_column_per_cluster() {
        let (_, clusters, series) = fixture();
        let csv = render_csv(&series, &clusters).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(
            lines,
            vec!["date,cluster_0,cluster_1", "00:00,1,1", "01:00,1,0", "02:00,0,0"]
        );
    }

    #[test]
    fn json_is_an_array_of_flat_buckets() {
        let (_, _, series) = fixture();
        let value: serde_json::Value = serde_json::from_str(&render_json(&series).unwrap()).unwrap();

        assert_eq!(value.as_array().map(Vec::len), Some(3));
        assert_eq!(value[1]["date"], "01:00");
        assert_eq!(value[1]["cluster_0"], 1);
        assert_eq!(value[1]["cluster_1"], 0);
    }

    #[test]
    fn report_lists_clusters_and_timeline() {
        let (session, clusters, series) = fixture();
        let report = build_report(&session, &clusters, &series);

        assert!(report.contains("Zone marseille"));
        assert!(report.contains("bucketed by hour"));
        assert!(report.contains("- Beach closures (cluster 0): 2 points, peak at 00:00"));
        assert!(report.contains("| 2024-01-01 01:00 | 1 | 0 |"));
        assert!(!report.contains("outside the window"));
    }

    #[test]
    fn empty_series_says_so() {
        let (session, clusters, _) = fixture();
        let window = AnalysisWindow::from_config(&session.config).unwrap();
        let series = build_evolution(&window, &clusters, &[], &Utc);
        let report = build_report(&session, &clusters, &series);

        assert!(report.contains("No points recorded for this window."));
        assert_eq!(cluster_totals(&series, &clusters)[0].peak, None);
    }
}
