//! Results reporting and formatting.

use crate::runner::RunReport;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};

/// Formats run reports for output.
pub struct ResultsReport;

impl ResultsReport {
    /// Format a report as a console table.
    pub fn format_table(report: &RunReport) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![format!("Load Test Results: {}", report.name)]);

        table.add_row(vec![
            "Verdict:",
            if report.verdict.overall {
                "PASS"
            } else {
                "FAIL"
            },
        ]);
        table.add_row(vec!["Duration:", &format!("{:.1}s", report.duration_secs)]);
        table.add_row(vec!["Iterations:", &format!("{}", report.iterations)]);
        table.add_row(vec![
            "Total Requests:",
            &format!("{}", report.total_requests),
        ]);
        table.add_row(vec![
            "Failed Requests:",
            &format!("{}", report.failed_requests),
        ]);
        table.add_row(vec![
            "Requests/sec:",
            &format!("{:.1}", report.requests_per_second),
        ]);
        table.add_row(vec![
            "Error Rate:",
            &format!("{:.2}%", report.error_rate * 100.0),
        ]);

        table.add_row(vec!["", ""]);
        table.add_row(vec!["Latency (ms)", "p50 / p90 / p95 / p99 / max"]);
        table.add_row(vec![
            "",
            &format!(
                "{:.1} / {:.1} / {:.1} / {:.1} / {:.1}",
                report.latency_p50,
                report.latency_p90,
                report.latency_p95,
                report.latency_p99,
                report.latency_max
            ),
        ]);

        table.add_row(vec!["", ""]);
        for outcome in &report.verdict.thresholds {
            let mark = if outcome.passed { "✓" } else { "✗" };
            let observed = match outcome.observed {
                Some(v) => format!("{:.4}", v),
                None => "no samples".to_string(),
            };
            table.add_row(vec![
                &format!("{} {}", mark, outcome.metric),
                &format!("{} (observed {})", outcome.rule, observed),
            ]);
        }

        table.to_string()
    }

    /// Format a report as JSON.
    pub fn format_json(report: &RunReport) -> serde_json::Result<String> {
        serde_json::to_string_pretty(report)
    }

    /// Format a report as a CSV row.
    pub fn format_csv(report: &RunReport) -> String {
        format!(
            "{},{},{:.1},{},{},{:.1},{:.4},{:.1},{:.1},{:.1},{}",
            report.timestamp,
            report.name,
            report.duration_secs,
            report.iterations,
            report.total_requests,
            report.requests_per_second,
            report.error_rate,
            report.latency_p50,
            report.latency_p90,
            report.latency_p99,
            if report.verdict.overall { "pass" } else { "fail" }
        )
    }

    /// CSV header row.
    pub fn csv_header() -> &'static str {
        "timestamp,name,duration,iterations,requests,rps,error_rate,p50,p90,p99,verdict"
    }
}
