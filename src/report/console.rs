use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{PublishError, Publisher, write_stdout};
use crate::scanner::ScanResult;

const REPOSITORY_WIDTH: usize = 35;
const WORKFLOW_WIDTH: usize = 35;
const SCHEDULE_WIDTH: usize = 13;
const COMMITTER_WIDTH: usize = 15;
const KST_OFFSET_HOURS: u32 = 9;

/// Prints the scan result as a table to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePublisher;

#[async_trait]
impl Publisher for ConsolePublisher {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        info!("publishing scan results to console…");
        write_stdout(format_report(result).as_bytes()).await
    }
}

fn table_row(
    no: &str,
    repository: &str,
    workflow: &str,
    utc: &str,
    kst: &str,
    committer: &str,
    status: &str,
) -> String {
    format!(
        "{no:<3} {repository:<REPOSITORY_WIDTH$} {workflow:<WORKFLOW_WIDTH$} {utc:<SCHEDULE_WIDTH$} {kst:<SCHEDULE_WIDTH$} {committer:<COMMITTER_WIDTH$} {status}\n"
    )
}

/// Renders the console table of a scan result, one line per cron expression.
pub fn format_report(result: &ScanResult) -> String {
    let mut report = format!(
        "schedule-scanner {} (generated {})\n\n",
        env!("CARGO_PKG_VERSION"),
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );

    report.push_str("Scheduled Workflows Summary:\n");
    report.push_str(&table_row(
        "NO",
        "REPOSITORY",
        "WORKFLOW",
        "UTC SCHEDULE",
        "KST SCHEDULE",
        "LAST COMMITTER",
        "LAST STATUS",
    ));

    for (i, workflow) in result.workflows.iter().enumerate() {
        let no = (i + 1).to_string();
        let repository = truncate(&workflow.repo_name, REPOSITORY_WIDTH);
        let name = truncate(&workflow.workflow_name, WORKFLOW_WIDTH);
        let committer = truncate(&workflow.last_committer, COMMITTER_WIDTH);

        for schedule in &workflow.cron_schedules {
            report.push_str(&table_row(
                &no,
                &repository,
                &name,
                schedule,
                &to_kst(schedule),
                &committer,
                &workflow.last_status,
            ));
        }
    }

    report.push_str(&format!(
        "\nTotal Repositories: {} | Excluded Repositories: {} | Scheduled Workflows Found: {}\n",
        result.total_repos,
        result.excluded_repos_count,
        result.workflows.len()
    ));
    if !result.failures.is_empty() {
        report.push_str(&format!(
            "Failed Repositories: {} ({} failures)\n",
            result.failed_repos_count(),
            result.failures.len()
        ));
    }
    report.push_str(&format!(
        "Scan Duration: {:.3}s\n",
        result.scan_duration.as_secs_f64()
    ));

    report
}

/// Shortens `s` to at most `width` characters, ending it with `..` if anything was cut.
pub fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_owned();
    }

    let mut truncated: String = s.chars().take(width.saturating_sub(2)).collect();
    truncated.push_str("..");
    truncated
}

/// Shifts a UTC cron expression to KST (UTC+9).
///
/// Only expressions with five fields and a plain numeric hour are shifted. The day of week
/// advances if it is a plain number and the shift crosses midnight. Anything else is returned
/// unchanged.
pub fn to_kst(utc_cron: &str) -> String {
    let fields: Vec<&str> = utc_cron.split_whitespace().collect();
    let [minute, hour, day_of_month, month, day_of_week] = fields[..] else {
        return utc_cron.to_owned();
    };

    let valid_minute = minute == "*" || minute.parse::<u32>().is_ok_and(|m| m <= 59);
    let Some(hour) = hour.parse::<u32>().ok().filter(|&h| h <= 23) else {
        return utc_cron.to_owned();
    };
    if !valid_minute {
        return utc_cron.to_owned();
    }

    let shifted = hour + KST_OFFSET_HOURS;
    let day_of_week = match day_of_week.parse::<u32>() {
        Ok(dow) if dow > 6 => return utc_cron.to_owned(),
        Ok(dow) if shifted >= 24 => ((dow + 1) % 7).to_string(),
        _ => day_of_week.to_owned(),
    };

    format!(
        "{minute} {} {day_of_month} {month} {day_of_week}",
        shifted % 24
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::report::sample_result;

    #[test]
    fn shifts_cron_expressions_to_kst() {
        assert_eq!(to_kst("0 0 * * *"), "0 9 * * *");
        assert_eq!(to_kst("0 20 * * 1"), "0 5 * * 2");
        assert_eq!(to_kst("15 22 * * 6"), "15 7 * * 0");
        assert_eq!(to_kst("0 14 1 * *"), "0 23 1 * *");
    }

    #[test]
    fn leaves_complex_expressions_alone() {
        assert_eq!(to_kst("invalid"), "invalid");
        assert_eq!(to_kst("*/15 */2 * * *"), "*/15 */2 * * *");
        assert_eq!(to_kst("0 1-3 * * *"), "0 1-3 * * *");
        assert_eq!(to_kst("0 25 * * *"), "0 25 * * *");
        assert_eq!(to_kst("0 20 * * MON"), "0 5 * * MON");
    }

    #[test]
    fn truncates_long_names() {
        assert_eq!(truncate("test", 10), "test");
        assert_eq!(truncate("very-long-repository-name", 10), "very-lon..");
        assert_eq!(truncate("배포-스케줄-워크플로", 6), "배포-스..");
    }

    #[test]
    fn formats_one_line_per_schedule() {
        let report = format_report(&sample_result());

        assert!(report.contains("NO  REPOSITORY"));
        assert!(report.contains("a-repository-with-a-remarkably-lo.."));
        assert!(report.contains("0 20 * * 1    0 5 * * 2"));
        assert!(report.contains("30 3 * * *    30 12 * * *"));
        assert_eq!(report.matches("alice").count(), 2);
        assert!(report.contains(
            "Total Repositories: 12 | Excluded Repositories: 2 | Scheduled Workflows Found: 2"
        ));
        assert!(report.contains("Failed Repositories: 1 (1 failures)"));
        assert!(report.ends_with("Scan Duration: 1.500s\n"));
    }

    #[test]
    fn aligns_columns_of_every_row() {
        let report = format_report(&sample_result());
        let rows: Vec<&str> = report
            .lines()
            .skip_while(|line| !line.starts_with("NO "))
            .take_while(|line| !line.is_empty())
            .collect();

        assert_eq!(rows.len(), 4);
        let status_column = rows[0].find("LAST STATUS").unwrap();
        assert!(rows[1..].iter().all(|row| row.len() > status_column));
        assert_eq!(&rows[3][..3], "2  ");
    }
}
