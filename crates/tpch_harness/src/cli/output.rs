//! Output formatting for CLI commands

use crate::loader::TableLoad;
use crate::workload::{ItemStatus, RunResult};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};

/// Format a byte count in human-readable form
///
/// Examples:
/// - 500 -> "500 B"
/// - 1536000 -> "1.5 MB"
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);
    table
}

/// Print a table with headers and rows
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut table = new_table(headers);
    for row in rows {
        table.add_row(row);
    }
    println!("{}", table);
}

/// Per-item table for a benchmark result.
pub fn benchmark_table(result: &RunResult) -> Table {
    let mut table = new_table(&["Query", "Time (s)", "Rows", "Warmup", "Status"]);
    for item in &result.items {
        let (time, rows, status) = match &item.status {
            ItemStatus::Succeeded => (
                format!("{:.2}", item.elapsed_secs),
                item.rows.to_string(),
                Cell::new("OK").fg(Color::Green),
            ),
            ItemStatus::Failed { error } => (
                "N/A".to_string(),
                "N/A".to_string(),
                Cell::new(format!("FAILED: {}", error)).fg(Color::Red),
            ),
        };
        table.add_row(vec![
            Cell::new(&item.id),
            Cell::new(time),
            Cell::new(rows),
            Cell::new(item.warmup_passes),
            status,
        ]);
    }
    table
}

/// Per-round table for a warmup result.
pub fn warmup_table(result: &RunResult) -> Option<Table> {
    let summary = result.warmup.as_ref()?;
    let mut table = new_table(&["Round", "Items", "Failed", "Memory (GB)"]);
    for round in &summary.rounds {
        let failed = round.items.iter().filter(|i| !i.status.is_success()).count();
        let memory = round
            .memory_gb
            .map(|gb| format!("{:.2}", gb))
            .unwrap_or_else(|| "unknown".to_string());
        table.add_row(vec![
            round.round.to_string(),
            round.items.len().to_string(),
            failed.to_string(),
            memory,
        ]);
    }
    Some(table)
}

/// Print the result tables and a one-line total.
pub fn print_run_summary(result: &RunResult) {
    if let Some(table) = warmup_table(result) {
        println!("{}", table);
        if let Some(summary) = &result.warmup {
            println!(
                "Warmup stopped: {:?} (target {} GB)",
                summary.stop_reason, summary.target_memory_gb
            );
        }
        return;
    }

    println!("{}", benchmark_table(result));
    let failed = result.failed_items();
    println!(
        "Total: {} item(s), {} succeeded, {} failed, {:.2}s measured",
        result.items.len(),
        result.items.len() - failed,
        failed,
        result.total_secs()
    );
    for hook in &result.hook_errors {
        println!("After hook failed: {}", hook);
    }
}

/// Print rows and time per loaded table.
pub fn print_loads(loads: &[TableLoad]) {
    let rows = loads
        .iter()
        .map(|l| {
            vec![
                l.table.clone(),
                l.rows.to_string(),
                format!("{:.1}", l.elapsed.as_secs_f64()),
            ]
        })
        .collect();
    print_table(&["Table", "Rows", "Time (s)"], rows);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{ItemResult, WorkloadMode};
    use chrono::Utc;
    use std::path::PathBuf;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1073741824), "1.0 GB");
    }

    #[test]
    fn test_benchmark_table_lists_items() {
        let result = RunResult {
            run_id: "r".into(),
            mode: WorkloadMode::Benchmark,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            items: vec![
                ItemResult {
                    id: "1".into(),
                    status: ItemStatus::Succeeded,
                    elapsed_secs: 1.25,
                    rows: 4,
                    warmup_passes: 0,
                },
                ItemResult {
                    id: "6".into(),
                    status: ItemStatus::Failed {
                        error: "relation missing".into(),
                    },
                    elapsed_secs: 0.0,
                    rows: 0,
                    warmup_passes: 0,
                },
            ],
            warmup: None,
            hook_errors: Vec::new(),
            success: false,
            output_path: PathBuf::from("/r.json"),
        };
        let rendered = benchmark_table(&result).to_string();
        assert!(rendered.contains("1.25"));
        assert!(rendered.contains("relation missing"));
        assert!(warmup_table(&result).is_none());
    }
}
