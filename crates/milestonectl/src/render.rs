//! Output rendering for milestonectl.

use milestone_core::{MetricStatus, ResourceStatus};

use crate::client::CheckResponse;

/// Print the outcome of an adapter check.
pub fn print_check(resource_id: &str, metric: &str, response: &CheckResponse) {
    let data = &response.data;
    println!("Check: {} / {}", resource_id, metric);
    println!("  Job:       {}", response.job_run_id);
    println!("  Value:     {}", format_count(data.value));
    if let Some(views) = data.views {
        println!("  Views:     {}", format_count(views));
    }
    if let Some(likes) = data.likes {
        println!("  Likes:     {}", format_count(likes));
    }
    match data.milestone {
        Some(milestone) if data.should_trigger => {
            println!("  Milestone: {} (triggered)", format_count(milestone));
        }
        _ => println!("  Milestone: none"),
    }
    if data.source_regressed {
        println!("  Note:      source reported less than the stored count");
    }
}

/// Print stored state and next triggers for a resource.
pub fn print_status(status: &ResourceStatus) {
    println!("Resource: {}", status.resource_id);
    println!("  Version: {}", status.version);
    match &status.updated_at {
        Some(ts) => println!("  Updated: {}", ts.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Updated: never"),
    }

    if status.metrics.is_empty() {
        println!();
        println!("No metrics configured.");
        return;
    }

    println!();
    println!(
        "  {:<12}  {:<10}  {:<14}  {:>14}  {:>14}  {:>14}",
        "METRIC", "RULE", "PHASE", "LAST", "MILESTONE", "NEXT"
    );
    println!("  {}", "-".repeat(88));
    for metric in &status.metrics {
        print_metric_row(metric);
    }
}

fn print_metric_row(metric: &MetricStatus) {
    println!(
        "  {:<12}  {:<10}  {:<14}  {:>14}  {:>14}  {:>14}",
        metric.metric,
        metric.rule.as_str(),
        metric.phase.as_str(),
        metric
            .last_counter_value
            .map(format_count)
            .unwrap_or_else(|| "-".to_string()),
        metric
            .last_triggered_milestone
            .map(format_count)
            .unwrap_or_else(|| "-".to_string()),
        format_count(metric.next_trigger),
    );
}

/// Group digits in threes: `1234567` -> `1,234,567`.
fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
