//! Text summary builder for CLI output.
//!
//! Formats a terminal simulation status into human-readable lines.

use crate::model::{Lane, LaneResult, OverallStatus, SimulationStatus};

const TOP_PRODUCTS: usize = 5;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a final status snapshot.
pub(crate) fn build_text_summary(status: &SimulationStatus) -> TextSummary {
    let mut lines = Vec::new();
    lines.push(format!("Simulation: {}", status.id));
    lines.push(format!("Status: {}", status.overall_status));

    let show_results = matches!(
        status.overall_status,
        OverallStatus::Completed | OverallStatus::InvisibleSolution
    );
    if show_results {
        if let Some(combined) = status.result.as_ref() {
            for lane in Lane::ALL {
                if let Some(result) = combined.lane(lane) {
                    lane_lines(lane, result, &mut lines);
                }
            }
        }
    }

    if let Some(message) = status.error_message.as_deref() {
        lines.push("Errors:".to_string());
        lines.extend(message.lines().map(|l| format!("  {l}")));
    }

    TextSummary { lines }
}

fn lane_lines(lane: Lane, result: &LaneResult, lines: &mut Vec<String>) {
    let total_cost: f64 = result.products.iter().map(|p| p.total_cost).sum();
    let units: i64 = result.products.iter().map(|p| p.quantity).sum();
    lines.push(format!(
        "{lane}: profit {:.2}, cost {:.2}, {} products, {} units",
        result.total_profit, total_cost, result.product_count, units
    ));

    let mut ranked: Vec<_> = result.products.iter().collect();
    ranked.sort_by(|a, b| b.total_profit.total_cmp(&a.total_profit));
    for p in ranked.into_iter().take(TOP_PRODUCTS) {
        lines.push(format!(
            "  {:<24} qty {:>5}  price {:>9.2}  profit {:>10.2}",
            p.name, p.quantity, p.price, p.total_profit
        ));
    }
}
