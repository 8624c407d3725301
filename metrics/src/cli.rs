//! CLI command implementations.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::report::{load_reports, render_text, summarize};

/// Aggregate the most recent `window` reports under `dir`.
pub fn report(dir: &Path, window: usize, json: bool) -> Result<()> {
    let (reports, warnings) = load_reports(dir, window)?;
    info!(dir = %dir.display(), reports = reports.len(), "aggregating reports");
    let summary = summarize(&reports);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", render_text(&summary));
    }
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}
