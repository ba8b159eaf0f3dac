//! Output formatting for CLI commands

use crate::core::discovery::DiscoveryReport;
use crate::core::transport::byte_debug_string;
use clap::ValueEnum;
use serde_json::json;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format for scripting
    Json,
    /// Hex bytes only
    Hex,
}

/// Format a reply body
pub fn format_body(data: &[u8], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => byte_debug_string(data),
        OutputFormat::Hex => hex::encode(data),
        OutputFormat::Json => json!({
            "length": data.len(),
            "hex": hex::encode(data),
            "bytes": data,
        })
        .to_string(),
    }
}

/// Format a discovery report
pub fn format_report(report: &DiscoveryReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let devices: Vec<_> = report
                .snapshot
                .iter()
                .map(|(pid, port)| json!({ "pid": pid.to_string(), "port": port }))
                .collect();
            let failures: Vec<_> = report
                .failures
                .iter()
                .map(|f| json!({ "port": f.port, "kind": f.kind.to_string(), "message": f.message }))
                .collect();
            let conflicts: Vec<_> = report
                .conflicts
                .iter()
                .map(|c| json!({ "pid": c.pid.to_string(), "kept": c.kept, "rejected": c.rejected }))
                .collect();
            let value = json!({
                "cycle": report.snapshot.cycle(),
                "ports": report.ports,
                "devices": devices,
                "failures": failures,
                "conflicts": conflicts,
                "elapsed_ms": u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            });
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
        }
        OutputFormat::Hex => report
            .snapshot
            .iter()
            .map(|(pid, port)| format!("{} {}", hex::encode(pid.as_bytes()), port))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Text => {
            let mut out = format!(
                "Found {} device(s) on {} port(s) in {} ms\n",
                report.snapshot.len(),
                report.ports.len(),
                report.elapsed.as_millis()
            );
            if !report.snapshot.is_empty() {
                out.push_str(&format!("{:<8} {}\n", "PID", "PORT"));
                out.push_str(&format!("{:-<40}\n", ""));
                for (pid, port) in report.snapshot.iter() {
                    out.push_str(&format!("{:<8} {}\n", pid.to_string(), port));
                }
            }
            for failure in &report.failures {
                out.push_str(&format!("  {}: {}\n", failure.port, failure.kind));
            }
            for conflict in &report.conflicts {
                out.push_str(&format!("  warning: {conflict}\n"));
            }
            out.trim_end().to_string()
        }
    }
}
