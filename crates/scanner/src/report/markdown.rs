//! Markdown rendering behind a pluggable generator.

use super::Report;

pub trait Generator: Send + Sync {
    fn generate(&self, report: &Report) -> String;
}

pub struct MarkdownRenderer;

fn severity_emoji(severity: &str) -> &'static str {
    match severity {
        "Critical" => "🔴",
        "High" => "🟠",
        "Medium" => "🟡",
        "Low" => "🟢",
        _ => "⚪",
    }
}

impl Generator for MarkdownRenderer {
    fn generate(&self, report: &Report) -> String {
        let mut md = String::from("# Smart Contract Scan Report\n\n");
        md.push_str(&format!("- Mode: {}\n", report.mode));
        md.push_str(&format!("- Strategy: {}\n", report.strategy));
        md.push_str(&format!("- Provider: {}\n", report.provider));
        md.push_str(&format!(
            "- Scan time: {}\n",
            report.scan_time.format("%Y-%m-%d %H:%M:%S")
        ));
        md.push_str(&format!(
            "- Contracts scanned: {}\n",
            report.total_contracts()
        ));
        md.push_str(&format!(
            "- Vulnerable contracts: {}\n\n",
            report.vulnerable_contracts()
        ));

        let histogram = report.severity_histogram();
        if !histogram.is_empty() {
            md.push_str("## Severity Distribution\n\n");
            for severity in ["Critical", "High", "Medium", "Low", "None", "Unknown"] {
                if let Some(count) = histogram.get(severity) {
                    md.push_str(&format!(
                        "- {} {}: {}\n",
                        severity_emoji(severity),
                        severity,
                        count
                    ));
                }
            }
            md.push('\n');
        }

        for record in &report.results {
            md.push_str(&format!("# {}\n\n", record.display_address()));

            let vulns = &record.analysis.vulnerabilities;
            if vulns.is_empty() {
                md.push_str("Status: ✅ No vulnerabilities found\n\n");
            } else {
                md.push_str(&format!(
                    "Status: ⚠️ discovered {} vulnerabilities\n\n",
                    vulns.len()
                ));
            }

            if !record.analysis.summary.is_empty() {
                md.push_str(&format!("**Summary:** {}\n\n", record.analysis.summary));
            }
            if let Some(score) = &record.analysis.risk_score {
                md.push_str(&format!("**Risk score:** {score}\n\n"));
            }
            if !record.analysis.vuln_probability.is_empty() {
                md.push_str(&format!(
                    "**Vulnerability probability:** {}\n\n",
                    record.analysis.vuln_probability
                ));
            }

            for (i, vuln) in vulns.iter().enumerate() {
                md.push_str(&format!(
                    "### {}. {} [{}] {}\n\n",
                    i + 1,
                    severity_emoji(&vuln.severity),
                    vuln.severity,
                    vuln.vuln_type
                ));
                md.push_str(&format!("{}\n\n", vuln.description));
                if !vuln.location.is_empty() {
                    md.push_str(&format!("- Location: {}\n", vuln.location));
                }
                if !vuln.line_numbers.is_empty() {
                    let lines: Vec<String> =
                        vuln.line_numbers.iter().map(u64::to_string).collect();
                    md.push_str(&format!("- Lines: {}\n", lines.join(", ")));
                }
                if !vuln.code_snippet.is_empty() {
                    md.push_str(&format!("\n```solidity\n{}\n```\n", vuln.code_snippet));
                }
                if !vuln.references.is_empty() {
                    md.push_str("- References:\n");
                    for reference in &vuln.references {
                        md.push_str(&format!("  - {reference}\n"));
                    }
                }
                md.push('\n');
            }
        }

        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AnalysisReport, Vulnerability};
    use crate::report::ScanRecord;
    use chrono::Local;

    #[test]
    fn test_render_contains_address_h1_and_histogram() {
        let report = Report {
            mode: "mode1".to_string(),
            strategy: "generic_scan".to_string(),
            provider: "openai".to_string(),
            scan_time: Local::now(),
            results: vec![ScanRecord {
                address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
                resolved_address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
                is_proxy: false,
                timestamp: Local::now(),
                mode: "mode1".to_string(),
                strategy: "generic_scan".to_string(),
                analysis: AnalysisReport {
                    summary: "one issue".to_string(),
                    vulnerabilities: vec![Vulnerability {
                        vuln_type: "reentrancy".to_string(),
                        severity: "High".to_string(),
                        description: "call before state write".to_string(),
                        line_numbers: vec![10, 12],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            }],
        };

        let md = MarkdownRenderer.generate(&report);
        assert!(md.contains("# 0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
        assert!(md.contains("- 🟠 High: 1"));
        assert!(md.contains("Lines: 10, 12"));
        assert!(md.contains("discovered 1 vulnerabilities"));
    }

    #[test]
    fn test_render_clean_contract() {
        let report = Report {
            mode: "mode2".to_string(),
            strategy: "default".to_string(),
            provider: "gemini".to_string(),
            scan_time: Local::now(),
            results: vec![ScanRecord {
                address: "0xabc".to_string(),
                resolved_address: "0xabc".to_string(),
                is_proxy: false,
                timestamp: Local::now(),
                mode: "mode2".to_string(),
                strategy: "default".to_string(),
                analysis: AnalysisReport::default(),
            }],
        };
        let md = MarkdownRenderer.generate(&report);
        assert!(md.contains("No vulnerabilities found"));
        assert!(!md.contains("## Severity Distribution"));
    }
}
