//! Tolerant extraction of structured results from model output.
//!
//! Models reply with bare JSON, fenced JSON, a bare vulnerability array,
//! or prose. The cascade tries each shape in turn and falls back to
//! keyword scanning so a run never dies on a chatty model.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(rename = "type", default)]
    pub vuln_type: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub line_numbers: Vec<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code_snippet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub impact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remediation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub swc_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contract_address: String,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vuln_probability: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(skip)]
    pub raw_response: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parse_error: String,
    #[serde(skip)]
    pub duration: Duration,
}

impl AnalysisReport {
    pub fn high_severity_count(&self) -> usize {
        self.vulnerabilities
            .iter()
            .filter(|v| v.severity == "Critical" || v.severity == "High")
            .count()
    }
}

/// Verification-mode reply: is one detector finding a true positive?
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerificationResult {
    #[serde(default)]
    pub is_vulnerability: bool,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub vuln_type: String,
}

/// Which reply schema the parser expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Full analysis report.
    Analysis,
    /// Per-finding verification verdict.
    Verification,
}

pub struct ResponseParser {
    kind: ResponseKind,
    fence: Regex,
}

impl ResponseParser {
    pub fn new(kind: ResponseKind) -> Self {
        Self {
            kind,
            fence: Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```")
                .expect("static fence regex"),
        }
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn parse(&self, response: &str) -> Result<AnalysisReport> {
        if self.kind == ResponseKind::Verification {
            let verdict = self.parse_verification(response)?;
            let mut vulnerabilities = Vec::new();
            if verdict.is_vulnerability {
                vulnerabilities.push(Vulnerability {
                    vuln_type: verdict.vuln_type.clone(),
                    severity: verdict.severity.clone(),
                    description: verdict.reason.clone(),
                    ..Default::default()
                });
            }
            return Ok(AnalysisReport {
                vulnerabilities,
                summary: verdict.reason,
                raw_response: response.to_string(),
                ..Default::default()
            });
        }

        for candidate in self.json_candidates(response) {
            if let Ok(mut report) = serde_json::from_str::<AnalysisReport>(&candidate) {
                normalize_report(&mut report);
                return Ok(report);
            }
            if let Ok(vulns) = serde_json::from_str::<Vec<Vulnerability>>(&candidate) {
                let mut report = AnalysisReport {
                    vulnerabilities: vulns,
                    ..Default::default()
                };
                normalize_report(&mut report);
                return Ok(report);
            }
        }

        self.parse_text_fallback(response)
    }

    pub fn parse_verification(&self, response: &str) -> Result<VerificationResult> {
        for candidate in self.json_candidates(response) {
            if let Ok(mut verdict) = serde_json::from_str::<VerificationResult>(&candidate) {
                normalize_verification(&mut verdict);
                return Ok(verdict);
            }
        }
        Err(ScanError::ParseFailed(
            "failed to parse JSON verification result".to_string(),
        ))
    }

    /// Candidate JSON payloads in decreasing order of trust: the raw text,
    /// the fenced block, the fence-stripped text and the first balanced
    /// object.
    fn json_candidates(&self, response: &str) -> Vec<String> {
        let mut candidates = vec![response.to_string()];

        if let Some(caps) = self.fence.captures(response) {
            candidates.push(caps[1].trim().to_string());
        }
        let stripped = response
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        candidates.push(stripped.to_string());

        if let Some(object) = extract_first_json_object(stripped) {
            candidates.push(object.to_string());
        }
        if let Some(object) = extract_first_json_object(response) {
            candidates.push(object.to_string());
        }
        candidates.dedup();
        candidates
    }

    fn parse_text_fallback(&self, response: &str) -> Result<AnalysisReport> {
        let mut report = AnalysisReport {
            raw_response: response.to_string(),
            parse_error: "failed to parse JSON; used text fallback".to_string(),
            ..Default::default()
        };

        let severity = [
            ("Severity: Critical", "严重", "Critical"),
            ("Severity: High", "漏洞等级：高", "High"),
            ("Severity: Medium", "漏洞等级：中", "Medium"),
        ]
        .iter()
        .find(|(en, zh, _)| response.contains(en) || response.contains(zh))
        .map(|(_, _, level)| *level);

        if let Some(level) = severity {
            report.vulnerabilities.push(Vulnerability {
                vuln_type: "Unknown (Text Parsed)".to_string(),
                severity: level.to_string(),
                description: "Parsed from text response".to_string(),
                ..Default::default()
            });
        }

        normalize_report(&mut report);
        Ok(report)
    }
}

/// String- and escape-aware scan for the first balanced `{…}`.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Maps free-form severity strings onto the canonical closed set,
/// accepting English, single-letter and Chinese aliases. Idempotent on
/// its own output.
pub fn normalize_severity(severity: &str) -> String {
    let trimmed = severity.trim();
    if trimmed.is_empty() {
        return "Unknown".to_string();
    }
    match trimmed.to_lowercase().as_str() {
        "none" | "null" | "nil" | "safe" | "secure" | "healthy" | "安全" => "None",
        "low" | "l" | "低" => "Low",
        "medium" | "med" | "m" | "中" => "Medium",
        "high" | "h" | "高" => "High",
        "critical" | "crit" | "c" | "严重" => "Critical",
        "unknown" => "Unknown",
        _ => "Unknown",
    }
    .to_string()
}

fn normalize_report(report: &mut AnalysisReport) {
    if report.summary.trim().is_empty() {
        report.summary = "No summary provided".to_string();
    }
    report.severity = normalize_severity(&report.severity);
    for vuln in &mut report.vulnerabilities {
        if vuln.vuln_type.trim().is_empty() {
            vuln.vuln_type = "Unknown".to_string();
        }
        vuln.severity = normalize_severity(&vuln.severity);
        if vuln.description.trim().is_empty() {
            vuln.description = "No description provided".to_string();
        }
    }
}

fn normalize_verification(verdict: &mut VerificationResult) {
    if verdict.reason.trim().is_empty() {
        verdict.reason = "No reason provided".to_string();
    }
    if verdict.vuln_type.trim().is_empty() {
        verdict.vuln_type = "Unknown".to_string();
    }
    verdict.severity = normalize_severity(&verdict.severity);
    if !verdict.is_vulnerability {
        verdict.severity = "None".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ResponseParser {
        ResponseParser::new(ResponseKind::Analysis)
    }

    #[test]
    fn test_direct_json_parse() {
        let report = parser()
            .parse(r#"{"vulnerabilities":[{"type":"reentrancy","severity":"high","description":"d"}],"summary":"bad"}"#)
            .unwrap();
        assert_eq!(report.vulnerabilities.len(), 1);
        assert_eq!(report.vulnerabilities[0].severity, "High");
        assert_eq!(report.summary, "bad");
        assert!(report.parse_error.is_empty());
    }

    #[test]
    fn test_bare_array_parse() {
        let report = parser()
            .parse(r#"[{"type":"overflow","severity":"M","description":"d"}]"#)
            .unwrap();
        assert_eq!(report.vulnerabilities.len(), 1);
        assert_eq!(report.vulnerabilities[0].severity, "Medium");
        assert_eq!(report.summary, "No summary provided");
    }

    #[test]
    fn test_fenced_json_parse() {
        let response = "Here is my analysis:\n```json\n{\"vulnerabilities\":[],\"summary\":\"clean\"}\n```\nDone.";
        let report = parser().parse(response).unwrap();
        assert_eq!(report.summary, "clean");
        assert!(report.vulnerabilities.is_empty());
    }

    #[test]
    fn test_embedded_object_parse() {
        let response = "Sure! The result is {\"summary\":\"embedded\",\"vulnerabilities\":[]} as requested.";
        let report = parser().parse(response).unwrap();
        assert_eq!(report.summary, "embedded");
    }

    #[test]
    fn test_balanced_brace_scanner_is_string_aware() {
        let text = r#"prefix {"a":"va}lue","b":{"c":1}} suffix"#;
        let object = extract_first_json_object(text).unwrap();
        assert_eq!(object, r#"{"a":"va}lue","b":{"c":1}}"#);
        assert!(extract_first_json_object("no braces here").is_none());
        assert!(extract_first_json_object("}}} unbalanced").is_none());
    }

    #[test]
    fn test_text_fallback_synthesizes_placeholder() {
        let report = parser()
            .parse("The contract is dangerous. Severity: Critical. Fix it.")
            .unwrap();
        assert_eq!(report.vulnerabilities.len(), 1);
        assert_eq!(report.vulnerabilities[0].severity, "Critical");
        assert!(!report.parse_error.is_empty());

        let chinese = parser().parse("漏洞等级：高，请尽快修复").unwrap();
        assert_eq!(chinese.vulnerabilities[0].severity, "High");
    }

    #[test]
    fn test_text_fallback_without_keywords_is_clean_but_flagged() {
        let report = parser().parse("I could not find anything.").unwrap();
        assert!(report.vulnerabilities.is_empty());
        assert!(!report.parse_error.is_empty());
    }

    #[test]
    fn test_severity_normalizer_aliases_and_idempotence() {
        for (input, expected) in [
            ("critical", "Critical"),
            ("C", "Critical"),
            ("严重", "Critical"),
            ("h", "High"),
            ("med", "Medium"),
            ("低", "Low"),
            ("safe", "None"),
            ("", "Unknown"),
            ("whatever", "Unknown"),
        ] {
            let normalized = normalize_severity(input);
            assert_eq!(normalized, expected, "input {input:?}");
            // Idempotent on the output set.
            assert_eq!(normalize_severity(&normalized), normalized);
        }
    }

    #[test]
    fn test_verification_mode() {
        let parser = ResponseParser::new(ResponseKind::Verification);
        let report = parser
            .parse(r#"{"is_vulnerability":true,"severity":"high","reason":"real","vuln_type":"reentrancy-eth"}"#)
            .unwrap();
        assert_eq!(report.vulnerabilities.len(), 1);
        assert_eq!(report.vulnerabilities[0].vuln_type, "reentrancy-eth");
        assert_eq!(report.vulnerabilities[0].severity, "High");

        let negative = parser
            .parse(r#"{"is_vulnerability":false,"severity":"high","reason":"fp","vuln_type":"x"}"#)
            .unwrap();
        assert!(negative.vulnerabilities.is_empty());
    }

    #[test]
    fn test_verification_severity_forced_none_on_negative() {
        let parser = ResponseParser::new(ResponseKind::Verification);
        let verdict = parser
            .parse_verification(r#"{"is_vulnerability":false,"severity":"critical","reason":"no"}"#)
            .unwrap();
        assert_eq!(verdict.severity, "None");
    }

    #[test]
    fn test_verification_rejects_prose() {
        let parser = ResponseParser::new(ResponseKind::Verification);
        assert!(parser.parse_verification("it looks fine to me").is_err());
    }
}
