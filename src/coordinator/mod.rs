//! Input classification.
//!
//! The coordinator decides what the user is asking for and pulls explicit
//! targets out of the input. It never analyses anything itself.

use crate::error::WorkflowError;
use crate::models::{Intent, NormalizedContext, ScannerRecord, Severity, Target, TargetKind};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

/// Raw input as handed to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Text(String),
    /// Parsed scanner report JSON, not yet validated.
    ScannerReport(Value),
}

impl RawInput {
    /// Treat input that parses as a JSON array or object as a scanner report,
    /// anything else as free text.
    pub fn detect(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return RawInput::ScannerReport(value);
            }
        }
        RawInput::Text(input.to_string())
    }
}

struct Patterns {
    cve: Regex,
    url: Regex,
    ipv4: Regex,
    domain: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        cve: Regex::new(r"(?i)\bCVE-\d{4}-\d{4,}\b").expect("valid regex"),
        url: Regex::new(r"(?i)\b(?:https?://|git@)[^\s,;]+").expect("valid regex"),
        ipv4: Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")
            .expect("valid regex"),
        domain: Regex::new(r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,24}\b")
            .expect("valid regex"),
    })
}

/// Classify raw input into a [`NormalizedContext`].
pub fn classify(raw: &RawInput) -> Result<NormalizedContext, WorkflowError> {
    let context = match raw {
        RawInput::Text(text) => classify_text(text)?,
        RawInput::ScannerReport(value) => classify_report(value)?,
    };
    debug!(intent = %context.intent, targets = context.targets.len(), "Input classified");
    Ok(context)
}

fn classify_text(text: &str) -> Result<NormalizedContext, WorkflowError> {
    if text.trim().is_empty() {
        return Err(WorkflowError::input("input is empty"));
    }

    let p = patterns();
    let mut targets: Vec<Target> = Vec::new();
    let mut push = |kind: TargetKind, value: String| {
        if !targets.iter().any(|t| t.kind == kind && t.value == value) {
            targets.push(Target::new(kind, value));
        }
    };

    for m in p.cve.find_iter(text) {
        push(TargetKind::Cve, m.as_str().to_uppercase());
    }

    // Repository URLs first, then blank them out so their host names are
    // not picked up again as bare domains.
    let mut remainder = text.to_string();
    for m in p.url.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ')', '"', '\'']);
        push(TargetKind::Repository, url.to_string());
        remainder = remainder.replace(m.as_str(), " ");
    }

    for m in p.ipv4.find_iter(&remainder) {
        push(TargetKind::Ip, m.as_str().to_string());
    }

    for m in p.domain.find_iter(&remainder) {
        let candidate = m.as_str();
        // dotted quads and CVE ids also match the domain shape
        if p.ipv4.is_match(candidate) || candidate.chars().all(|c| c.is_ascii_digit() || c == '.') {
            continue;
        }
        push(TargetKind::Domain, candidate.to_lowercase());
    }

    let has_assets = targets.iter().any(|t| t.kind != TargetKind::Cve);
    let has_cves = targets.iter().any(|t| t.kind == TargetKind::Cve);
    let intent = match (has_assets, has_cves) {
        (true, _) => Intent::AssetCheck,
        (false, true) => Intent::CveCheck,
        (false, false) => Intent::BroadScan,
    };

    Ok(NormalizedContext {
        intent,
        targets,
        records: Vec::new(),
    })
}

/// Validate a structured scanner report.
///
/// Accepts a bare array of records or an object carrying the array under
/// `findings`, `records` or `vulnerabilities`. Every record needs an `id`,
/// a `severity` and a `target`.
fn classify_report(value: &Value) -> Result<NormalizedContext, WorkflowError> {
    let records = match value {
        Value::Array(items) => items,
        Value::Object(map) => ["findings", "records", "vulnerabilities"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .ok_or_else(|| {
                WorkflowError::input(
                    "scanner report object has no `findings`, `records` or `vulnerabilities` array",
                )
            })?,
        _ => return Err(WorkflowError::input("scanner report must be a JSON array or object")),
    };

    if records.is_empty() {
        return Err(WorkflowError::input("scanner report contains no records"));
    }

    let mut parsed = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        parsed.push(parse_record(index, record)?);
    }

    let mut targets: Vec<Target> = Vec::new();
    for record in &parsed {
        let mut candidates = vec![Target::new(target_kind(&record.target), record.target.clone())];
        if patterns().cve.is_match(&record.id) {
            candidates.push(Target::new(TargetKind::Cve, record.id.to_uppercase()));
        }
        for target in candidates {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    Ok(NormalizedContext {
        intent: Intent::ScannerReport,
        targets,
        records: parsed,
    })
}

fn parse_record(index: usize, record: &Value) -> Result<ScannerRecord, WorkflowError> {
    let obj = record
        .as_object()
        .ok_or_else(|| WorkflowError::input(format!("record {} is not an object", index)))?;

    let required = |field: &str| -> Result<String, WorkflowError> {
        match obj.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(_) => Err(WorkflowError::input(format!(
                "record {}: field `{}` must be a non-empty string",
                index, field
            ))),
            None => Err(WorkflowError::input(format!(
                "record {} is missing required field `{}`",
                index, field
            ))),
        }
    };

    let id = required("id")?;
    let severity_label = required("severity")?;
    let target = required("target")?;

    let severity = match severity_label.parse::<f64>() {
        Ok(score) => Severity::from_cvss(score),
        Err(_) => Severity::from_label(&severity_label).ok_or_else(|| {
            WorkflowError::input(format!(
                "record {}: unknown severity `{}`",
                index, severity_label
            ))
        })?,
    };

    let optional = |field: &str| obj.get(field).and_then(Value::as_str).map(String::from);

    Ok(ScannerRecord {
        id,
        severity,
        target,
        title: optional("title"),
        description: optional("description"),
    })
}

fn target_kind(value: &str) -> TargetKind {
    let p = patterns();
    if p.url.is_match(value) {
        TargetKind::Repository
    } else if p.ipv4.is_match(value) {
        TargetKind::Ip
    } else if p.cve.is_match(value) {
        TargetKind::Cve
    } else {
        TargetKind::Domain
    }
}
