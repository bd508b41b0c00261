//! Streaming result pipeline: schema-profiled, filtered, paginated JSON
//! Lines over a parsed `scan_native.nessus` export.
//!
//! The export is walked in a single streaming pass. Matching findings
//! outside the requested page are counted but never buffered, so resident
//! memory is bounded by `page_size`, not by the total finding count.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use scanforge_core::error::{Result, ScanforgeError};
use scanforge_core::model::{SchemaProfile, Task, ValidationStats};
use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
struct Finding {
    host: String,
    plugin_id: String,
    severity: u8,
    plugin_name: String,
    port: String,
    cvss_score: Option<f64>,
    cve: Vec<String>,
    synopsis: String,
    description: String,
    solution: String,
    see_also: Vec<String>,
}

fn field_names_for_profile(profile: SchemaProfile) -> Vec<&'static str> {
    match profile {
        SchemaProfile::Minimal => vec!["host", "plugin_id", "severity"],
        SchemaProfile::Summary => vec!["host", "plugin_id", "severity", "plugin_name", "port"],
        SchemaProfile::Brief => vec!["host", "plugin_id", "severity", "plugin_name", "port", "cvss_score", "cve", "synopsis"],
        SchemaProfile::Full => vec![
            "host",
            "plugin_id",
            "severity",
            "plugin_name",
            "port",
            "cvss_score",
            "cve",
            "synopsis",
            "description",
            "solution",
            "see_also",
        ],
    }
}

fn finding_field(finding: &Finding, name: &str) -> Option<Value> {
    match name {
        "host" => Some(json!(finding.host)),
        "plugin_id" => Some(json!(finding.plugin_id)),
        "severity" => Some(json!(finding.severity)),
        "plugin_name" => Some(json!(finding.plugin_name)),
        "port" => Some(json!(finding.port)),
        "cvss_score" => finding.cvss_score.map(|v| json!(v)),
        "cve" => Some(json!(finding.cve)),
        "synopsis" => Some(json!(finding.synopsis)),
        "description" => Some(json!(finding.description)),
        "solution" => Some(json!(finding.solution)),
        "see_also" => Some(json!(finding.see_also)),
        _ => None,
    }
}

/// A single AND-combined filter clause.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Raw(String),
}

fn matches_filters(finding: &Finding, filters: &HashMap<String, FilterValue>) -> bool {
    filters.iter().all(|(field, value)| matches_one_filter(finding, field, value))
}

fn matches_one_filter(finding: &Finding, field: &str, value: &FilterValue) -> bool {
    let FilterValue::Raw(raw) = value;
    match field {
        "host" => substring_match(&finding.host, raw),
        "plugin_name" => substring_match(&finding.plugin_name, raw),
        "synopsis" => substring_match(&finding.synopsis, raw),
        "description" => substring_match(&finding.description, raw),
        "solution" => substring_match(&finding.solution, raw),
        "port" => substring_match(&finding.port, raw),
        "cve" => finding.cve.iter().any(|c| substring_match(c, raw)),
        "see_also" => finding.see_also.iter().any(|c| substring_match(c, raw)),
        "severity" => numeric_match(finding.severity as f64, raw),
        "plugin_id" => finding.plugin_id.parse::<f64>().map(|v| numeric_match(v, raw)).unwrap_or(false),
        "cvss_score" => finding.cvss_score.map(|v| numeric_match(v, raw)).unwrap_or(false),
        // Unknown field names never error: treat as "false".
        _ => false,
    }
}

fn substring_match(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn numeric_match(actual: f64, raw: &str) -> bool {
    let (op, rest) = if let Some(rest) = raw.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = raw.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = raw.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = raw.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = raw.strip_prefix('=') {
        ("=", rest)
    } else {
        ("=", raw)
    };
    let Ok(target) = rest.trim().parse::<f64>() else {
        return false;
    };
    match op {
        ">=" => actual >= target,
        "<=" => actual <= target,
        ">" => actual > target,
        "<" => actual < target,
        _ => (actual - target).abs() < f64::EPSILON,
    }
}

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().filter_map(|a| a.ok()).find(|a| a.key.as_ref() == name.as_bytes()).map(|a| String::from_utf8_lossy(&a.value).to_string())
}

/// Streams `ReportItem` records out of the export, counting every match for
/// an accurate total but only buffering the ones that fall within the
/// requested page (`page == 0` buffers everything instead).
fn collect_page(
    bytes: &[u8],
    page: u32,
    page_size: u32,
    filters: &HashMap<String, FilterValue>,
) -> Result<(Vec<Finding>, u64)> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut current_host = String::new();
    let mut matches_seen: u64 = 0;
    let mut collected = Vec::new();
    let mut in_item = false;
    let mut current: Finding = Finding::default();
    let mut current_tag: Vec<u8> = Vec::new();

    let want_all = page == 0;
    let skip = if want_all { 0 } else { (page.saturating_sub(1)) as u64 * page_size as u64 };
    let take = if want_all { u64::MAX } else { page_size as u64 };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"ReportHost" => {
                        current_host = attr(&e, "name").unwrap_or_default();
                    }
                    b"ReportItem" => {
                        in_item = true;
                        current = Finding { host: current_host.clone(), ..Default::default() };
                        current.plugin_id = attr(&e, "pluginID").unwrap_or_default();
                        current.severity = attr(&e, "severity").and_then(|v| v.parse().ok()).unwrap_or(0);
                        current.plugin_name = attr(&e, "pluginName").unwrap_or_default();
                        current.port = attr(&e, "port").unwrap_or_default();
                    }
                    other => {
                        current_tag = other.to_vec();
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"ReportItem" {
                    in_item = true;
                    current = Finding { host: current_host.clone(), ..Default::default() };
                    current.plugin_id = attr(&e, "pluginID").unwrap_or_default();
                    current.severity = attr(&e, "severity").and_then(|v| v.parse().ok()).unwrap_or(0);
                    current.plugin_name = attr(&e, "pluginName").unwrap_or_default();
                    current.port = attr(&e, "port").unwrap_or_default();
                    finish_item(&mut collected, &mut matches_seen, &current, filters, skip, take);
                    in_item = false;
                }
            }
            Ok(Event::Text(text)) if in_item => {
                let value = text.unescape().map(|s| s.to_string()).unwrap_or_default();
                match current_tag.as_slice() {
                    b"cvss_base_score" | b"cvss3_base_score" => {
                        if current.cvss_score.is_none() {
                            current.cvss_score = value.parse().ok();
                        }
                    }
                    b"cve" => current.cve.push(value),
                    b"synopsis" => current.synopsis = value,
                    b"description" => current.description = value,
                    b"solution" => current.solution = value,
                    b"see_also" => current.see_also.extend(value.lines().map(|s| s.to_string())),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"ReportItem" {
                    finish_item(&mut collected, &mut matches_seen, &current, filters, skip, take);
                    in_item = false;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ScanforgeError::Storage(format!("malformed export: {e}"))),
        }
        buf.clear();
    }

    Ok((collected, matches_seen))
}

/// Folds one completed `ReportItem` into the running match count, keeping
/// only the findings that fall within `[skip, skip + take)` so that only one
/// page's worth of findings is ever resident.
fn finish_item(collected: &mut Vec<Finding>, matches_seen: &mut u64, current: &Finding, filters: &HashMap<String, FilterValue>, skip: u64, take: u64) {
    if !matches_filters(current, filters) {
        return;
    }
    let idx = *matches_seen;
    *matches_seen += 1;
    if idx >= skip && idx < skip.saturating_add(take) {
        collected.push(current.clone());
    }
}

/// Emits the full JSON-Lines response (schema, metadata, findings, and an
/// optional pagination trailer) for one `get_results` call.
#[allow(clippy::too_many_arguments)]
pub fn get_results(
    task: &Task,
    export_bytes: &[u8],
    page: u32,
    page_size: u32,
    schema_profile: SchemaProfile,
    custom_fields: Option<&[String]>,
    filters: &HashMap<String, String>,
    validation_stats: Option<&ValidationStats>,
) -> Result<Vec<String>> {
    let page_size = page_size.clamp(10, 100);
    let filter_map: HashMap<String, FilterValue> = filters.iter().map(|(k, v)| (k.clone(), FilterValue::Raw(v.clone()))).collect();

    let fields: Vec<&str> = match custom_fields {
        Some(f) => {
            return get_results_with_field_names(task, export_bytes, page, page_size, schema_profile, f, &filter_map, validation_stats);
        }
        None => field_names_for_profile(schema_profile),
    };

    get_results_with_field_names(task, export_bytes, page, page_size, schema_profile, &fields.into_iter().map(String::from).collect::<Vec<_>>(), &filter_map, validation_stats)
}

fn get_results_with_field_names(
    task: &Task,
    export_bytes: &[u8],
    page: u32,
    page_size: u32,
    schema_profile: SchemaProfile,
    fields: &[String],
    filter_map: &HashMap<String, FilterValue>,
    validation_stats: Option<&ValidationStats>,
) -> Result<Vec<String>> {
    let (page_findings, total_matches) = collect_page(export_bytes, page, page_size, filter_map)?;

    let mut lines = Vec::new();

    let filters_applied: HashMap<&str, &str> = filter_map.iter().map(|(k, FilterValue::Raw(v))| (k.as_str(), v.as_str())).collect();
    lines.push(
        json!({
            "type": "schema",
            "profile": schema_profile,
            "fields": fields,
            "filters_applied": filters_applied,
            "total_vulnerabilities": total_matches,
        })
        .to_string(),
    );

    lines.push(
        json!({
            "type": "scan_metadata",
            "task_id": task.task_id,
            "name": task.payload.name,
            "started_at": task.started_at,
            "completed_at": task.completed_at,
            "targets": task.payload.targets,
            "summary": validation_stats,
        })
        .to_string(),
    );

    for finding in &page_findings {
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), json!("vulnerability"));
        for field in fields {
            if let Some(value) = finding_field(finding, field) {
                obj.insert(field.clone(), value);
            }
        }
        lines.push(Value::Object(obj).to_string());
    }

    if page != 0 {
        let total_pages = ((total_matches as f64) / (page_size as f64)).ceil().max(1.0) as u64;
        let next_page = if (page as u64) >= total_pages { None } else { Some(page as u64 + 1) };
        lines.push(
            json!({
                "type": "pagination",
                "page": page,
                "page_size": page_size,
                "total_pages": total_pages,
                "next_page": next_page,
            })
            .to_string(),
        );
    }

    Ok(lines)
}

/// Derives `results_summary` for `get_status` (spec §4.1) without running
/// the full projection pipeline.
pub fn compute_results_summary(validation_stats: &ValidationStats) -> Value {
    json!({
        "hosts_scanned": validation_stats.hosts_scanned,
        "total_vulnerabilities": validation_stats.total_vulnerabilities,
        "severity": validation_stats.severity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scanforge_core::model::{ScanPayload, ScanType, Task};

    const SAMPLE: &str = r#"
        <NessusClientData_v2>
          <Report>
            <ReportHost name="10.0.0.1">
              <ReportItem pluginID="1" severity="0" pluginName="info" port="0"></ReportItem>
              <ReportItem pluginID="2" severity="1" pluginName="low" port="80"></ReportItem>
              <ReportItem pluginID="3" severity="2" pluginName="medium" port="443">
                <cvss_base_score>5.0</cvss_base_score>
              </ReportItem>
              <ReportItem pluginID="4" severity="3" pluginName="high" port="22">
                <cve>CVE-2020-1111</cve>
                <synopsis>bad thing</synopsis>
              </ReportItem>
            </ReportHost>
          </Report>
        </NessusClientData_v2>
    "#;

    fn sample_task() -> Task {
        Task::new(
            "t1".to_string(),
            "trace".to_string(),
            ScanType::Untrusted,
            "nessus".to_string(),
            "nessus".to_string(),
            ScanPayload {
                targets: "10.0.0.1".to_string(),
                name: "n".to_string(),
                description: None,
                credentials: None,
                schema_profile: None,
                custom_fields: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn filter_by_severity_threshold_selects_expected_finding() {
        let task = sample_task();
        let mut filters = HashMap::new();
        filters.insert("severity".to_string(), ">=3".to_string());

        let lines = get_results(&task, SAMPLE.as_bytes(), 0, 40, SchemaProfile::Brief, None, &filters, None).unwrap();
        let vuln_lines: Vec<&String> = lines.iter().filter(|l| l.contains("\"type\":\"vulnerability\"")).collect();
        assert_eq!(vuln_lines.len(), 1);
        assert!(vuln_lines[0].contains("\"severity\":3"));
    }

    #[test]
    fn page_zero_has_no_pagination_trailer() {
        let task = sample_task();
        let lines = get_results(&task, SAMPLE.as_bytes(), 0, 40, SchemaProfile::Minimal, None, &HashMap::new(), None).unwrap();
        assert!(!lines.iter().any(|l| l.contains("\"type\":\"pagination\"")));
    }

    #[test]
    fn single_page_reports_null_next_page() {
        let task = sample_task();
        let lines = get_results(&task, SAMPLE.as_bytes(), 1, 40, SchemaProfile::Minimal, None, &HashMap::new(), None).unwrap();
        let trailer = lines.last().unwrap();
        assert!(trailer.contains("\"next_page\":null"));
    }

    #[test]
    fn custom_fields_override_profile_projection() {
        let task = sample_task();
        let custom = vec!["host".to_string(), "plugin_id".to_string()];
        let lines = get_results(&task, SAMPLE.as_bytes(), 0, 40, SchemaProfile::Minimal, Some(&custom), &HashMap::new(), None).unwrap();
        let vuln_line = lines.iter().find(|l| l.contains("\"type\":\"vulnerability\"")).unwrap();
        assert!(vuln_line.contains("\"plugin_id\""));
        assert!(!vuln_line.contains("\"severity\""));
    }

    #[test]
    fn unknown_filter_field_matches_nothing() {
        let task = sample_task();
        let mut filters = HashMap::new();
        filters.insert("not_a_real_field".to_string(), "x".to_string());
        let lines = get_results(&task, SAMPLE.as_bytes(), 0, 40, SchemaProfile::Minimal, None, &filters, None).unwrap();
        assert!(!lines.iter().any(|l| l.contains("\"type\":\"vulnerability\"")));
    }
}
