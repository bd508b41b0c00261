//! Result validator (spec §4.9, C11): streams `scan_native.nessus` once,
//! computes host/vulnerability counts, a severity histogram, and an
//! authentication verdict for authenticated scans.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use scanforge_core::error::{Result, ScanforgeError};
use scanforge_core::model::{AuthenticationStatus, ScanType, SeverityHistogram, ValidationStats, ValidationWarning};

/// Diagnostic plugin identifiers used to infer `authentication_status` for
/// authenticated scans (spec §4.9, §9: "the exact numeric identifiers are
/// implementation-defined... deferred to a configuration file"). Built-in
/// defaults keep the crate usable without extra config.
#[derive(Debug, Clone)]
pub struct PluginIdTable {
    pub success_plugin_ids: Vec<String>,
    pub failure_plugin_ids: Vec<String>,
}

impl Default for PluginIdTable {
    fn default() -> Self {
        Self {
            // Nessus's own "Authentication Success/Failure" diagnostic plugins.
            success_plugin_ids: vec!["21745".to_string(), "117885".to_string()],
            failure_plugin_ids: vec!["21745_failed".to_string(), "110723".to_string()],
        }
    }
}

impl PluginIdTable {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| ScanforgeError::Storage(format!("invalid validator plugin table: {e}")))
    }
}

impl serde::Serialize for PluginIdTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("PluginIdTable", 2)?;
        s.serialize_field("success_plugin_ids", &self.success_plugin_ids)?;
        s.serialize_field("failure_plugin_ids", &self.failure_plugin_ids)?;
        s.end()
    }
}

impl<'de> serde::Deserialize<'de> for PluginIdTable {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            #[serde(default)]
            success_plugin_ids: Vec<String>,
            #[serde(default)]
            failure_plugin_ids: Vec<String>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self { success_plugin_ids: raw.success_plugin_ids, failure_plugin_ids: raw.failure_plugin_ids })
    }
}

fn severity_bucket(histogram: &mut SeverityHistogram, severity: u8) {
    match severity {
        0 => histogram.info += 1,
        1 => histogram.low += 1,
        2 => histogram.medium += 1,
        3 => histogram.high += 1,
        4 => histogram.critical += 1,
        _ => {}
    }
}

fn attr_value(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().filter_map(|a| a.ok()).find(|a| a.key.as_ref() == name.as_bytes()).map(|a| {
        String::from_utf8_lossy(&a.value).to_string()
    })
}

/// Parses `scan_native.nessus` in a single streaming pass (spec §9, "Result
/// pipeline streaming": memory bounded independently of finding count).
pub fn validate(bytes: &[u8], scan_type: ScanType, plugin_table: &PluginIdTable) -> Result<(ValidationStats, Vec<ValidationWarning>, AuthenticationStatus)> {
    if bytes.is_empty() {
        return Err(ScanforgeError::Storage("empty export".to_string()));
    }

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut stats = ValidationStats::default();
    let mut warnings = Vec::new();
    let mut seen_plugin_ids: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    let mut saw_report_host = false;
    let mut malformed = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"ReportHost" => {
                        saw_report_host = true;
                        stats.hosts_scanned += 1;
                    }
                    b"ReportItem" => {
                        stats.total_vulnerabilities += 1;
                        let severity = attr_value(&e, "severity").and_then(|v| v.parse::<u8>().ok()).unwrap_or(0);
                        severity_bucket(&mut stats.severity, severity);
                        if let Some(plugin_id) = attr_value(&e, "pluginID") {
                            seen_plugin_ids.push(plugin_id);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => {
                malformed = true;
                break;
            }
        }
        buf.clear();
    }

    if malformed {
        warnings.push(ValidationWarning::XmlInvalid);
    }
    if !saw_report_host {
        warnings.push(ValidationWarning::EmptyScan);
    }

    let auth_status = infer_authentication_status(scan_type, &seen_plugin_ids, plugin_table, &mut warnings);

    Ok((stats, warnings, auth_status))
}

fn infer_authentication_status(
    scan_type: ScanType,
    seen_plugin_ids: &[String],
    table: &PluginIdTable,
    warnings: &mut Vec<ValidationWarning>,
) -> AuthenticationStatus {
    if !scan_type.requires_credentials() {
        return AuthenticationStatus::NotApplicable;
    }

    let has_success = table.success_plugin_ids.iter().any(|id| seen_plugin_ids.contains(id));
    let has_failure = table.failure_plugin_ids.iter().any(|id| seen_plugin_ids.contains(id));

    match (has_success, has_failure) {
        (true, false) => AuthenticationStatus::Success,
        (false, true) => {
            warnings.push(ValidationWarning::AuthFailed);
            AuthenticationStatus::Failed
        }
        (true, true) => AuthenticationStatus::Partial,
        (false, false) => {
            warnings.push(ValidationWarning::AuthFailed);
            AuthenticationStatus::Failed
        }
    }
}

/// Reads a validator plugin-id table from disk, falling back to built-in
/// defaults when the file is absent (spec §4.9 Open Question resolution).
pub fn load_plugin_table(path: &std::path::Path) -> PluginIdTable {
    match std::fs::read_to_string(path) {
        Ok(contents) => PluginIdTable::from_yaml_str(&contents).unwrap_or_default(),
        Err(_) => PluginIdTable::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNTRUSTED_SCAN: &str = r#"
        <NessusClientData_v2>
          <Report>
            <ReportHost name="10.0.0.1">
              <ReportItem pluginID="1001" severity="0"></ReportItem>
              <ReportItem pluginID="1002" severity="2"></ReportItem>
              <ReportItem pluginID="1003" severity="4"></ReportItem>
            </ReportHost>
          </Report>
        </NessusClientData_v2>
    "#;

    #[test]
    fn counts_hosts_and_severities() {
        let (stats, warnings, auth) =
            validate(UNTRUSTED_SCAN.as_bytes(), ScanType::Untrusted, &PluginIdTable::default()).unwrap();
        assert_eq!(stats.hosts_scanned, 1);
        assert_eq!(stats.total_vulnerabilities, 3);
        assert_eq!(stats.severity.info, 1);
        assert_eq!(stats.severity.medium, 1);
        assert_eq!(stats.severity.critical, 1);
        assert!(warnings.is_empty());
        assert_eq!(auth, AuthenticationStatus::NotApplicable);
    }

    #[test]
    fn empty_scan_warns() {
        let doc = r#"<NessusClientData_v2><Report></Report></NessusClientData_v2>"#;
        let (_, warnings, _) = validate(doc.as_bytes(), ScanType::Untrusted, &PluginIdTable::default()).unwrap();
        assert!(warnings.contains(&ValidationWarning::EmptyScan));
    }

    #[test]
    fn authenticated_scan_without_diagnostic_plugin_is_failed() {
        let doc = r#"<NessusClientData_v2><Report><ReportHost name="h"><ReportItem pluginID="9999" severity="0"></ReportItem></ReportHost></Report></NessusClientData_v2>"#;
        let (_, warnings, auth) =
            validate(doc.as_bytes(), ScanType::Authenticated, &PluginIdTable::default()).unwrap();
        assert_eq!(auth, AuthenticationStatus::Failed);
        assert!(warnings.contains(&ValidationWarning::AuthFailed));
    }

    #[test]
    fn authenticated_scan_with_success_plugin_is_success() {
        let doc = r#"<NessusClientData_v2><Report><ReportHost name="h"><ReportItem pluginID="21745" severity="0"></ReportItem></ReportHost></Report></NessusClientData_v2>"#;
        let (_, _, auth) = validate(doc.as_bytes(), ScanType::Authenticated, &PluginIdTable::default()).unwrap();
        assert_eq!(auth, AuthenticationStatus::Success);
    }
}
