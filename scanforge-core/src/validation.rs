//! Admission-time syntactic validation.

use crate::error::{Result, ScanforgeError};
use crate::model::{Credentials, ScanType};

/// Accepts a single IP, a CIDR, or a comma-separated list of either.
pub fn validate_targets(targets: &str) -> Result<()> {
    if targets.trim().is_empty() {
        return Err(ScanforgeError::InvalidArgument("targets must not be empty".to_string()));
    }
    for entry in targets.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ScanforgeError::InvalidArgument(
                "targets must not contain empty entries".to_string(),
            ));
        }
        let is_ip = entry.parse::<std::net::IpAddr>().is_ok();
        let is_cidr = entry.parse::<ipnetwork::IpNetwork>().is_ok();
        let is_hostname = entry.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !is_ip && !is_cidr && !is_hostname {
            return Err(ScanforgeError::InvalidArgument(format!("invalid target: {entry}")));
        }
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ScanforgeError::InvalidArgument("name must not be empty".to_string()));
    }
    Ok(())
}

/// Authenticated variants require a complete SSH credential block; escalation
/// account/password are only meaningful alongside `sudo`/`su`.
pub fn validate_credentials(scan_type: ScanType, credentials: Option<&Credentials>) -> Result<()> {
    match (scan_type.requires_credentials(), credentials) {
        (true, None) => Err(ScanforgeError::InvalidArgument(format!(
            "{scan_type:?} requires ssh_username/ssh_password"
        ))),
        (true, Some(creds)) => {
            if creds.ssh_username.trim().is_empty() || creds.ssh_password.is_empty() {
                return Err(ScanforgeError::InvalidArgument(
                    "ssh_username and ssh_password must be non-empty".to_string(),
                ));
            }
            Ok(())
        }
        (false, _) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ElevationMethod;

    #[test]
    fn rejects_empty_targets() {
        assert!(validate_targets("").is_err());
        assert!(validate_targets("   ").is_err());
    }

    #[test]
    fn accepts_single_ip_cidr_and_comma_list() {
        assert!(validate_targets("10.0.0.1").is_ok());
        assert!(validate_targets("10.0.0.0/24").is_ok());
        assert!(validate_targets("10.0.0.1, 10.0.0.2, scanme.example.com").is_ok());
    }

    #[test]
    fn authenticated_scan_requires_credentials() {
        assert!(validate_credentials(ScanType::Authenticated, None).is_err());
        let creds = Credentials {
            ssh_username: "root".to_string(),
            ssh_password: "hunter2".to_string(),
            elevate_privileges_with: ElevationMethod::Sudo,
            escalation_account: None,
            escalation_password: None,
        };
        assert!(validate_credentials(ScanType::Authenticated, Some(&creds)).is_ok());
    }

    #[test]
    fn untrusted_scan_ignores_missing_credentials() {
        assert!(validate_credentials(ScanType::Untrusted, None).is_ok());
    }
}
