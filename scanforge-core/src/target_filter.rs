//! CIDR-aware target matching for `list_tasks(target_filter=...)` (spec
//! §4.1).
//!
//! A task matches if any of its stored targets (split on commas) either:
//! - equals the query string verbatim,
//! - is contained in the query's network (query is a CIDR),
//! - contains the query (the task's target is a CIDR), or
//! - overlaps the query (both are CIDRs).
//!
//! Targets that don't parse as an IP or network (e.g. DNS hostnames) fall
//! back to plain string equality.

use ipnetwork::IpNetwork;

fn parse_network(s: &str) -> Option<IpNetwork> {
    if let Ok(net) = s.parse::<IpNetwork>() {
        return Some(net);
    }
    s.parse::<std::net::IpAddr>().ok().map(IpNetwork::from)
}

fn single_target_matches(task_target: &str, query: &str) -> bool {
    let task_target = task_target.trim();
    if task_target.eq_ignore_ascii_case(query) {
        return true;
    }

    match (parse_network(task_target), parse_network(query)) {
        (Some(task_net), Some(query_net)) => {
            // IP/IP, IP/CIDR, CIDR/IP, and CIDR/CIDR containment/overlap.
            task_net.contains(query_net.ip())
                || query_net.contains(task_net.ip())
                || networks_overlap(&task_net, &query_net)
        }
        _ => false,
    }
}

fn networks_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    if a.is_ipv4() != b.is_ipv4() {
        return false;
    }
    a.contains(b.network()) || b.contains(a.network())
}

/// `true` if any comma-separated target stored on the task matches `query`.
pub fn targets_match(task_targets: &str, query: &str) -> bool {
    task_targets.split(',').any(|t| single_target_matches(t, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_ip_match() {
        assert!(targets_match("10.0.0.1", "10.0.0.1"));
        assert!(!targets_match("10.0.0.1", "10.0.0.2"));
    }

    #[test]
    fn query_cidr_contains_task_ip() {
        assert!(targets_match("10.0.0.5", "10.0.0.0/24"));
        assert!(!targets_match("10.0.1.5", "10.0.0.0/24"));
    }

    #[test]
    fn task_cidr_contains_query_ip() {
        assert!(targets_match("10.0.0.0/24", "10.0.0.5"));
    }

    #[test]
    fn cidr_cidr_overlap() {
        assert!(targets_match("10.0.0.0/24", "10.0.0.128/25"));
        assert!(!targets_match("10.0.0.0/24", "10.0.1.0/24"));
    }

    #[test]
    fn comma_separated_targets_any_match() {
        assert!(targets_match("10.0.0.1,10.0.0.2", "10.0.0.2"));
    }

    #[test]
    fn hostname_falls_back_to_string_equality() {
        assert!(targets_match("scanme.example.com", "scanme.example.com"));
        assert!(!targets_match("scanme.example.com", "other.example.com"));
    }
}
