//! Generators for `task_id` and `trace_id`.

use chrono::Utc;
use rand::Rng;

/// `{pool}-{instance_id}-{yyyymmdd}-{random}`. `instance_id` is not yet known
/// at admission time (it is assigned when the worker acquires a scanner), so
/// admission uses the literal `"pending"` placeholder there; the worker does
/// not rewrite `task_id` once minted — it is immutable.
pub fn new_task_id(pool: &str) -> String {
    let date = Utc::now().format("%Y%m%d");
    let random = random_suffix(8);
    format!("{pool}-pending-{date}-{random}")
}

pub fn new_trace_id() -> String {
    format!("trace-{}", random_suffix(16))
}

fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len).map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_contains_pool_and_date() {
        let id = new_task_id("nessus");
        assert!(id.starts_with("nessus-pending-"));
    }

    #[test]
    fn trace_ids_are_unique() {
        assert_ne!(new_trace_id(), new_trace_id());
    }
}
