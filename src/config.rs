//! Runtime settings assembled from the command line.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::filter::FilterSet;

/// Runtime settings for the relay process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address, e.g. `127.0.0.1:8080`.
    pub addr: SocketAddr,
    /// Number of events the in-memory history holds.
    pub cache_capacity: usize,
    /// Client frame size cap; larger frames close the connection.
    pub max_msg_bytes: usize,
    /// Filters accepted in one `REQ`.
    pub max_filters_per_req: usize,
    /// Concurrent subscriptions per connection.
    pub max_subs_per_conn: usize,
    /// Cache admission filters; non-matching events are broadcast but not
    /// stored.
    pub admission: Option<FilterSet>,
    /// Oldest accepted `created_at`, as seconds before now.
    pub max_event_age: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            addr: ([127, 0, 0, 1], 0).into(),
            cache_capacity: 10_000,
            max_msg_bytes: 1_048_576,
            max_filters_per_req: 50,
            max_subs_per_conn: 32,
            admission: None,
            max_event_age: None,
        }
    }
}

/// Parse an admission filter set from a JSON array of filter objects,
/// e.g. `[{"kinds":[0,1,6,7]}]`.
pub fn parse_admission(raw: &str) -> Result<FilterSet> {
    let val: Value = serde_json::from_str(raw).context("parsing admission filter json")?;
    let arr = val
        .as_array()
        .context("admission filter must be a json array of filter objects")?;
    let set = FilterSet::from_values(arr);
    // an empty set matches nothing, which would silently disable the cache
    if set.is_empty() {
        anyhow::bail!("admission filter must contain at least one filter object");
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn admission_json_parses() {
        let set = parse_admission(r#"[{"kinds":[0,1,6,7]}]"#).unwrap();
        assert_eq!(set.len(), 1);
        let ev = Event {
            id: "aa".into(),
            pubkey: "p1".into(),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert!(set.matches(&ev));
        let mut other = ev.clone();
        other.kind = 9;
        assert!(!set.matches(&other));
    }

    #[test]
    fn admission_rejects_bad_input() {
        assert!(parse_admission("not json").is_err());
        assert!(parse_admission(r#"{"kinds":[1]}"#).is_err());
        assert!(parse_admission("[]").is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.cache_capacity, 10_000);
        assert_eq!(s.max_msg_bytes, 1_048_576);
        assert_eq!(s.max_filters_per_req, 50);
        assert_eq!(s.max_subs_per_conn, 32);
        assert!(s.admission.is_none());
        assert!(s.max_event_age.is_none());
    }
}
