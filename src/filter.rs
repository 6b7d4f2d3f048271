//! Subscription filters: conjunctive predicates over events, OR-composed
//! into filter sets.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::{Event, Tag};

/// A single conjunctive filter from a `REQ` frame.
///
/// Every field is optional; an absent field constrains nothing. `ids` and
/// `authors` hold hex prefixes, so an empty string matches every event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Single-letter tag constraints keyed by the letter, e.g. `#e` -> `e`.
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Cap on backlog events this filter contributes on replay. Ignored by
    /// [`Filter::matches`].
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a filter from a Nostr filter JSON object.
    ///
    /// Unknown keys are ignored, as are `#`-keys longer than one letter.
    pub fn from_value(val: &Value) -> Self {
        let ids = string_list(val.get("ids"));
        let authors = string_list(val.get("authors"));
        let kinds = val.get("kinds").and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                let Some(name) = key.strip_prefix('#') else {
                    continue;
                };
                if name.len() != 1 {
                    continue;
                }
                if let Some(values) = string_list(Some(v)) {
                    tags.insert(name.to_string(), values);
                }
            }
        }
        let since = val.get("since").and_then(Value::as_u64);
        let until = val.get("until").and_then(Value::as_u64);
        let limit = val
            .get("limit")
            .and_then(Value::as_u64)
            .map(|v| v as usize);
        Filter {
            ids,
            authors,
            kinds,
            tags,
            since,
            until,
            limit,
        }
    }

    /// True when every present constraint holds for `ev`.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| ev.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| ev.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let found = ev.tags.iter().any(|Tag(fields)| {
                fields.len() >= 2 && fields[0] == *name && values.contains(&fields[1])
            });
            if !found {
                return false;
            }
        }
        true
    }
}

/// Disjunction of filters; the unit of subscription. An empty set matches
/// no event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet(Vec<Filter>);

impl FilterSet {
    pub fn new(filters: Vec<Filter>) -> Self {
        FilterSet(filters)
    }

    /// Build a set from the filter objects of a `REQ` frame.
    pub fn from_values(vals: &[Value]) -> Self {
        FilterSet(vals.iter().map(Filter::from_value).collect())
    }

    /// True when at least one constituent filter matches `ev`.
    pub fn matches(&self, ev: &Event) -> bool {
        self.0.iter().any(|f| f.matches(ev))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Filter> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn string_list(val: Option<&Value>) -> Option<Vec<String>> {
    val.and_then(Value::as_array).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}
