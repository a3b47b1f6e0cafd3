#![forbid(unsafe_code)]

//! Attribute payload diffing.
//!
//! Hosts that accept a flat "changed attributes" payload can use
//! [`diff_props`] from their `prepare_update`. A [`ViewConfig`] lists the
//! attributes a view type understands and how each one is compared and
//! processed before it reaches the host.
//!
//! # Rules
//!
//! - Attributes not listed in the config are ignored unless the config
//!   allows unlisted attributes.
//! - An attribute present before and absent now is emitted as
//!   [`PropValue::Null`].
//! - A nested attribute is diffed recursively and its keys are flattened
//!   into the payload.
//! - An empty payload is reported as `None`.

use std::collections::BTreeMap;
use std::fmt;

use crate::props::{PropMap, PropValue};

/// Custom comparison; returns `true` when the values differ.
pub type DiffFn = fn(&PropValue, &PropValue) -> bool;

/// Custom transform applied before a value is emitted.
pub type ProcessFn = fn(&PropValue) -> PropValue;

/// How one attribute is compared and emitted.
#[derive(Clone)]
pub enum AttributeConfig {
    /// Compare with `==`, emit as-is.
    Default,
    /// Compare with `diff` (or `==`), emit through `process` (or as-is).
    Custom {
        diff: Option<DiffFn>,
        process: Option<ProcessFn>,
    },
    /// A map-valued attribute whose entries are flattened into the payload.
    Nested(ViewConfig),
}

impl fmt::Debug for AttributeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Custom { diff, process } => f
                .debug_struct("Custom")
                .field("diff", &diff.is_some())
                .field("process", &process.is_some())
                .finish(),
            Self::Nested(cfg) => f.debug_tuple("Nested").field(cfg).finish(),
        }
    }
}

/// Attribute schema of one host view type.
#[derive(Debug, Clone, Default)]
pub struct ViewConfig {
    attributes: BTreeMap<String, AttributeConfig>,
    allow_unlisted: bool,
}

impl ViewConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that treats every attribute as [`AttributeConfig::Default`].
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            attributes: BTreeMap::new(),
            allow_unlisted: true,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, config: AttributeConfig) -> Self {
        self.attributes.insert(name.into(), config);
        self
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeConfig> {
        static DEFAULT: AttributeConfig = AttributeConfig::Default;
        match self.attributes.get(name) {
            Some(cfg) => Some(cfg),
            None if self.allow_unlisted => Some(&DEFAULT),
            None => None,
        }
    }
}

/// Payload for a freshly created instance: every valid, non-null attribute.
#[must_use]
pub fn create_props_payload(props: &PropMap, config: &ViewConfig) -> PropMap {
    let mut payload = PropMap::new();
    for (key, value) in props {
        match config.attribute(key) {
            None => {}
            Some(AttributeConfig::Nested(nested)) => {
                if let PropValue::Map(inner) = value {
                    payload.extend(create_props_payload(inner, nested));
                }
            }
            Some(AttributeConfig::Custom {
                process: Some(process),
                ..
            }) => {
                payload.insert(key.clone(), process(value));
            }
            Some(_) => {
                if !value.is_null() {
                    payload.insert(key.clone(), value.clone());
                }
            }
        }
    }
    payload
}

/// Changed attributes between `prev` and `next`, or `None` if nothing changed.
#[must_use]
pub fn diff_props(prev: &PropMap, next: &PropMap, config: &ViewConfig) -> Option<PropMap> {
    let mut payload = PropMap::new();
    diff_into(&mut payload, prev, next, config);
    if payload.is_empty() { None } else { Some(payload) }
}

fn diff_into(payload: &mut PropMap, prev: &PropMap, next: &PropMap, config: &ViewConfig) {
    let null = PropValue::Null;

    for (key, next_value) in next {
        let Some(attr) = config.attribute(key) else {
            continue;
        };
        let prev_value = prev.get(key).unwrap_or(&null);
        match attr {
            AttributeConfig::Nested(nested) => {
                let empty = PropMap::new();
                let prev_inner = prev_value.as_map().unwrap_or(&empty);
                let next_inner = next_value.as_map().unwrap_or(&empty);
                diff_into(payload, prev_inner, next_inner, nested);
            }
            AttributeConfig::Default => {
                if prev_value != next_value {
                    payload.insert(key.clone(), next_value.clone());
                }
            }
            AttributeConfig::Custom { diff, process } => {
                let changed = match diff {
                    Some(diff) => diff(prev_value, next_value),
                    None => prev_value != next_value,
                };
                if changed {
                    let emitted = match process {
                        Some(process) => process(next_value),
                        None => next_value.clone(),
                    };
                    payload.insert(key.clone(), emitted);
                }
            }
        }
    }

    for (key, prev_value) in prev {
        if next.contains_key(key) {
            continue;
        }
        match config.attribute(key) {
            None => {}
            Some(AttributeConfig::Nested(nested)) => {
                if let PropValue::Map(inner) = prev_value {
                    clear_nested(payload, inner, nested);
                }
            }
            Some(_) => {
                payload.insert(key.clone(), PropValue::Null);
            }
        }
    }
}

fn clear_nested(payload: &mut PropMap, prev: &PropMap, config: &ViewConfig) {
    for (key, value) in prev {
        match config.attribute(key) {
            None => {}
            Some(AttributeConfig::Nested(nested)) => {
                if let PropValue::Map(inner) = value {
                    clear_nested(payload, inner, nested);
                }
            }
            // A sibling attribute may already have set this key.
            Some(_) => {
                payload.entry(key.clone()).or_insert(PropValue::Null);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, PropValue)]) -> PropMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn view() -> ViewConfig {
        ViewConfig::new()
            .with_attribute("title", AttributeConfig::Default)
            .with_attribute(
                "style",
                AttributeConfig::Nested(
                    ViewConfig::new()
                        .with_attribute("color", AttributeConfig::Default)
                        .with_attribute("width", AttributeConfig::Default),
                ),
            )
            .with_attribute(
                "scale",
                AttributeConfig::Custom {
                    diff: Some(|a, b| {
                        (a.as_int().unwrap_or(0) - b.as_int().unwrap_or(0)).abs() > 1
                    }),
                    process: Some(|v| PropValue::Int(v.as_int().unwrap_or(0) * 10)),
                },
            )
    }

    #[test]
    fn unchanged_props_produce_no_payload() {
        let p = map(&[("title", "a".into())]);
        assert!(diff_props(&p, &p.clone(), &view()).is_none());
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let prev = map(&[]);
        let next = map(&[("bogus", 1.into())]);
        assert!(diff_props(&prev, &next, &view()).is_none());
    }

    #[test]
    fn removed_attribute_is_nulled() {
        let prev = map(&[("title", "a".into())]);
        let next = map(&[]);
        let payload = diff_props(&prev, &next, &view()).expect("payload");
        assert_eq!(payload.get("title"), Some(&PropValue::Null));
    }

    #[test]
    fn nested_attributes_are_flattened() {
        let prev = map(&[("style", map(&[("color", "red".into())]).into())]);
        let next = map(&[(
            "style",
            map(&[("color", "blue".into()), ("width", 3.into())]).into(),
        )]);
        let payload = diff_props(&prev, &next, &view()).expect("payload");
        assert_eq!(payload.get("color"), Some(&PropValue::from("blue")));
        assert_eq!(payload.get("width"), Some(&PropValue::Int(3)));
        assert!(!payload.contains_key("style"));
    }

    #[test]
    fn removed_nested_map_clears_its_keys() {
        let prev = map(&[("style", map(&[("color", "red".into())]).into())]);
        let payload = diff_props(&prev, &map(&[]), &view()).expect("payload");
        assert_eq!(payload.get("color"), Some(&PropValue::Null));
    }

    #[test]
    fn custom_diff_and_process_apply() {
        let prev = map(&[("scale", 1.into())]);
        let small = map(&[("scale", 2.into())]);
        assert!(diff_props(&prev, &small, &view()).is_none());
        let big = map(&[("scale", 5.into())]);
        let payload = diff_props(&prev, &big, &view()).expect("payload");
        assert_eq!(payload.get("scale"), Some(&PropValue::Int(50)));
    }

    #[test]
    fn permissive_config_diffs_everything() {
        let prev = map(&[("a", 1.into())]);
        let next = map(&[("b", 2.into())]);
        let payload = diff_props(&prev, &next, &ViewConfig::permissive()).expect("payload");
        assert_eq!(payload.len(), 2);
    }

    #[test]
    fn create_payload_skips_nulls_and_flattens() {
        let props = map(&[
            ("title", PropValue::Null),
            ("style", map(&[("width", 4.into())]).into()),
        ]);
        let payload = create_props_payload(&props, &view());
        assert_eq!(payload.len(), 1);
        assert_eq!(payload.get("width"), Some(&PropValue::Int(4)));
    }
}
