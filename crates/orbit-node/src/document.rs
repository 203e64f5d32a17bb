//! The configuration document model.
//!
//! A sing-box document is a JSON object with ten recognized top-level
//! sections. This module is deliberately agnostic about field meanings:
//! it only knows which sections are tagged collections, which are
//! positional, and which are singletons, and how to merge partial
//! updates into them. Semantic validation belongs to the external
//! binary.

use serde_json::{Map, Value, json};

use orbit_types::{NodeError, NodeResult};

/// The recognized top-level sections; any other key is rejected.
pub const SECTIONS: [&str; 10] = [
    "log",
    "dns",
    "ntp",
    "certificate",
    "endpoints",
    "inbounds",
    "outbounds",
    "route",
    "services",
    "experimental",
];

/// Collections keyed by a unique element `tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggedSlot {
    Inbounds,
    Outbounds,
    Endpoints,
    Services,
    DnsServers,
    RuleSets,
}

impl TaggedSlot {
    /// Every tagged collection, for shape validation sweeps.
    pub const ALL: [TaggedSlot; 6] = [
        TaggedSlot::Inbounds,
        TaggedSlot::Outbounds,
        TaggedSlot::Endpoints,
        TaggedSlot::Services,
        TaggedSlot::DnsServers,
        TaggedSlot::RuleSets,
    ];

    /// JSON path of the collection from the document root.
    pub fn path(&self) -> &'static [&'static str] {
        match self {
            TaggedSlot::Inbounds => &["inbounds"],
            TaggedSlot::Outbounds => &["outbounds"],
            TaggedSlot::Endpoints => &["endpoints"],
            TaggedSlot::Services => &["services"],
            TaggedSlot::DnsServers => &["dns", "servers"],
            TaggedSlot::RuleSets => &["route", "rule_set"],
        }
    }

    /// Dotted path for error messages.
    pub fn dotted(&self) -> String {
        self.path().join(".")
    }

    /// Entity noun used in backup reason tags, e.g. `before-create-inbound`.
    pub fn entity(&self) -> &'static str {
        match self {
            TaggedSlot::Inbounds => "inbound",
            TaggedSlot::Outbounds => "outbound",
            TaggedSlot::Endpoints => "endpoint",
            TaggedSlot::Services => "service",
            TaggedSlot::DnsServers => "dns-server",
            TaggedSlot::RuleSets => "rule-set",
        }
    }

    /// Whether elements must carry a `type` discriminator.
    pub fn requires_type(&self) -> bool {
        matches!(
            self,
            TaggedSlot::Inbounds
                | TaggedSlot::Outbounds
                | TaggedSlot::Endpoints
                | TaggedSlot::Services
        )
    }
}

/// Collections identified by 0-based position; order is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedSlot {
    RouteRules,
    DnsRules,
}

impl IndexedSlot {
    /// Every indexed collection, for shape validation sweeps.
    pub const ALL: [IndexedSlot; 2] = [IndexedSlot::RouteRules, IndexedSlot::DnsRules];

    /// JSON path of the collection from the document root.
    pub fn path(&self) -> &'static [&'static str] {
        match self {
            IndexedSlot::RouteRules => &["route", "rules"],
            IndexedSlot::DnsRules => &["dns", "rules"],
        }
    }

    /// Dotted path for error messages.
    pub fn dotted(&self) -> String {
        self.path().join(".")
    }

    /// Entity noun used in backup reason tags.
    pub fn entity(&self) -> &'static str {
        match self {
            IndexedSlot::RouteRules => "route-rule",
            IndexedSlot::DnsRules => "dns-rule",
        }
    }
}

/// Singleton object sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonSlot {
    Log,
    Dns,
    Ntp,
    Certificate,
    Route,
    Experimental,
}

impl SingletonSlot {
    /// Top-level key of the section.
    pub fn key(&self) -> &'static str {
        match self {
            SingletonSlot::Log => "log",
            SingletonSlot::Dns => "dns",
            SingletonSlot::Ntp => "ntp",
            SingletonSlot::Certificate => "certificate",
            SingletonSlot::Route => "route",
            SingletonSlot::Experimental => "experimental",
        }
    }

    /// Nested sequence keys excluded from the singleton view.
    pub fn nested_keys(&self) -> &'static [&'static str] {
        match self {
            SingletonSlot::Route => &["rules", "rule_set"],
            SingletonSlot::Dns => &["servers", "rules"],
            _ => &[],
        }
    }

    /// Only the certificate section supports deletion.
    pub fn supports_delete(&self) -> bool {
        matches!(self, SingletonSlot::Certificate)
    }

    /// Resolve an API section name.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "log" => Some(SingletonSlot::Log),
            "dns" => Some(SingletonSlot::Dns),
            "ntp" => Some(SingletonSlot::Ntp),
            "certificate" => Some(SingletonSlot::Certificate),
            "route" => Some(SingletonSlot::Route),
            "experimental" => Some(SingletonSlot::Experimental),
            _ => None,
        }
    }
}

/// The minimal bootstrap document written when no config exists yet.
pub fn default_document() -> Value {
    json!({
        "log": {"level": "info"},
        "inbounds": [],
        "outbounds": [],
    })
}

/// Reject documents that are not objects, carry unknown top-level keys,
/// or break the collection shape rules (non-array collections, elements
/// without required `tag`/`type`, duplicate tags).
pub fn validate_shape(document: &Value) -> NodeResult<()> {
    let Some(root) = document.as_object() else {
        return Err(NodeError::InvalidType(
            "configuration must be a JSON object".to_string(),
        ));
    };

    for key in root.keys() {
        if !SECTIONS.contains(&key.as_str()) {
            return Err(NodeError::bad_request(format!(
                "unknown configuration section: {}",
                key
            )));
        }
    }

    for slot in TaggedSlot::ALL {
        if let Some(value) = lookup(document, slot.path()) {
            let Some(items) = value.as_array() else {
                return Err(NodeError::bad_request(format!(
                    "{} must be an array",
                    slot.dotted()
                )));
            };
            check_tagged_items(slot, items)?;
        }
    }

    for slot in IndexedSlot::ALL {
        if let Some(value) = lookup(document, slot.path()) {
            let Some(items) = value.as_array() else {
                return Err(NodeError::bad_request(format!(
                    "{} must be an array",
                    slot.dotted()
                )));
            };
            for (index, item) in items.iter().enumerate() {
                if !item.is_object() {
                    return Err(NodeError::bad_request(format!(
                        "{}[{}] must be an object",
                        slot.dotted(),
                        index
                    )));
                }
            }
        }
    }

    Ok(())
}

fn check_tagged_items(slot: TaggedSlot, items: &[Value]) -> NodeResult<()> {
    let mut seen = std::collections::HashSet::new();
    for (index, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(NodeError::bad_request(format!(
                "{}[{}] must be an object",
                slot.dotted(),
                index
            )));
        };
        let Some(tag) = obj.get("tag").and_then(Value::as_str) else {
            return Err(NodeError::bad_request(format!(
                "{}[{}] is missing a string tag",
                slot.dotted(),
                index
            )));
        };
        if !seen.insert(tag.to_string()) {
            return Err(NodeError::bad_request(format!(
                "duplicate tag '{}' in {}",
                tag,
                slot.dotted()
            )));
        }
        if slot.requires_type() && obj.get("type").and_then(Value::as_str).is_none() {
            return Err(NodeError::bad_request(format!(
                "{}[{}] is missing a string type",
                slot.dotted(),
                index
            )));
        }
    }
    Ok(())
}

/// Validate one element being inserted into a tagged collection.
pub fn validate_tagged_item(slot: TaggedSlot, item: &Value) -> NodeResult<String> {
    let Some(obj) = item.as_object() else {
        return Err(NodeError::bad_request(format!(
            "{} element must be an object",
            slot.entity()
        )));
    };
    let Some(tag) = obj.get("tag").and_then(Value::as_str) else {
        return Err(NodeError::bad_request(format!(
            "{} element requires a string tag",
            slot.entity()
        )));
    };
    if slot.requires_type() && obj.get("type").and_then(Value::as_str).is_none() {
        return Err(NodeError::bad_request(format!(
            "{} element requires a string type",
            slot.entity()
        )));
    }
    Ok(tag.to_string())
}

/// Walk a path of object keys.
pub fn lookup<'a>(document: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = document;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Walk a path of object keys, creating empty objects along the way, and
/// return the array at the leaf (created empty when absent).
pub fn lookup_array_mut<'a>(
    document: &'a mut Value,
    path: &[&str],
) -> NodeResult<&'a mut Vec<Value>> {
    let dotted = path.join(".");
    let mut current = document;
    let Some((last, parents)) = path.split_last() else {
        return Err(NodeError::bad_request("empty collection path"));
    };

    for key in parents {
        let obj = current.as_object_mut().ok_or_else(|| {
            NodeError::bad_request(format!("{} parent is not an object", dotted))
        })?;
        current = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let obj = current
        .as_object_mut()
        .ok_or_else(|| NodeError::bad_request(format!("{} parent is not an object", dotted)))?;
    let leaf = obj
        .entry(last.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    leaf.as_array_mut()
        .ok_or_else(|| NodeError::bad_request(format!("{} must be an array", dotted)))
}

/// Position of the element with `tag`, if any.
pub fn position_of_tag(items: &[Value], tag: &str) -> Option<usize> {
    items
        .iter()
        .position(|item| item.get("tag").and_then(Value::as_str) == Some(tag))
}

/// Recursive merge: object values merge key-by-key, everything else
/// (including arrays) is replaced wholesale. Nulls overwrite.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target_obj), Some(patch_obj)) => {
            for (key, patch_value) in patch_obj {
                match target_obj.get_mut(key) {
                    Some(existing) if existing.is_object() && patch_value.is_object() => {
                        deep_merge(existing, patch_value);
                    }
                    _ => {
                        target_obj.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        _ => {
            *target = patch.clone();
        }
    }
}

/// Top-level-keys-only merge used by tagged-collection `patch`.
pub fn shallow_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// The singleton view of a section: its object minus nested sequences.
pub fn singleton_view(document: &Value, slot: SingletonSlot) -> Option<Value> {
    let section = document.as_object()?.get(slot.key())?.as_object()?;
    let mut view = section.clone();
    for nested in slot.nested_keys() {
        view.remove(*nested);
    }
    Some(Value::Object(view))
}

/// Replace a singleton section, preserving its nested sequences.
///
/// Nested sequence keys in `value` are ignored; the collections they
/// shadow stay untouched (they have their own operations).
pub fn set_singleton(document: &mut Value, slot: SingletonSlot, value: &Value) -> NodeResult<()> {
    let Some(incoming) = value.as_object() else {
        return Err(NodeError::bad_request(format!(
            "{} must be an object",
            slot.key()
        )));
    };
    let root = document
        .as_object_mut()
        .ok_or_else(|| NodeError::InvalidType("configuration must be a JSON object".into()))?;

    let mut section = incoming.clone();
    for nested in slot.nested_keys() {
        section.remove(*nested);
    }
    if let Some(existing) = root.get(slot.key()).and_then(Value::as_object) {
        for nested in slot.nested_keys() {
            if let Some(kept) = existing.get(*nested) {
                section.insert(nested.to_string(), kept.clone());
            }
        }
    }
    root.insert(slot.key().to_string(), Value::Object(section));
    Ok(())
}

/// Deep-merge a partial object into a singleton section, preserving its
/// nested sequences.
pub fn patch_singleton(document: &mut Value, slot: SingletonSlot, patch: &Value) -> NodeResult<()> {
    let Some(incoming) = patch.as_object() else {
        return Err(NodeError::bad_request(format!(
            "{} patch must be an object",
            slot.key()
        )));
    };
    let root = document
        .as_object_mut()
        .ok_or_else(|| NodeError::InvalidType("configuration must be a JSON object".into()))?;

    let mut cleaned = incoming.clone();
    for nested in slot.nested_keys() {
        cleaned.remove(*nested);
    }

    let section = root
        .entry(slot.key().to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !section.is_object() {
        *section = Value::Object(Map::new());
    }
    deep_merge(section, &Value::Object(cleaned));
    Ok(())
}

/// Remove a deletable singleton section; false when absent.
pub fn delete_singleton(document: &mut Value, slot: SingletonSlot) -> NodeResult<bool> {
    if !slot.supports_delete() {
        return Err(NodeError::bad_request(format!(
            "section {} cannot be deleted",
            slot.key()
        )));
    }
    let root = document
        .as_object_mut()
        .ok_or_else(|| NodeError::InvalidType("configuration must be a JSON object".into()))?;
    Ok(root.remove(slot.key()).is_some())
}
