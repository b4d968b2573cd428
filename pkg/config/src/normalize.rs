//! Turn a raw JSON map into a fully populated `PersistedConfig`.
//!
//! Fields are salvaged one at a time: a field that does not deserialize is
//! replaced by its default and logged, the rest of the config survives. The
//! raw value of every unreadable field is kept in [`Unreadable`] so it can be
//! written back unchanged.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use pkg_types::config::{Customizations, FeatureToggles, PersistedConfig};

use crate::migration::JsonMap;

/// Raw values of known keys that did not deserialize.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Unreadable {
    /// Top-level keys, including whole sections that were not objects.
    pub fields: JsonMap,
    /// Sub-keys of object sections, keyed by section.
    pub section_fields: BTreeMap<String, JsonMap>,
}

impl Unreadable {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.section_fields.is_empty()
    }

    /// Forget every entry whose typed value differs between two serialized
    /// configs. Whatever the user set explicitly wins over the raw value.
    pub fn forget_changed(&mut self, before: &JsonMap, after: &JsonMap) {
        self.fields.retain(|key, _| before.get(key) == after.get(key));
        for (section, subs) in self.section_fields.iter_mut() {
            let old = before.get(section).and_then(Value::as_object);
            let new = after.get(section).and_then(Value::as_object);
            subs.retain(|sub, _| old.and_then(|m| m.get(sub)) == new.and_then(|m| m.get(sub)));
        }
        self.section_fields.retain(|_, subs| !subs.is_empty());
    }

    /// Write the raw values over a serialized config.
    pub fn restore_into(&self, out: &mut JsonMap) {
        for (key, value) in &self.fields {
            out.insert(key.clone(), value.clone());
        }
        for (section, subs) in &self.section_fields {
            if let Some(Value::Object(target)) = out.get_mut(section) {
                for (sub, value) in subs {
                    target.insert(sub.clone(), value.clone());
                }
            }
        }
    }
}

fn take_field<T: DeserializeOwned>(
    config: &mut JsonMap,
    key: &str,
    unreadable: &mut Unreadable,
) -> Option<T> {
    let value = config.remove(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[config] unreadable field {} kept as-is: {}", key, e);
            unreadable.fields.insert(key.to_string(), value);
            None
        }
    }
}

/// Deserialize an object-valued section, keeping every sub-key that is
/// individually readable on top of the section defaults.
fn salvage_section<T>(config: &mut JsonMap, key: &str, unreadable: &mut Unreadable) -> T
where
    T: Serialize + DeserializeOwned + Default,
{
    let Some(value) = config.remove(key) else {
        return T::default();
    };
    let Value::Object(user) = value else {
        warn!("[config] {} is not an object, using defaults", key);
        unreadable.fields.insert(key.to_string(), value);
        return T::default();
    };
    if let Ok(section) = serde_json::from_value(Value::Object(user.clone())) {
        return section;
    }

    let mut merged: Map<String, Value> = match serde_json::to_value(T::default()) {
        Ok(Value::Object(m)) => m,
        _ => Map::new(),
    };
    for (sub, v) in user {
        let mut candidate = merged.clone();
        candidate.insert(sub.clone(), v.clone());
        if serde_json::from_value::<T>(Value::Object(candidate.clone())).is_ok() {
            merged = candidate;
        } else {
            warn!("[config] unreadable field {}.{} kept as-is", key, sub);
            unreadable
                .section_fields
                .entry(key.to_string())
                .or_default()
                .insert(sub, v);
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or_default()
}

/// Build a config from `raw`, defaulting whatever is missing or unreadable.
/// Unknown keys end up in `extra`; unreadable known keys in the returned
/// [`Unreadable`].
pub fn normalize(mut raw: JsonMap) -> (PersistedConfig, Unreadable) {
    let mut unreadable = Unreadable::default();
    let mut cfg = PersistedConfig::default();
    if let Some(v) = take_field(&mut raw, "schemaVersion", &mut unreadable) {
        cfg.schema_version = v;
    }
    if let Some(v) = take_field(&mut raw, "runtimeKind", &mut unreadable) {
        cfg.runtime_kind = v;
    }
    if let Some(v) = take_field(&mut raw, "guestArchitecture", &mut unreadable) {
        cfg.guest_architecture = v;
    }
    cfg.feature_toggles =
        salvage_section::<FeatureToggles>(&mut raw, "featureToggles", &mut unreadable);
    cfg.customizations =
        salvage_section::<Customizations>(&mut raw, "customizations", &mut unreadable);
    cfg.extra = raw;
    (cfg, unreadable)
}
