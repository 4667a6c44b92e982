//! Entity caches
//!
//! A cache holds the entities of one side of a link-discovery run (source or
//! target). Each entity is identified by its URI and maps property names to an
//! ordered list of values; multi-valued properties keep insertion order and may
//! contain duplicates.
//!
//! The engine only reads caches through the [`Cache`] trait. Population is the
//! loader's business; [`MemoryCache`] offers a small mutation API and a JSON
//! form for that purpose:
//!
//! ```json
//! { "http://ex.org/s1": { "name": ["Apple"], "label": ["Apfel@de", "Apple@en"] } }
//! ```

use std::collections::BTreeMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Read-only view over one side of a run.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<&Instance>;

    /// All entity keys. The order is deterministic for a given cache.
    fn keys(&self) -> Vec<&str>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of `property` on `key`; empty when either is absent.
    fn property_values(&self, key: &str, property: &str) -> &[String] {
        self.get(key).map(|i| i.values(property)).unwrap_or(&[])
    }
}

/// Property values of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instance {
    properties: BTreeMap<String, Vec<String>>,
}

impl Instance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self, property: &str) -> &[String] {
        self.properties
            .get(property)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add(&mut self, property: impl Into<String>, value: impl Into<String>) {
        self.properties
            .entry(property.into())
            .or_default()
            .push(value.into());
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl<P, V> FromIterator<(P, V)> for Instance
where
    P: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (P, V)>>(iter: I) -> Self {
        let mut instance = Instance::new();
        for (p, v) in iter {
            instance.add(p, v);
        }
        instance
    }
}

/// In-memory cache keyed by URI, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryCache {
    instances: BTreeMap<String, Instance>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value, creating the entity if needed.
    pub fn add_value(
        &mut self,
        uri: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.instances
            .entry(uri.into())
            .or_default()
            .add(property, value);
    }

    /// Insert or replace a whole entity.
    pub fn add_instance(&mut self, uri: impl Into<String>, instance: Instance) {
        self.instances.insert(uri.into(), instance);
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Instance)> {
        self.instances.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.instances.keys().map(String::as_str).collect()
    }

    fn len(&self) -> usize {
        self.instances.len()
    }
}

impl<K: Into<String>> FromIterator<(K, Instance)> for MemoryCache {
    fn from_iter<I: IntoIterator<Item = (K, Instance)>>(iter: I) -> Self {
        let mut cache = MemoryCache::new();
        for (k, instance) in iter {
            cache.add_instance(k, instance);
        }
        cache
    }
}
