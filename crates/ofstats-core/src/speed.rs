//! Link speed resolution from a hierarchical override document.
//!
//! The document has three optional levels, most specific wins:
//!
//! ```json
//! { "default": 100, "00:00:00:00:00:00:00:01": { "default": 10, "4": 1 } }
//! ```
//!
//! Values are in the configured [`SpeedUnit`] and are converted to bytes/s
//! when the tree is built, so callers never see the external unit.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SpeedUnit;
use crate::key::DeviceId;

const DEFAULT_KEY: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverrideError {
    #[error("malformed override config at {path}: {reason}")]
    Malformed { path: String, reason: String },
}

impl OverrideError {
    fn at(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceOverrides {
    pub default: Option<f64>,
    pub ports: HashMap<u32, f64>,
}

/// Validated override tree, speeds in bytes/s.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverrideTree {
    pub global: Option<f64>,
    pub devices: HashMap<DeviceId, DeviceOverrides>,
}

/// Which level of the lookup produced a speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedSource {
    PortOverride,
    DeviceDefault,
    GlobalDefault,
    Reported,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedSpeed {
    pub bytes_per_sec: f64,
    pub source: SpeedSource,
}

impl ResolvedSpeed {
    pub const UNKNOWN: ResolvedSpeed = ResolvedSpeed {
        bytes_per_sec: 0.0,
        source: SpeedSource::Unknown,
    };

    pub fn is_known(&self) -> bool {
        self.bytes_per_sec > 0.0
    }

    pub fn known(&self) -> Option<f64> {
        self.is_known().then_some(self.bytes_per_sec)
    }
}

impl OverrideTree {
    /// Parse the external document. Any malformed entry rejects the whole
    /// document.
    pub fn from_json(doc: &Value, unit: SpeedUnit) -> Result<Self, OverrideError> {
        let Some(root) = doc.as_object() else {
            return Err(OverrideError::at("$", "expected an object"));
        };

        let mut tree = OverrideTree::default();
        for (key, value) in root {
            if key == DEFAULT_KEY {
                tree.global = Some(parse_speed(value, unit, &format!("$.{key}"))?);
                continue;
            }

            let path = format!("$.{key}");
            let Some(entries) = value.as_object() else {
                return Err(OverrideError::at(path, "expected an object of port speeds"));
            };

            let mut device = DeviceOverrides::default();
            for (port, speed) in entries {
                let entry_path = format!("{path}.{port}");
                if port == DEFAULT_KEY {
                    device.default = Some(parse_speed(speed, unit, &entry_path)?);
                    continue;
                }
                let port_no: u32 = port
                    .parse()
                    .map_err(|_| OverrideError::at(&entry_path, "port key must be a port number"))?;
                device.ports.insert(port_no, parse_speed(speed, unit, &entry_path)?);
            }
            tree.devices.insert(DeviceId::new(key.clone()), device);
        }

        Ok(tree)
    }

    pub fn parse(doc: &str, unit: SpeedUnit) -> Result<Self, OverrideError> {
        let value: Value = serde_json::from_str(doc)
            .map_err(|err| OverrideError::at("$", format!("invalid json: {err}")))?;
        Self::from_json(&value, unit)
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.devices.is_empty()
    }

    /// Most specific level wins; the reported speed is only used when no
    /// override level applies.
    pub fn resolve(&self, device: &DeviceId, port: u32, reported: Option<u64>) -> ResolvedSpeed {
        let device_level = self.devices.get(device);

        if let Some(speed) = device_level.and_then(|d| d.ports.get(&port)) {
            return ResolvedSpeed {
                bytes_per_sec: *speed,
                source: SpeedSource::PortOverride,
            };
        }
        if let Some(speed) = device_level.and_then(|d| d.default) {
            return ResolvedSpeed {
                bytes_per_sec: speed,
                source: SpeedSource::DeviceDefault,
            };
        }
        if let Some(speed) = self.global {
            return ResolvedSpeed {
                bytes_per_sec: speed,
                source: SpeedSource::GlobalDefault,
            };
        }
        match reported {
            Some(speed) if speed > 0 => ResolvedSpeed {
                bytes_per_sec: speed as f64,
                source: SpeedSource::Reported,
            },
            _ => ResolvedSpeed::UNKNOWN,
        }
    }
}

fn parse_speed(value: &Value, unit: SpeedUnit, path: &str) -> Result<f64, OverrideError> {
    let Some(speed) = value.as_f64() else {
        return Err(OverrideError::at(path, "speed must be a number"));
    };
    if !speed.is_finite() || speed < 0.0 {
        return Err(OverrideError::at(path, "speed must be a non-negative number"));
    }
    Ok(unit.to_bytes_per_sec(speed))
}

/// Resolves the operative speed of a port.
///
/// Readers load the active tree without locking; `reload` swaps in a complete
/// replacement so a concurrent `resolve` sees either the old or the new tree.
pub struct SpeedResolver {
    tree: ArcSwap<OverrideTree>,
    unit: SpeedUnit,
}

impl SpeedResolver {
    pub fn new(unit: SpeedUnit) -> Self {
        Self::with_tree(OverrideTree::default(), unit)
    }

    pub fn with_tree(tree: OverrideTree, unit: SpeedUnit) -> Self {
        Self {
            tree: ArcSwap::from_pointee(tree),
            unit,
        }
    }

    pub fn unit(&self) -> SpeedUnit {
        self.unit
    }

    pub fn resolve(&self, device: &DeviceId, port: u32, reported: Option<u64>) -> ResolvedSpeed {
        self.tree.load().resolve(device, port, reported)
    }

    pub fn tree(&self) -> Arc<OverrideTree> {
        self.tree.load_full()
    }

    pub fn reload(&self, tree: OverrideTree) {
        info!(
            devices = tree.devices.len(),
            global = tree.global.is_some(),
            "speed overrides reloaded"
        );
        self.tree.store(Arc::new(tree));
    }

    /// Parse and swap in a new document. On failure the active tree is left
    /// untouched.
    pub fn reload_json(&self, doc: &Value) -> Result<(), OverrideError> {
        match OverrideTree::from_json(doc, self.unit) {
            Ok(tree) => {
                self.reload(tree);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "rejected speed override reload, keeping previous overrides");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> OverrideTree {
        OverrideTree::from_json(
            &json!({"default": 100, "D1": {"default": 10, "4": 1}}),
            SpeedUnit::BytesPerSec,
        )
        .expect("valid document")
    }

    #[test]
    fn most_specific_level_wins() {
        let tree = sample_tree();
        let d1 = DeviceId::new("D1");
        let d2 = DeviceId::new("D2");

        assert_eq!(tree.resolve(&d1, 4, None).bytes_per_sec, 1.0);
        assert_eq!(tree.resolve(&d1, 4, None).source, SpeedSource::PortOverride);
        assert_eq!(tree.resolve(&d1, 2, None).bytes_per_sec, 10.0);
        assert_eq!(tree.resolve(&d1, 2, None).source, SpeedSource::DeviceDefault);
        assert_eq!(tree.resolve(&d2, 4, Some(50)).bytes_per_sec, 100.0);
        assert_eq!(tree.resolve(&d2, 4, Some(50)).source, SpeedSource::GlobalDefault);
    }

    #[test]
    fn reported_speed_is_used_without_overrides() {
        let tree = OverrideTree::default();
        let d2 = DeviceId::new("D2");
        let resolved = tree.resolve(&d2, 4, Some(50));
        assert_eq!(resolved.bytes_per_sec, 50.0);
        assert_eq!(resolved.source, SpeedSource::Reported);
        assert_eq!(tree.resolve(&d2, 4, Some(0)), ResolvedSpeed::UNKNOWN);
        assert_eq!(tree.resolve(&d2, 4, None), ResolvedSpeed::UNKNOWN);
    }

    #[test]
    fn device_without_default_falls_through_to_global() {
        let tree = OverrideTree::from_json(
            &json!({"default": 7, "D1": {"4": 1}}),
            SpeedUnit::BytesPerSec,
        )
        .expect("valid");
        let d1 = DeviceId::new("D1");
        assert_eq!(tree.resolve(&d1, 3, Some(99)).bytes_per_sec, 7.0);
    }

    #[test]
    fn external_unit_is_converted_once() {
        let tree = OverrideTree::from_json(&json!({"D1": {"4": 10}}), SpeedUnit::Gbps).expect("valid");
        let speed = tree.resolve(&DeviceId::new("D1"), 4, None);
        assert_eq!(speed.bytes_per_sec, 1_250_000_000.0);
    }

    #[test]
    fn malformed_documents_are_rejected_whole() {
        let bad = [
            json!([1, 2]),
            json!({"default": -1}),
            json!({"default": "fast"}),
            json!({"D1": 10}),
            json!({"D1": {"eth0": 1}}),
            json!({"D1": {"default": 10}, "D2": {"4": null}}),
        ];
        for doc in bad {
            assert!(
                OverrideTree::from_json(&doc, SpeedUnit::Gbps).is_err(),
                "document should be rejected: {doc}"
            );
        }
    }

    #[test]
    fn failed_reload_keeps_previous_tree() {
        let resolver = SpeedResolver::with_tree(sample_tree(), SpeedUnit::BytesPerSec);
        let d1 = DeviceId::new("D1");

        let err = resolver
            .reload_json(&json!({"default": 5, "D1": {"4": "oops"}}))
            .expect_err("malformed");
        assert!(matches!(err, OverrideError::Malformed { .. }));
        assert_eq!(resolver.resolve(&d1, 4, None).bytes_per_sec, 1.0);

        resolver.reload_json(&json!({"default": 5})).expect("valid");
        assert_eq!(resolver.resolve(&d1, 4, None).bytes_per_sec, 5.0);
    }

    #[test]
    fn empty_document_is_valid() {
        let tree = OverrideTree::parse("{}", SpeedUnit::Gbps).expect("valid");
        assert!(tree.is_empty());
        assert!(OverrideTree::parse("{", SpeedUnit::Gbps).is_err());
    }
}
