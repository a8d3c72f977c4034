use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::StatsKind;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub reply_timeout: Duration,
    /// How long a disconnected device stays `disconnected` before it is retired.
    pub retire_after: Duration,
    pub kinds: Vec<StatsKind>,
    pub inbox_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(5),
            retire_after: Duration::from_secs(300),
            kinds: StatsKind::ALL.to_vec(),
            inbox_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consolidation {
    Average,
    Maximum,
}

impl fmt::Display for Consolidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consolidation::Average => f.write_str("avg"),
            Consolidation::Maximum => f.write_str("max"),
        }
    }
}

/// One resolution tier: a ring of `capacity` points spaced `spacing_secs` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub spacing_secs: u64,
    pub capacity: usize,
    pub consolidation: Consolidation,
}

impl TierConfig {
    pub fn new(spacing_secs: u64, capacity: usize, consolidation: Consolidation) -> Self {
        Self {
            spacing_secs,
            capacity,
            consolidation,
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.spacing_secs.saturating_mul(self.capacity as u64))
    }
}

impl fmt::Display for TierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.spacing_secs, self.capacity, self.consolidation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("tier '{0}' must look like spacing:capacity:avg|max")]
    Syntax(String),
    #[error("at least one tier is required")]
    NoTiers,
    #[error("tier {index} has zero spacing or capacity")]
    Empty { index: usize },
    #[error("tier {index} spacing {spacing}s is not coarser than the tier before it")]
    NotIncreasing { index: usize, spacing: u64 },
}

impl FromStr for TierConfig {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || LayoutError::Syntax(s.to_string());
        let mut parts = s.split(':');
        let spacing_secs = parts
            .next()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(syntax)?;
        let capacity = parts
            .next()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(syntax)?;
        let consolidation = match parts.next().map(str::trim) {
            None | Some("avg") | Some("average") => Consolidation::Average,
            Some("max") | Some("maximum") => Consolidation::Maximum,
            Some(_) => return Err(syntax()),
        };
        if parts.next().is_some() {
            return Err(syntax());
        }
        Ok(Self::new(spacing_secs, capacity, consolidation))
    }
}

/// Tier layout shared by every series. The first tier is the raw tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub tiers: Vec<TierConfig>,
}

impl StoreConfig {
    pub fn new(tiers: Vec<TierConfig>) -> Result<Self, LayoutError> {
        let config = Self { tiers };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.tiers.is_empty() {
            return Err(LayoutError::NoTiers);
        }
        let mut previous = 0;
        for (index, tier) in self.tiers.iter().enumerate() {
            if tier.spacing_secs == 0 || tier.capacity == 0 {
                return Err(LayoutError::Empty { index });
            }
            if tier.spacing_secs <= previous {
                return Err(LayoutError::NotIncreasing {
                    index,
                    spacing: tier.spacing_secs,
                });
            }
            previous = tier.spacing_secs;
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                // 10s for the past hour
                TierConfig::new(10, 360, Consolidation::Average),
                // 1m for the past day
                TierConfig::new(60, 1440, Consolidation::Average),
                // 1h for the past month
                TierConfig::new(3600, 720, Consolidation::Average),
                // 1d for the past year
                TierConfig::new(86_400, 365, Consolidation::Maximum),
            ],
        }
    }
}

/// How the rate engine treats a counter that went backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Count from zero: the current value is the delta since the reset.
    #[default]
    AssumeZero,
    /// Emit no sample for the interval and re-baseline on the new value.
    Discard,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RateConfig {
    pub reset_policy: ResetPolicy,
}

/// Unit used by the external override document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnit {
    #[default]
    Gbps,
    Mbps,
    Bps,
    BytesPerSec,
}

impl SpeedUnit {
    pub fn to_bytes_per_sec(self, value: f64) -> f64 {
        match self {
            SpeedUnit::Gbps => value * 1e9 / 8.0,
            SpeedUnit::Mbps => value * 1e6 / 8.0,
            SpeedUnit::Bps => value / 8.0,
            SpeedUnit::BytesPerSec => value,
        }
    }

    pub fn from_bytes_per_sec(self, value: f64) -> f64 {
        match self {
            SpeedUnit::Gbps => value * 8.0 / 1e9,
            SpeedUnit::Mbps => value * 8.0 / 1e6,
            SpeedUnit::Bps => value * 8.0,
            SpeedUnit::BytesPerSec => value,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsConfig {
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub rate: RateConfig,
    pub speed_unit: SpeedUnit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        assert_eq!(StoreConfig::default().validate(), Ok(()));
    }

    #[test]
    fn tier_parses_from_flag_syntax() {
        let tier: TierConfig = "60:1440:max".parse().expect("parse");
        assert_eq!(tier, TierConfig::new(60, 1440, Consolidation::Maximum));
        let tier: TierConfig = "10:6".parse().expect("parse");
        assert_eq!(tier.consolidation, Consolidation::Average);
        assert!("10".parse::<TierConfig>().is_err());
        assert!("10:6:median".parse::<TierConfig>().is_err());
    }

    #[test]
    fn layout_rejects_non_increasing_spacing() {
        let err = StoreConfig::new(vec![
            TierConfig::new(60, 10, Consolidation::Average),
            TierConfig::new(60, 10, Consolidation::Average),
        ])
        .expect_err("duplicate spacing");
        assert_eq!(err, LayoutError::NotIncreasing { index: 1, spacing: 60 });
        assert_eq!(StoreConfig::new(Vec::new()), Err(LayoutError::NoTiers));
    }

    #[test]
    fn gbps_converts_to_bytes() {
        assert_eq!(SpeedUnit::Gbps.to_bytes_per_sec(1.0), 125_000_000.0);
        assert_eq!(SpeedUnit::Gbps.from_bytes_per_sec(125_000_000.0), 1.0);
    }
}
