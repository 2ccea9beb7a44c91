//! Kubernetes version parsing and comparison.
//!
//! Kubelet and API server versions come with a leading `v` and often a
//! distribution suffix (`v1.29.3-eks-adc7111`, `v1.30.2+k3s1`). Only the
//! major.minor.patch core takes part in comparisons.

use crds::ComparisonOperator;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// major.minor.patch core of a Kubernetes version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KubeVersion {
    /// Major version
    pub major: u64,
    /// Minor version
    pub minor: u64,
    /// Patch version (0 when omitted)
    pub patch: u64,
}

/// Error for strings that are not versions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed version {0:?}")]
pub struct VersionParseError(pub String);

impl FromStr for KubeVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError(s.to_string());
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = trimmed
            .split(['-', '+'])
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(err)?;

        let mut parts = core.split('.');
        let major = parts.next().ok_or_else(err)?.parse::<u64>().map_err(|_| err())?;
        let minor = parts.next().ok_or_else(err)?.parse::<u64>().map_err(|_| err())?;
        let patch = match parts.next() {
            Some(p) => p.parse::<u64>().map_err(|_| err())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self { major, minor, patch })
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Checks `current <op> wanted`.
#[must_use]
pub fn compare(current: KubeVersion, op: ComparisonOperator, wanted: KubeVersion) -> bool {
    let ordering = current.cmp(&wanted);
    match op {
        ComparisonOperator::Equal => ordering == Ordering::Equal,
        ComparisonOperator::NotEqual => ordering != Ordering::Equal,
        ComparisonOperator::GreaterThan => ordering == Ordering::Greater,
        ComparisonOperator::GreaterThanOrEqualTo => ordering != Ordering::Less,
        ComparisonOperator::LessThan => ordering == Ordering::Less,
        ComparisonOperator::LessThanOrEqualTo => ordering != Ordering::Greater,
    }
}
