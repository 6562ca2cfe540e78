//! Desired-capabilities matching and provider load balancing.
//!
//! Resolves a WebDriver desiredCapabilities document to the ranked list of
//! platform names that can serve it. The curated capability matrix is
//! consulted first; when it yields nothing, a raw catalog existence check
//! lets requests name platforms outside the matrix (legacy origins).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::platform::PlatformCatalog;

/// Wildcard accepted for platform and version fields.
pub const ANY: &str = "ANY";

/// The subset of a desiredCapabilities document the matcher reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredCapabilities {
    #[serde(default, rename = "browserName")]
    pub browser_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
}

/// One platform entry in the capability matrix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSpec {
    #[serde(default)]
    pub browsers: HashMap<String, String>,
}

/// Capability matrix: platform type ("LINUX") → platform name → browsers.
pub type PlatformMatrix = HashMap<String, HashMap<String, PlatformSpec>>;

fn is_any(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case(ANY)
}

/// Version match rule: exact, or the desired string equals the candidate's
/// major component, or the desired version is ANY/empty.
fn version_matches(desired: &str, candidate: &str) -> bool {
    if is_any(desired) {
        return true;
    }
    if desired == candidate {
        return true;
    }
    candidate.split('.').next() == Some(desired)
}

/// Resolve capabilities against the matrix. The result is sorted for a
/// stable allocation preference.
pub fn get_matched_platforms(caps: &DesiredCapabilities, matrix: &PlatformMatrix) -> Vec<String> {
    // An empty browser with a wildcard platform would match everything;
    // it is an explicit non-match instead.
    if caps.browser_name.is_empty() {
        return Vec::new();
    }

    let mut matched = Vec::new();
    for (platform_type, platforms) in matrix {
        if !is_any(&caps.platform) && !caps.platform.eq_ignore_ascii_case(platform_type) {
            continue;
        }
        for (name, spec) in platforms {
            if let Some(candidate_version) = spec.browsers.get(&caps.browser_name) {
                if version_matches(&caps.version, candidate_version) {
                    matched.push(name.clone());
                }
            }
        }
    }

    matched.sort();
    matched
}

/// Matrix match with the raw-catalog fallback for platform identifiers
/// outside the curated matrix.
pub fn get_matched_platforms_or_fallback(
    caps: &DesiredCapabilities,
    matrix: &PlatformMatrix,
    catalog: &PlatformCatalog,
) -> Vec<String> {
    let matched = get_matched_platforms(caps, matrix);
    if !matched.is_empty() {
        return matched;
    }
    if !is_any(&caps.platform) && catalog.check(&caps.platform) {
        return vec![caps.platform.clone()];
    }
    Vec::new()
}

/// Build the matrix from a live catalog. Every platform this system
/// provisions is a linux image or domain, so they share one type key.
pub fn matrix_from_catalog(catalog: &PlatformCatalog) -> PlatformMatrix {
    let mut platforms = HashMap::new();
    for platform in catalog.platforms() {
        platforms.insert(
            platform.name.clone(),
            PlatformSpec {
                browsers: platform.browsers.clone(),
            },
        );
    }
    HashMap::from([("LINUX".to_string(), platforms)])
}

/// One provider's current utilization, for balancing.
#[derive(Debug, Clone)]
pub struct ProviderUsage {
    pub id: i64,
    /// Currently active sessions on this provider.
    pub active: u32,
    /// Configured max concurrency; 0 means unbounded.
    pub limit: u32,
}

impl ProviderUsage {
    fn ratio(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            f64::from(self.active) / f64::from(self.limit)
        }
    }

    fn saturated(&self) -> bool {
        self.limit > 0 && self.active >= self.limit
    }
}

/// Pick the provider with the lowest active/limit ratio. Providers at
/// their limit are excluded from this round entirely.
pub fn get_provider_id(usages: &[ProviderUsage]) -> Option<i64> {
    usages
        .iter()
        .filter(|usage| !usage.saturated())
        .min_by(|a, b| {
            a.ratio()
                .partial_cmp(&b.ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|usage| usage.id)
}
