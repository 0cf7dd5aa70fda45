//! Browser identity rotation.
//!
//! Responsibilities:
//! - Hold a pool of immutable identity profiles (user-agent plus the
//!   companion headers a real browser would send with it).
//! - Serve the next identity per the configured rotation mode
//!   (weighted random or round-robin).
//! - Reject profiles whose headers contradict their device class, and
//!   fall back to a conservative built-in profile when the pool is empty.

use once_cell::sync::Lazy;
use rand::Rng;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// How `next_identity` walks the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Probability proportional to each profile's weight.
    WeightedRandom,
    /// Deterministic cycling in pool order.
    RoundRobin,
}

impl Default for RotationMode {
    fn default() -> Self {
        RotationMode::WeightedRandom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

/// A browser identity: user-agent string plus the headers that have to
/// agree with it. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub user_agent: String,
    pub device: DeviceClass,
    /// Companion headers (Accept, Accept-Language, client hints, ...).
    /// Never contains the User-Agent key itself.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Selection weight for weighted-random mode. Zero or negative
    /// excludes the profile from weighted draws.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl IdentityProfile {
    /// Full header set including User-Agent, ready to stamp on a request.
    pub fn full_headers(&self) -> HashMap<String, String> {
        let mut map = self.headers.clone();
        map.insert("User-Agent".into(), self.user_agent.clone());
        map
    }

    /// Checks that the profile's headers do not contradict its device
    /// class. Returns the first contradiction found.
    pub fn coherence_error(&self) -> Option<String> {
        let ua_is_mobile = looks_mobile(&self.user_agent);
        let class_is_mobile = self.device == DeviceClass::Mobile;
        if ua_is_mobile != class_is_mobile {
            return Some(format!(
                "user-agent '{}' does not match device class {:?}",
                self.user_agent, self.device
            ));
        }

        if let Some(hint) = header_value(&self.headers, "sec-ch-ua-mobile") {
            let expected = if class_is_mobile { "?1" } else { "?0" };
            if hint.trim() != expected {
                return Some(format!(
                    "sec-ch-ua-mobile is '{hint}' but device class is {:?}",
                    self.device
                ));
            }
        }

        if let Some(platform) = header_value(&self.headers, "sec-ch-ua-platform") {
            let platform = platform.trim().trim_matches('"');
            let allowed: &[&str] = if class_is_mobile {
                &["Android", "iOS"]
            } else {
                &["Windows", "macOS", "Linux", "Chrome OS"]
            };
            if !allowed.iter().any(|p| p.eq_ignore_ascii_case(platform)) {
                return Some(format!(
                    "sec-ch-ua-platform '{platform}' is not a {:?} platform",
                    self.device
                ));
            }
        }

        None
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn looks_mobile(user_agent: &str) -> bool {
    const MARKERS: &[&str] = &["Mobile", "Android", "iPhone", "iPad"];
    MARKERS.iter().any(|m| user_agent.contains(m))
}

/// Served when the pool is empty so a request can always go out.
static FALLBACK_PROFILE: Lazy<Arc<IdentityProfile>> = Lazy::new(|| {
    Arc::new(IdentityProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            .into(),
        device: DeviceClass::Desktop,
        headers: common_headers(&[
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"Windows\""),
        ]),
        weight: 1.0,
    })
});

fn common_headers(extra: &[(&str, &str)]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(
        "Accept".into(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
            .into(),
    );
    map.insert("Accept-Language".into(), "en-US,en;q=0.9".into());
    map.insert("Accept-Encoding".into(), "gzip, deflate, br".into());
    map.insert("Upgrade-Insecure-Requests".into(), "1".into());
    for (name, value) in extra {
        map.insert((*name).into(), (*value).into());
    }
    map
}

/// Built-in pool used when the caller supplies no profiles of their own.
/// Weights roughly track real-world browser share.
pub fn default_profiles() -> Vec<IdentityProfile> {
    vec![
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .into(),
            device: DeviceClass::Desktop,
            headers: common_headers(&[
                ("sec-ch-ua-mobile", "?0"),
                ("sec-ch-ua-platform", "\"Windows\""),
            ]),
            weight: 4.0,
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .into(),
            device: DeviceClass::Desktop,
            headers: common_headers(&[
                ("sec-ch-ua-mobile", "?0"),
                ("sec-ch-ua-platform", "\"macOS\""),
            ]),
            weight: 2.0,
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .into(),
            device: DeviceClass::Desktop,
            headers: common_headers(&[
                ("sec-ch-ua-mobile", "?0"),
                ("sec-ch-ua-platform", "\"Linux\""),
            ]),
            weight: 1.0,
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) \
                         Gecko/20100101 Firefox/133.0"
                .into(),
            device: DeviceClass::Desktop,
            headers: common_headers(&[]),
            weight: 1.5,
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                         (KHTML, like Gecko) Version/18.1 Safari/605.1.15"
                .into(),
            device: DeviceClass::Desktop,
            headers: common_headers(&[]),
            weight: 1.5,
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36"
                .into(),
            device: DeviceClass::Mobile,
            headers: common_headers(&[
                ("sec-ch-ua-mobile", "?1"),
                ("sec-ch-ua-platform", "\"Android\""),
            ]),
            weight: 1.0,
        },
        IdentityProfile {
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 18_1 like Mac OS X) \
                         AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 \
                         Mobile/15E148 Safari/604.1"
                .into(),
            device: DeviceClass::Mobile,
            headers: common_headers(&[]),
            weight: 1.0,
        },
    ]
}

/// Serves identities for outgoing requests.
#[derive(Debug)]
pub struct IdentityRotator {
    profiles: Vec<Arc<IdentityProfile>>,
    mode: RotationMode,
    cursor: AtomicUsize,
    serve_counts: Vec<AtomicU64>,
}

impl IdentityRotator {
    /// Builds a rotator over the given profiles, dropping any whose
    /// headers contradict their device class.
    pub fn from_profiles(profiles: Vec<IdentityProfile>, mode: RotationMode) -> Self {
        let mut kept = Vec::with_capacity(profiles.len());
        for profile in profiles {
            match profile.coherence_error() {
                None => kept.push(Arc::new(profile)),
                Some(reason) => {
                    log::warn!("dropping incoherent identity profile: {reason}");
                }
            }
        }
        let serve_counts = kept.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            profiles: kept,
            mode,
            cursor: AtomicUsize::new(0),
            serve_counts,
        }
    }

    /// Rotator over the built-in pool.
    pub fn with_defaults(mode: RotationMode) -> Self {
        Self::from_profiles(default_profiles(), mode)
    }

    /// Loads profiles from a JSON array document.
    pub fn load_json(path: &Path, mode: RotationMode) -> Result<Self, IdentityError> {
        let contents = fs::read_to_string(path).map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let profiles: Vec<IdentityProfile> =
            serde_json::from_str(&contents).map_err(|source| IdentityError::InvalidJson {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_profiles(profiles, mode))
    }

    pub fn mode(&self) -> RotationMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Returns the identity to use for the next request. An empty pool
    /// yields the built-in fallback rather than an error.
    pub fn next_identity(&self) -> Arc<IdentityProfile> {
        if self.profiles.is_empty() {
            return Arc::clone(&FALLBACK_PROFILE);
        }
        let index = match self.mode {
            RotationMode::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.profiles.len()
            }
            RotationMode::WeightedRandom => self.weighted_index(),
        };
        self.serve_counts[index].fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.profiles[index])
    }

    fn weighted_index(&self) -> usize {
        let mut rng = thread_rng();
        let total: f64 = self
            .profiles
            .iter()
            .map(|p| p.weight.max(0.0))
            .sum();
        if total <= 0.0 {
            // Every profile opted out of weighting; draw uniformly.
            return rng.gen_range(0..self.profiles.len());
        }
        let mut point = rng.gen_range(0.0..total);
        for (index, profile) in self.profiles.iter().enumerate() {
            let weight = profile.weight.max(0.0);
            if weight <= 0.0 {
                continue;
            }
            if point < weight {
                return index;
            }
            point -= weight;
        }
        self.profiles.len() - 1
    }

    /// Times each profile has been served, in pool order.
    pub fn serve_counts(&self) -> Vec<(String, u64)> {
        self.profiles
            .iter()
            .zip(&self.serve_counts)
            .map(|(p, count)| (p.user_agent.clone(), count.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for IdentityRotator {
    fn default() -> Self {
        Self::with_defaults(RotationMode::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("I/O error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("identity JSON invalid at {path:?}: {source}")]
    InvalidJson {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn desktop(ua: &str, weight: f64) -> IdentityProfile {
        IdentityProfile {
            user_agent: ua.into(),
            device: DeviceClass::Desktop,
            headers: common_headers(&[]),
            weight,
        }
    }

    #[test]
    fn round_robin_serves_each_profile_exactly_once_per_cycle() {
        let profiles = vec![
            desktop("Agent/1.0", 1.0),
            desktop("Agent/2.0", 1.0),
            desktop("Agent/3.0", 1.0),
            desktop("Agent/4.0", 1.0),
        ];
        let rotator = IdentityRotator::from_profiles(profiles, RotationMode::RoundRobin);

        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(rotator.next_identity().user_agent.clone());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn weighted_mode_prefers_heavier_profiles() {
        let profiles = vec![desktop("Heavy/1.0", 9.0), desktop("Light/1.0", 1.0)];
        let rotator = IdentityRotator::from_profiles(profiles, RotationMode::WeightedRandom);

        let mut heavy = 0;
        for _ in 0..2000 {
            if rotator.next_identity().user_agent.starts_with("Heavy") {
                heavy += 1;
            }
        }
        // Expected ~1800; anything above 1500 is far outside noise.
        assert!(heavy > 1500, "heavy profile served only {heavy}/2000 times");
    }

    #[test]
    fn zero_weight_profiles_are_skipped_in_weighted_mode() {
        let profiles = vec![desktop("Never/1.0", 0.0), desktop("Always/1.0", 1.0)];
        let rotator = IdentityRotator::from_profiles(profiles, RotationMode::WeightedRandom);
        for _ in 0..200 {
            assert_eq!(rotator.next_identity().user_agent, "Always/1.0");
        }
    }

    #[test]
    fn empty_pool_serves_the_fallback_profile() {
        let rotator = IdentityRotator::from_profiles(Vec::new(), RotationMode::WeightedRandom);
        let identity = rotator.next_identity();
        assert!(identity.user_agent.contains("Chrome"));
        assert!(identity.full_headers().contains_key("User-Agent"));
    }

    #[test]
    fn incoherent_profiles_are_rejected_at_load() {
        let mut bad_hint = common_headers(&[("sec-ch-ua-mobile", "?0")]);
        bad_hint.insert("sec-ch-ua-platform".into(), "\"Windows\"".into());
        let profiles = vec![
            IdentityProfile {
                // Mobile UA claiming a desktop device class.
                user_agent: "Mozilla/5.0 (Linux; Android 14) Mobile Safari/537.36".into(),
                device: DeviceClass::Desktop,
                headers: common_headers(&[]),
                weight: 1.0,
            },
            IdentityProfile {
                // Mobile device class with desktop client hints.
                user_agent: "Mozilla/5.0 (Linux; Android 14; Pixel 8) Chrome/131.0.0.0 \
                             Mobile Safari/537.36"
                    .into(),
                device: DeviceClass::Mobile,
                headers: bad_hint,
                weight: 1.0,
            },
        ];
        let rotator = IdentityRotator::from_profiles(profiles, RotationMode::RoundRobin);
        assert!(rotator.is_empty());
    }

    #[test]
    fn default_pool_is_coherent() {
        for profile in default_profiles() {
            assert_eq!(profile.coherence_error(), None, "{}", profile.user_agent);
        }
    }

    #[test]
    fn mobile_identity_carries_mobile_hints_only() {
        let rotator = IdentityRotator::with_defaults(RotationMode::RoundRobin);
        for _ in 0..rotator.len() {
            let identity = rotator.next_identity();
            let headers = identity.full_headers();
            if identity.device == DeviceClass::Mobile {
                if let Some(hint) = headers.get("sec-ch-ua-mobile") {
                    assert_eq!(hint, "?1");
                }
            }
        }
    }
}
