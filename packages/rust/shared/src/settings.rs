//! Immutable per-pipeline settings handed to transforms at construction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tolerances and quality-score tables used by transforms.
///
/// Builders hold this behind an `Arc` and never mutate it, so two pipelines
/// running side by side with different settings cannot interfere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Absolute tolerance used for fields with no entry in `tolerances`.
    #[serde(default = "default_tolerance")]
    pub default_tolerance: f64,

    /// Per-field absolute tolerances for numeric comparisons.
    #[serde(default)]
    pub tolerances: BTreeMap<String, f64>,

    /// Ranking of calculation kinds (higher wins) when picking a representative.
    #[serde(default)]
    pub quality_scores: BTreeMap<String, i64>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            default_tolerance: default_tolerance(),
            tolerances: BTreeMap::new(),
            quality_scores: BTreeMap::new(),
        }
    }
}

fn default_tolerance() -> f64 {
    1e-6
}

impl BuildSettings {
    /// Tolerance for `field`, falling back to `default_tolerance`.
    pub fn tolerance(&self, field: &str) -> f64 {
        self.tolerances
            .get(field)
            .copied()
            .unwrap_or(self.default_tolerance)
    }

    /// Quality score for a calculation kind; unknown kinds score 0.
    pub fn quality_score(&self, kind: &str) -> i64 {
        self.quality_scores.get(kind).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_fallback() {
        let mut settings = BuildSettings::default();
        settings.tolerances.insert("volume".into(), 0.05);
        assert_eq!(settings.tolerance("volume"), 0.05);
        assert_eq!(settings.tolerance("energy"), 1e-6);
    }

    #[test]
    fn parses_from_toml() {
        let settings: BuildSettings = toml::from_str(
            r#"
default_tolerance = 0.01

[tolerances]
energy_per_atom = 0.002

[quality_scores]
"r2SCAN" = 3
"GGA+U" = 2
GGA = 1
"#,
        )
        .expect("parse settings");
        assert_eq!(settings.tolerance("energy_per_atom"), 0.002);
        assert_eq!(settings.tolerance("volume"), 0.01);
        assert_eq!(settings.quality_score("r2SCAN"), 3);
        assert_eq!(settings.quality_score("PBEsol"), 0);
    }
}
