//! Feature ranking, fault signatures and the fault-vs-normal comparison text

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;

use super::window::SlidingWindow;
use crate::baseline::BaselineStats;
use crate::types::FeatureContribution;

/// Top `k` features by `|latest - window mean|`, largest first.
///
/// Ties break on feature name so the ranking is deterministic.
pub fn top_contributors(window: &SlidingWindow, k: usize) -> Vec<FeatureContribution> {
    let Some(latest) = window.latest() else {
        return Vec::new();
    };
    let means = window.feature_means();

    let mut ranked: Vec<FeatureContribution> = latest
        .features
        .iter()
        .map(|(name, &value)| {
            let mean = means.get(name).copied().unwrap_or(value);
            FeatureContribution {
                name: name.clone(),
                latest: value,
                window_mean: mean,
                deviation: value - mean,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.deviation
            .abs()
            .total_cmp(&a.deviation.abs())
            .then_with(|| a.name.cmp(&b.name))
    });
    ranked.truncate(k);
    ranked
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|`. Two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Identity of a fault signature: the set of top-contributing feature names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureFingerprint {
    names: BTreeSet<String>,
    digest: String,
}

impl FeatureFingerprint {
    pub fn from_contributions(top: &[FeatureContribution]) -> Self {
        let names: BTreeSet<String> = top.iter().map(|f| f.name.clone()).collect();
        let joined = names.iter().cloned().collect::<Vec<_>>().join("|");
        let digest = format!("{:x}", md5::compute(joined.as_bytes()));
        Self { names, digest }
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    /// Hex MD5 over the sorted names; equal sets give equal digests.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn similarity(&self, other: &FeatureFingerprint) -> f64 {
        if self.digest == other.digest {
            return 1.0;
        }
        jaccard(&self.names, &other.names)
    }
}

/// Render the comparison block handed to every backend.
///
/// ```text
/// Top 6 Contributing Features (Fault vs Normal):
/// 1. Reactor Pressure: Fault=2805.1000 | Normal=2705.0000 | Δ=+100.1000 (+3.7%) | z=+13.35
/// ```
pub fn comparison_text(top: &[FeatureContribution], baseline: Option<&BaselineStats>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Top {} Contributing Features (Fault vs Normal):",
        top.len()
    );

    for (i, f) in top.iter().enumerate() {
        let rank = i + 1;
        match baseline.and_then(|b| b.get(&f.name)) {
            Some(stats) => {
                let delta = f.latest - stats.mean;
                let pct = if stats.mean.abs() > f64::EPSILON {
                    format!("{:+.1}%", delta / stats.mean.abs() * 100.0)
                } else {
                    "n/a".to_string()
                };
                let z = stats
                    .z_score(f.latest)
                    .map_or_else(|| "n/a".to_string(), |z| format!("{z:+.2}"));
                let _ = writeln!(
                    out,
                    "{rank}. {}: Fault={:.4} | Normal={:.4} | Δ={:+.4} ({pct}) | z={z}",
                    f.name, f.latest, stats.mean, delta
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "{rank}. {}: Fault={:.4} | Normal=NA (baseline not loaded) | window mean={:.4}",
                    f.name, f.latest, f.window_mean
                );
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregatedRow, DetectorVerdict, SensorRow};
    use std::sync::Arc;

    fn push(window: &mut SlidingWindow, seq: u64, values: &[(&str, f64)]) {
        let features: SensorRow = values.iter().map(|(k, v)| ((*k).to_string(), *v)).collect();
        window.push(Arc::new(AggregatedRow::new(
            seq,
            features,
            DetectorVerdict { score: 0.0, is_anomaly: true, threshold: 1.0 },
        )));
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_top_contributors_rank_by_absolute_deviation() {
        let mut w = SlidingWindow::new(10);
        push(&mut w, 1, &[("a", 0.0), ("b", 0.0), ("c", 0.0)]);
        push(&mut w, 2, &[("a", 10.0), ("b", -20.0), ("c", 1.0)]);
        let top = top_contributors(&w, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].name, "b");
        assert_eq!(top[0].deviation, -10.0);
        assert_eq!(top[1].name, "a");
    }

    #[test]
    fn test_top_contributors_ties_break_by_name() {
        let mut w = SlidingWindow::new(4);
        push(&mut w, 1, &[("z", 1.0), ("y", 1.0)]);
        let top = top_contributors(&w, 2);
        assert_eq!(top[0].name, "y");
        assert_eq!(top[1].name, "z");
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["a", "b"])), 1.0);
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["c", "d"])), 0.0);
        assert!((jaccard(&set(&["a", "b", "c"]), &set(&["a", "b", "d"])) - 0.5).abs() < 1e-9);
        assert_eq!(jaccard(&set(&[]), &set(&[])), 1.0);
    }

    #[test]
    fn test_fingerprint_digest_ignores_order() {
        let f = |n: &str| FeatureContribution {
            name: n.to_string(),
            latest: 0.0,
            window_mean: 0.0,
            deviation: 0.0,
        };
        let a = FeatureFingerprint::from_contributions(&[f("T"), f("P")]);
        let b = FeatureFingerprint::from_contributions(&[f("P"), f("T")]);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 32);
        assert_eq!(a.similarity(&b), 1.0);
    }

    #[test]
    fn test_comparison_text_with_baseline() {
        let baseline = BaselineStats::from_pairs([("Reactor Pressure", 2700.0, 10.0)]);
        let top = vec![FeatureContribution {
            name: "Reactor Pressure".to_string(),
            latest: 2800.0,
            window_mean: 2750.0,
            deviation: 50.0,
        }];
        let text = comparison_text(&top, Some(&baseline));
        assert!(text.starts_with("Top 1 Contributing Features (Fault vs Normal):"));
        assert!(text.contains("Fault=2800.0000 | Normal=2700.0000"));
        assert!(text.contains("z=+10.00"));
    }

    #[test]
    fn test_comparison_text_without_baseline() {
        let top = vec![FeatureContribution {
            name: "x".to_string(),
            latest: 1.0,
            window_mean: 0.5,
            deviation: 0.5,
        }];
        let text = comparison_text(&top, None);
        assert!(text.contains("Normal=NA (baseline not loaded)"));
    }
}
