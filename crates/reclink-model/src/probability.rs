//! Probabilities, Bayes factors and the closed-form parameter defaults.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Value substituted for a level that was never observed during training.
pub const NOT_OBSERVED_EPSILON: f64 = 1e-6;

/// Serialised marker for [`Probability::NotObserved`].
pub const LEVEL_NOT_OBSERVED_TEXT: &str = "level not observed";

/// An m or u probability as held by a comparison level.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Probability {
    /// Nothing set; the closed-form default for the level's position applies.
    #[default]
    Unset,
    /// Training never saw the level; reads as [`NOT_OBSERVED_EPSILON`].
    NotObserved,
    Fixed(f64),
}

impl Probability {
    pub fn is_unset(&self) -> bool {
        matches!(self, Probability::Unset)
    }

    /// The numeric value, if the probability is not unset.
    pub fn value(&self) -> Option<f64> {
        match self {
            Probability::Fixed(v) => Some(*v),
            Probability::NotObserved => Some(NOT_OBSERVED_EPSILON),
            Probability::Unset => None,
        }
    }

    /// The value only when it was actually estimated or configured.
    pub fn fixed(&self) -> Option<f64> {
        match self {
            Probability::Fixed(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probability::Fixed(v) => write!(f, "{v}"),
            Probability::NotObserved => f.write_str(LEVEL_NOT_OBSERVED_TEXT),
            Probability::Unset => f.write_str("unset"),
        }
    }
}

impl Serialize for Probability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Probability::Fixed(v) => serializer.serialize_f64(*v),
            Probability::NotObserved => serializer.serialize_str(LEVEL_NOT_OBSERVED_TEXT),
            Probability::Unset => serializer.serialize_none(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawProbability {
    Value(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Probability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<RawProbability>::deserialize(deserializer)? {
            None => Ok(Probability::Unset),
            Some(RawProbability::Value(v)) => Ok(Probability::Fixed(v)),
            Some(RawProbability::Text(text)) if text.eq_ignore_ascii_case(LEVEL_NOT_OBSERVED_TEXT) => {
                Ok(Probability::NotObserved)
            }
            Some(RawProbability::Text(text)) => Err(D::Error::custom(format!(
                "expected a probability or \"{LEVEL_NOT_OBSERVED_TEXT}\", got \"{text}\""
            ))),
        }
    }
}

/// Which of the two Fellegi-Sunter parameters a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbabilityKind {
    M,
    U,
}

impl fmt::Display for ProbabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbabilityKind::M => f.write_str("m"),
            ProbabilityKind::U => f.write_str("u"),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

pub fn prob_to_bayes_factor(p: f64) -> f64 {
    if p >= 1.0 {
        f64::INFINITY
    } else {
        p / (1.0 - p)
    }
}

pub fn bayes_factor_to_prob(bf: f64) -> f64 {
    if bf.is_infinite() {
        1.0
    } else {
        bf / (1.0 + bf)
    }
}

pub fn match_weight_to_bayes_factor(weight: f64) -> f64 {
    2f64.powf(weight)
}

/// log2 odds of `p`; `None` outside the open interval (0, 1).
pub fn prob_to_match_weight(p: f64) -> Option<f64> {
    (p > 0.0 && p < 1.0).then(|| prob_to_bayes_factor(p).log2())
}

/// `num` evenly spaced values from `start` to `end` inclusive.
pub fn interpolate(start: f64, end: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Default m probabilities indexed by comparison vector value.
///
/// The highest value (the first declared, most discriminating level) gets
/// 0.95; the remaining 0.05 is split evenly over the other levels.
pub fn default_m_values(num_levels: usize) -> Vec<f64> {
    match num_levels {
        0 => Vec::new(),
        1 => vec![1.0],
        n => {
            let mut values = vec![0.05 / (n - 1) as f64; n - 1];
            values.push(0.95);
            values
        }
    }
}

/// Default u probabilities indexed by comparison vector value.
///
/// Derived from the m defaults through match-weight anchors running from -5
/// to 3 over the non-final levels and 10 on the final one.
pub fn default_u_values(num_levels: usize) -> Vec<f64> {
    if num_levels < 2 {
        return default_m_values(num_levels);
    }
    let mut weights = if num_levels == 2 {
        vec![-5.0]
    } else {
        interpolate(-5.0, 3.0, num_levels - 1)
    };
    weights.push(10.0);
    default_m_values(num_levels)
        .into_iter()
        .zip(weights)
        .map(|(m, w)| m / match_weight_to_bayes_factor(w))
        .collect()
}

/// Render a float as a SQL numeric literal that round-trips exactly.
pub fn float_literal(value: f64) -> String {
    format!("{value:?}")
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
