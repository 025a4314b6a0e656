//! # Decision Function
//!
//! Maps raw classifier output to a calibrated probability and a discrete label.
//!
//! ## Output conventions:
//! Each classifier variant is tagged with exactly one convention, so the sigmoid
//! path and the argmax path are never mixed for the same model.
//! - **Sigmoid**: one logit; `p = 1 / (1 + e^-x)`, high class iff `p > threshold`
//! - **Softmax**: two logits; softmax then argmax, ties resolve to the low class.
//!   This is the fixed threshold 0.5, and config validation rejects any other value
//!
//! In both conventions the reported probability is that of the high-side class
//! (index 1), so it is monotonic non-decreasing in the raw score. A probability
//! exactly at the threshold always resolves to the low-side class (index 0).

use crate::error::{ClassifierError, ClassifierResult};
use serde::{Deserialize, Serialize};

/// How a classifier's raw output should be calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputConvention {
    Sigmoid,
    Softmax,
}

impl OutputConvention {
    /// Number of raw scores the convention consumes.
    pub fn expected_output_size(&self) -> usize {
        match self {
            OutputConvention::Sigmoid => 1,
            OutputConvention::Softmax => 2,
        }
    }
}

/// Discrete result of one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// 0 for the low-side class, 1 for the high-side class
    pub class_index: usize,
    pub label: String,
    /// Probability of the high-side class, in [0, 1]
    pub probability: f32,
}

/// Probability-to-label mapping for one classifier variant.
#[derive(Debug, Clone)]
pub struct DecisionFunction {
    convention: OutputConvention,
    threshold: f32,
    labels: [String; 2],
}

impl DecisionFunction {
    /// `labels` must hold the low-side class first; missing names fall back to
    /// "class_0" / "class_1".
    pub fn new(convention: OutputConvention, threshold: f32, labels: Vec<String>) -> Self {
        let mut labels = labels.into_iter();
        let low = labels.next().unwrap_or_else(|| "class_0".to_string());
        let high = labels.next().unwrap_or_else(|| "class_1".to_string());
        Self {
            convention,
            threshold,
            labels: [low, high],
        }
    }

    pub fn convention(&self) -> OutputConvention {
        self.convention
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn labels(&self) -> &[String; 2] {
        &self.labels
    }

    /// Calibrate `scores` and pick a label.
    pub fn decide(&self, scores: &[f32]) -> ClassifierResult<Decision> {
        let expected = self.convention.expected_output_size();
        if scores.len() != expected {
            return Err(ClassifierError::Shape {
                expected: format!("{} score(s) for {:?}", expected, self.convention),
                actual: format!("{} score(s)", scores.len()),
            });
        }
        if scores.iter().any(|s| s.is_nan()) {
            return Err(ClassifierError::Numeric(format!("NaN in raw scores {:?}", scores)));
        }

        let (class_index, probability) = match self.convention {
            OutputConvention::Sigmoid => {
                let probability = sigmoid(scores[0]);
                (usize::from(probability > self.threshold), probability)
            }
            OutputConvention::Softmax => {
                let probabilities = softmax2(scores[0], scores[1]);
                (usize::from(probabilities[1] > probabilities[0]), probabilities[1])
            }
        };

        Ok(Decision {
            class_index,
            label: self.labels[class_index].clone(),
            probability,
        })
    }
}

/// Logistic function, stable for large magnitudes.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn softmax2(a: f32, b: f32) -> [f32; 2] {
    let max = a.max(b);
    let ea = (a - max).exp();
    let eb = (b - max).exp();
    let sum = ea + eb;
    [ea / sum, eb / sum]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gender(convention: OutputConvention) -> DecisionFunction {
        DecisionFunction::new(convention, 0.5, vec!["female".into(), "male".into()])
    }

    #[test]
    fn test_zero_score_is_half_and_low_side() {
        let decision = gender(OutputConvention::Sigmoid).decide(&[0.0]).unwrap();
        assert_eq!(decision.probability, 0.5);
        assert_eq!(decision.class_index, 0);
        assert_eq!(decision.label, "female");
    }

    #[test]
    fn test_label_flips_just_above_threshold() {
        let decide = gender(OutputConvention::Sigmoid);
        assert_eq!(decide.decide(&[1e-3]).unwrap().label, "male");
        assert_eq!(decide.decide(&[-1e-3]).unwrap().label, "female");
    }

    #[test]
    fn test_custom_threshold() {
        let decide = DecisionFunction::new(OutputConvention::Sigmoid, 0.8, vec!["a".into(), "b".into()]);
        // sigmoid(1.0) ~ 0.731
        assert_eq!(decide.decide(&[1.0]).unwrap().class_index, 0);
        // sigmoid(2.0) ~ 0.881
        assert_eq!(decide.decide(&[2.0]).unwrap().class_index, 1);
    }

    #[test]
    fn test_probability_monotonic_in_score() {
        let decide = gender(OutputConvention::Sigmoid);
        let mut previous = 0.0f32;
        for step in -200..=200 {
            let p = decide.decide(&[step as f32 * 0.25]).unwrap().probability;
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous);
            previous = p;
        }
    }

    #[test]
    fn test_sigmoid_extremes_are_finite() {
        assert_eq!(sigmoid(1000.0), 1.0);
        assert_eq!(sigmoid(-1000.0), 0.0);
    }

    #[test]
    fn test_softmax_argmax() {
        let decide = gender(OutputConvention::Softmax);

        let male = decide.decide(&[0.1, 2.0]).unwrap();
        assert_eq!(male.label, "male");
        assert!(male.probability > 0.5);

        let female = decide.decide(&[3.0, -1.0]).unwrap();
        assert_eq!(female.label, "female");
        assert!(female.probability < 0.5);
    }

    #[test]
    fn test_softmax_tie_goes_low() {
        let decision = gender(OutputConvention::Softmax).decide(&[0.7, 0.7]).unwrap();
        assert_eq!(decision.class_index, 0);
        assert_eq!(decision.probability, 0.5);
    }

    #[test]
    fn test_wrong_score_count_is_shape_error() {
        assert!(matches!(
            gender(OutputConvention::Sigmoid).decide(&[0.0, 1.0]),
            Err(ClassifierError::Shape { .. })
        ));
        assert!(matches!(
            gender(OutputConvention::Softmax).decide(&[0.0]),
            Err(ClassifierError::Shape { .. })
        ));
    }

    #[test]
    fn test_nan_is_numeric_error() {
        assert!(matches!(
            gender(OutputConvention::Sigmoid).decide(&[f32::NAN]),
            Err(ClassifierError::Numeric(_))
        ));
    }
}
