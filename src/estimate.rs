//! Lineage proportion estimation and presence testing

use crate::{
    signature::LineageSignature, tally::Tally, EstimatorConfig, Mutation, VocError, VocResult,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Mutation counts and coverage for one sample
#[derive(Debug, Clone)]
pub struct SampleCounts {
    pub sample_id: String,
    pub tally: Tally,
}

impl SampleCounts {
    pub fn new(sample_id: impl Into<String>, tally: Tally) -> Self {
        Self {
            sample_id: sample_id.into(),
            tally,
        }
    }
}

/// Outcome of the presence test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    RejectNull,
    FailToReject,
}

/// Binomial evidence contributed by one defining mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvidence {
    pub mutation: Mutation,
    pub count: u32,
    pub coverage: u32,
    pub weight: f64,
}

/// Proportion estimate for one (sample, lineage) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEstimate {
    pub lineage: String,
    pub sample_id: String,
    pub point_estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub p_value: f64,
    pub null_value: f64,
    pub confidence_level: f64,
    pub test_result: TestResult,
    pub per_mutation_counts: Vec<MutationEvidence>,
}

/// Result of fitting the shared-proportion binomial model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinomialFit {
    pub p_hat: f64,
    /// Logit of `p_hat`
    pub eta: f64,
    /// Standard error of `eta`
    pub std_error: f64,
    pub iterations: usize,
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn inv_logit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

/// Validate estimator configuration parameters
pub fn validate_estimator_config(config: &EstimatorConfig) -> VocResult<()> {
    if config.null_value <= 0.0 || config.null_value >= 1.0 {
        return Err(VocError::InvalidConfig(
            "null_value must be strictly between 0 and 1".to_string(),
        ));
    }

    if config.confidence_level <= 0.0 || config.confidence_level >= 1.0 {
        return Err(VocError::InvalidConfig(
            "confidence_level must be strictly between 0 and 1".to_string(),
        ));
    }

    if config.max_iterations == 0 {
        return Err(VocError::InvalidConfig(
            "max_iterations must be positive".to_string(),
        ));
    }

    if config.tolerance <= 0.0 {
        return Err(VocError::InvalidConfig(
            "tolerance must be positive".to_string(),
        ));
    }

    Ok(())
}

/// Pair each defining mutation with its count and coverage in the sample.
/// The weight is the mutation's presence fraction in the target lineage.
///
/// A mutation counted more often than its position is covered makes the
/// tally inconsistent and is an error.
pub fn gather_evidence(
    tally: &Tally,
    signature: &LineageSignature,
) -> VocResult<Vec<MutationEvidence>> {
    signature
        .entries
        .iter()
        .map(|entry| {
            let coverage = tally.coverage_of(&entry.mutation);
            let count = tally.counts.count(&entry.mutation);
            if count > coverage {
                return Err(VocError::InvalidRecord(format!(
                    "Count {} exceeds coverage {} for {}",
                    count, coverage, entry.mutation
                )));
            }
            Ok(MutationEvidence {
                mutation: entry.mutation.clone(),
                count,
                coverage,
                weight: entry.target_fraction.clamp(0.0, 1.0),
            })
        })
        .collect()
}

/// Fit an intercept-only binomial GLM with logit link by iteratively
/// reweighted least squares. Every trial shares the single proportion; each
/// contributes its log-likelihood scaled by its prior weight.
pub fn fit_shared_proportion(
    evidence: &[MutationEvidence],
    config: &EstimatorConfig,
) -> VocResult<BinomialFit> {
    let successes: f64 = evidence.iter().map(|e| e.weight * e.count as f64).sum();
    let trials: f64 = evidence.iter().map(|e| e.weight * e.coverage as f64).sum();

    if trials <= 0.0 {
        return Err(VocError::NumericalFitFailure(
            "no weighted trials to fit".to_string(),
        ));
    }
    if successes <= 0.0 {
        return Err(VocError::NumericalFitFailure(
            "all defining mutation counts are zero, estimate is on the boundary".to_string(),
        ));
    }
    if successes >= trials {
        return Err(VocError::NumericalFitFailure(
            "all defining mutations are at full coverage, estimate is on the boundary".to_string(),
        ));
    }

    // Start from a shrunken proportion so the first step is finite
    let mut eta = logit((successes + 0.5) / (trials + 1.0));

    for iteration in 1..=config.max_iterations {
        let mu = inv_logit(eta);
        let mut score = 0.0;
        let mut information = 0.0;
        for e in evidence {
            let n = e.coverage as f64;
            score += e.weight * (e.count as f64 - n * mu);
            information += e.weight * n * mu * (1.0 - mu);
        }

        if !(information.is_finite() && information > 0.0) {
            return Err(VocError::NumericalFitFailure(format!(
                "Fisher information degenerate at iteration {}",
                iteration
            )));
        }

        let step = score / information;
        eta += step;

        if !eta.is_finite() || eta.abs() > 30.0 {
            return Err(VocError::NumericalFitFailure(format!(
                "logit estimate diverged at iteration {}",
                iteration
            )));
        }

        if step.abs() < config.tolerance {
            let mu = inv_logit(eta);
            let information: f64 = evidence
                .iter()
                .map(|e| e.weight * e.coverage as f64 * mu * (1.0 - mu))
                .sum();
            log::debug!("Binomial fit converged after {} iterations", iteration);
            return Ok(BinomialFit {
                p_hat: mu,
                eta,
                std_error: 1.0 / information.sqrt(),
                iterations: iteration,
            });
        }
    }

    Err(VocError::NumericalFitFailure(format!(
        "no convergence after {} iterations",
        config.max_iterations
    )))
}

/// Estimate the proportion of a sample's reads carrying a lineage signature
pub fn estimate_proportion(
    sample: &SampleCounts,
    signature: &LineageSignature,
    config: &EstimatorConfig,
) -> VocResult<SampleEstimate> {
    signature.ensure_not_empty()?;

    let evidence = gather_evidence(&sample.tally, signature)?;
    let weighted_coverage: f64 = evidence.iter().map(|e| e.weight * e.coverage as f64).sum();
    if weighted_coverage <= 0.0 {
        return Err(VocError::UndefinedEstimate {
            sample: sample.sample_id.clone(),
            lineage: signature.lineage.clone(),
        });
    }

    let fit = fit_shared_proportion(&evidence, config)?;

    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| VocError::InvalidConfig(format!("standard normal: {}", e)))?;
    let z = normal.inverse_cdf(1.0 - (1.0 - config.confidence_level) / 2.0);

    let ci_lower = inv_logit(fit.eta - z * fit.std_error);
    let ci_upper = inv_logit(fit.eta + z * fit.std_error);

    let wald = (fit.eta - logit(config.null_value)) / fit.std_error;
    let p_value = (2.0 * (1.0 - normal.cdf(wald.abs()))).clamp(0.0, 1.0);

    let test_result = if config.null_value < ci_lower || config.null_value > ci_upper {
        TestResult::RejectNull
    } else {
        TestResult::FailToReject
    };

    log::debug!(
        "{} / {}: estimate {:.4} [{:.4}, {:.4}] {:?}",
        sample.sample_id,
        signature.lineage,
        fit.p_hat,
        ci_lower,
        ci_upper,
        test_result
    );

    Ok(SampleEstimate {
        lineage: signature.lineage.clone(),
        sample_id: sample.sample_id.clone(),
        point_estimate: fit.p_hat,
        ci_lower,
        ci_upper,
        p_value,
        null_value: config.null_value,
        confidence_level: config.confidence_level,
        test_result,
        per_mutation_counts: evidence,
    })
}

/// Estimate for one (sample, lineage) pair, successful or not
#[derive(Debug)]
pub struct PairOutcome {
    pub sample_id: String,
    pub lineage: String,
    pub result: VocResult<SampleEstimate>,
}

/// Estimate every (sample, lineage) pair in parallel. A failing pair is
/// reported in its outcome and does not affect the others.
pub fn estimate_batch(
    samples: &[SampleCounts],
    signatures: &[LineageSignature],
    config: &EstimatorConfig,
) -> Vec<PairOutcome> {
    let pairs: Vec<(&SampleCounts, &LineageSignature)> = samples
        .iter()
        .flat_map(|s| signatures.iter().map(move |sig| (s, sig)))
        .collect();

    pairs
        .into_par_iter()
        .map(|(sample, signature)| {
            let result = estimate_proportion(sample, signature, config);
            if let Err(e) = &result {
                log::warn!(
                    "No estimate for sample {} lineage {}: {}",
                    sample.sample_id,
                    signature.lineage,
                    e
                );
            }
            PairOutcome {
                sample_id: sample.sample_id.clone(),
                lineage: signature.lineage.clone(),
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureEntry;
    use crate::tally::{CoverageVector, MutationCountTable};
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;

    const GENOME_LEN: u32 = 100;

    fn signature(entries: &[(Mutation, f64)]) -> LineageSignature {
        LineageSignature::new(
            "B.1.617.2",
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            entries
                .iter()
                .map(|(m, target)| SignatureEntry {
                    mutation: m.clone(),
                    target_fraction: *target,
                    background_fraction: 0.0,
                })
                .collect(),
        )
    }

    /// Sample with the given (mutation, count, coverage) observations
    fn sample(observations: &[(Mutation, u32, u32)]) -> SampleCounts {
        let mut depths = vec![0; GENOME_LEN as usize];
        let mut counts = MutationCountTable::new();
        for (m, count, coverage) in observations {
            depths[m.position as usize - 1] = *coverage;
            counts.add(m.clone(), *count);
        }
        let tally = Tally::from_parts(CoverageVector::from_depths(depths), counts);
        SampleCounts::new("sample1", tally)
    }

    fn m(pos: u32) -> Mutation {
        Mutation::substitution(pos, "T")
    }

    #[test]
    fn test_high_frequency_rejects_null() {
        let sig = signature(&[(m(10), 1.0)]);
        let counts = sample(&[(m(10), 95, 100)]);
        let est = estimate_proportion(&counts, &sig, &EstimatorConfig::default()).unwrap();

        assert_abs_diff_eq!(est.point_estimate, 0.95, epsilon = 1e-8);
        assert!(est.ci_lower > 0.01);
        assert!(est.ci_lower < 0.95 && est.ci_upper > 0.95);
        assert_abs_diff_eq!(est.ci_lower, 0.8855, epsilon = 1e-3);
        assert_abs_diff_eq!(est.ci_upper, 0.9790, epsilon = 1e-3);
        assert_eq!(est.test_result, TestResult::RejectNull);
        assert!(est.p_value < 1e-6);
    }

    #[test]
    fn test_low_frequency_fails_to_reject() {
        let sig = signature(&[(m(10), 1.0)]);
        let counts = sample(&[(m(10), 1, 100)]);
        let est = estimate_proportion(&counts, &sig, &EstimatorConfig::default()).unwrap();

        assert_abs_diff_eq!(est.point_estimate, 0.01, epsilon = 1e-8);
        assert!(est.ci_lower < 0.01 && est.ci_upper > 0.01);
        assert_eq!(est.test_result, TestResult::FailToReject);
        assert!(est.p_value > 0.9);
    }

    #[test]
    fn test_zero_coverage_is_undefined() {
        let sig = signature(&[(m(10), 1.0), (m(20), 1.0)]);
        let result = estimate_proportion(&sample(&[]), &sig, &EstimatorConfig::default());
        match result {
            Err(VocError::UndefinedEstimate { sample, lineage }) => {
                assert_eq!(sample, "sample1");
                assert_eq!(lineage, "B.1.617.2");
            }
            other => panic!("Expected UndefinedEstimate, got {:?}", other),
        }
    }

    #[test]
    fn test_count_above_coverage_is_rejected() {
        let sig = signature(&[(m(10), 1.0), (m(20), 1.0)]);
        let counts = sample(&[(m(10), 10, 5), (m(20), 1, 15)]);

        let result = estimate_proportion(&counts, &sig, &EstimatorConfig::default());
        assert!(matches!(result, Err(VocError::InvalidRecord(msg)) if msg.contains("~10T")));
        assert!(gather_evidence(&counts.tally, &sig).is_err());
    }

    #[test]
    fn test_gather_evidence_weights() {
        let sig = signature(&[(m(10), 0.8), (m(20), 1.5)]);
        let counts = sample(&[(m(10), 3, 5)]);

        let evidence = gather_evidence(&counts.tally, &sig).unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!((evidence[0].count, evidence[0].coverage), (3, 5));
        assert_abs_diff_eq!(evidence[0].weight, 0.8);
        assert_eq!((evidence[1].count, evidence[1].coverage), (0, 0));
        assert_abs_diff_eq!(evidence[1].weight, 1.0);
    }

    #[test]
    fn test_empty_signature() {
        let sig = signature(&[]);
        let counts = sample(&[(m(10), 5, 10)]);
        let result = estimate_proportion(&counts, &sig, &EstimatorConfig::default());
        assert!(matches!(result, Err(VocError::EmptySignature(_))));
    }

    #[test]
    fn test_boundary_counts_fail_fit() {
        let sig = signature(&[(m(10), 1.0), (m(20), 1.0)]);
        let config = EstimatorConfig::default();

        let none = estimate_proportion(&sample(&[(m(10), 0, 50), (m(20), 0, 40)]), &sig, &config);
        assert!(matches!(none, Err(VocError::NumericalFitFailure(_))));

        let all = estimate_proportion(&sample(&[(m(10), 50, 50), (m(20), 40, 40)]), &sig, &config);
        assert!(matches!(all, Err(VocError::NumericalFitFailure(_))));
    }

    #[test]
    fn test_pooling_narrows_interval() {
        let config = EstimatorConfig::default();
        let single = estimate_proportion(
            &sample(&[(m(10), 6, 20)]),
            &signature(&[(m(10), 1.0)]),
            &config,
        )
        .unwrap();
        let pooled = estimate_proportion(
            &sample(&[(m(10), 6, 20), (m(20), 6, 20), (m(30), 6, 20)]),
            &signature(&[(m(10), 1.0), (m(20), 1.0), (m(30), 1.0)]),
            &config,
        )
        .unwrap();

        assert_abs_diff_eq!(single.point_estimate, pooled.point_estimate, epsilon = 1e-8);
        assert!(pooled.ci_upper - pooled.ci_lower < single.ci_upper - single.ci_lower);
    }

    #[test]
    fn test_pooled_estimate_matches_closed_form() {
        let sig = signature(&[(m(10), 1.0), (m(20), 0.5), (m(30), 1.0)]);
        let est = estimate_proportion(
            &sample(&[(m(10), 30, 100), (m(20), 10, 40), (m(30), 0, 0)]),
            &sig,
            &EstimatorConfig::default(),
        )
        .unwrap();

        // Weighted successes over weighted trials
        let expected = (30.0 + 0.5 * 10.0) / (100.0 + 0.5 * 40.0);
        assert_abs_diff_eq!(est.point_estimate, expected, epsilon = 1e-8);
        assert_eq!(est.per_mutation_counts.len(), 3);
        assert_eq!(est.per_mutation_counts[2].coverage, 0);
    }

    #[test]
    fn test_fit_reports_standard_error() {
        let evidence = vec![MutationEvidence {
            mutation: m(10),
            count: 25,
            coverage: 100,
            weight: 1.0,
        }];
        let fit = fit_shared_proportion(&evidence, &EstimatorConfig::default()).unwrap();
        assert_abs_diff_eq!(fit.p_hat, 0.25, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.eta, logit(0.25), epsilon = 1e-10);
        assert_abs_diff_eq!(fit.std_error, 1.0 / (100.0f64 * 0.25 * 0.75).sqrt(), epsilon = 1e-8);
        assert!(fit.iterations >= 1);
    }

    #[test]
    fn test_non_convergence_reported() {
        let evidence = vec![MutationEvidence {
            mutation: m(10),
            count: 3,
            coverage: 1000,
            weight: 1.0,
        }];
        let config = EstimatorConfig {
            max_iterations: 1,
            tolerance: 1e-300,
            ..EstimatorConfig::default()
        };
        let result = fit_shared_proportion(&evidence, &config);
        assert!(matches!(result, Err(VocError::NumericalFitFailure(_))));
    }

    #[test]
    fn test_validate_estimator_config() {
        assert!(validate_estimator_config(&EstimatorConfig::default()).is_ok());

        let invalid = EstimatorConfig {
            null_value: 0.0,
            ..EstimatorConfig::default()
        };
        assert!(validate_estimator_config(&invalid).is_err());

        let invalid = EstimatorConfig {
            confidence_level: 1.0,
            ..EstimatorConfig::default()
        };
        assert!(validate_estimator_config(&invalid).is_err());
    }

    #[test]
    fn test_batch_reports_failures_per_pair() {
        let good = signature(&[(m(10), 1.0)]);
        let mut uncovered = signature(&[(m(50), 1.0)]);
        uncovered.lineage = "BA.1".to_string();

        let mut second = sample(&[(m(10), 2, 100)]);
        second.sample_id = "sample2".to_string();
        let samples = vec![sample(&[(m(10), 80, 100)]), second];

        let outcomes = estimate_batch(&samples, &[good, uncovered], &EstimatorConfig::default());
        assert_eq!(outcomes.len(), 4);

        let ok: Vec<&PairOutcome> = outcomes.iter().filter(|o| o.result.is_ok()).collect();
        assert_eq!(ok.len(), 2);
        assert!(outcomes
            .iter()
            .filter(|o| o.lineage == "BA.1")
            .all(|o| matches!(o.result, Err(VocError::UndefinedEstimate { .. }))));
    }
}
