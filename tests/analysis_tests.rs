// End-to-end tests: planted factor structures through the full pipeline.

use approx::assert_abs_diff_eq;
use factor_analysis::{
    bartlett_sphericity, fit, kmo, smc, varimax, AnalysisOptions, Column,
    CorrelationMatrix, DataTable, FactorAnalyzer, Impute, Method, Rotation,
    VARIMAX_MAX_ITERATIONS, VARIMAX_TOLERANCE,
};
use ndarray::{array, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Planted two-factor loading pattern: three indicators per factor.
fn planted_loadings() -> Array2<f64> {
    array![
        [0.8, 0.0],
        [0.75, 0.0],
        [0.7, 0.0],
        [0.0, 0.78],
        [0.0, 0.72],
        [0.0, 0.65]
    ]
}

/// Samples observations from the factor model `x = L f + e` with unit-normal
/// factors and uniqueness-scaled noise, so the population correlation matrix
/// is exactly `L L' + diag(1 - h2)`.
fn sample_factor_model(
    loadings: &Array2<f64>,
    n_obs: usize,
    seed: u64,
) -> DataTable {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let standard_normal = Normal::new(0.0, 1.0).unwrap();

    let p = loadings.nrows();
    let k = loadings.ncols();
    let uniqueness: Vec<f64> = (0..p)
        .map(|i| {
            let h2: f64 = (0..k).map(|j| loadings[[i, j]].powi(2)).sum();
            (1.0 - h2).max(0.0)
        })
        .collect();

    let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(n_obs); p];
    for _ in 0..n_obs {
        let factors: Vec<f64> =
            (0..k).map(|_| standard_normal.sample(&mut rng)).collect();
        for i in 0..p {
            let common: f64 =
                (0..k).map(|j| loadings[[i, j]] * factors[j]).sum();
            let noise = standard_normal.sample(&mut rng) * uniqueness[i].sqrt();
            columns[i].push(common + noise);
        }
    }

    DataTable::from_columns(
        columns
            .into_iter()
            .enumerate()
            .map(|(i, values)| (format!("v{}", i + 1), Column::Numeric(values)))
            .collect(),
    )
    .unwrap()
}

/// Wraps a planted loading pattern into its exact model-implied correlation
/// matrix (unit diagonal).
fn exact_model_corr(loadings: &Array2<f64>) -> CorrelationMatrix {
    let p = loadings.nrows();
    let mut corr = loadings.dot(&loadings.t());
    for i in 0..p {
        corr[[i, i]] = 1.0;
    }
    CorrelationMatrix::new(
        corr,
        (0..p).map(|i| format!("v{}", i + 1)).collect(),
    )
    .unwrap()
}

/// Matches each planted column to the rotated column with the largest
/// absolute inner product, then compares entries up to sign.
fn assert_structure_recovered(
    planted: &Array2<f64>,
    recovered: &Array2<f64>,
    tolerance: f64,
) {
    let k = planted.ncols();
    for target in 0..k {
        let planted_col = planted.column(target);

        let mut best: Option<(usize, f64)> = None;
        for candidate in 0..k {
            let score: f64 = planted_col
                .iter()
                .zip(recovered.column(candidate).iter())
                .map(|(a, b)| a * b)
                .sum::<f64>()
                .abs();
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((candidate, score));
            }
        }
        let (matched, score) = best.unwrap();
        let sign = {
            let raw: f64 = planted_col
                .iter()
                .zip(recovered.column(matched).iter())
                .map(|(a, b)| a * b)
                .sum();
            if raw < 0.0 {
                -1.0
            } else {
                1.0
            }
        };
        assert!(score > 0.0, "no recovered column matches factor {}", target);

        for (expected, actual) in
            planted_col.iter().zip(recovered.column(matched).iter())
        {
            assert!(
                (expected - sign * actual).abs() < tolerance,
                "factor {} entry off: expected {}, got {} (tolerance {})",
                target,
                expected,
                sign * actual,
                tolerance
            );
        }
    }
}

#[test]
fn uls_varimax_recovers_planted_structure_from_exact_corr() {
    let planted = planted_loadings();
    let corr = exact_model_corr(&planted);

    let fitted = fit(&corr, 2, Method::MinRes, true, Some((0.005, 1.0))).unwrap();
    let rotated = varimax(
        &fitted.loadings,
        true,
        VARIMAX_MAX_ITERATIONS,
        VARIMAX_TOLERANCE,
    )
    .unwrap();

    assert_structure_recovered(&planted, rotated.loadings.values(), 1e-2);
}

#[test]
fn ml_varimax_recovers_planted_structure_from_exact_corr() {
    let planted = planted_loadings();
    let corr = exact_model_corr(&planted);

    let fitted = fit(&corr, 2, Method::Ml, true, Some((0.005, 1.0))).unwrap();
    let rotated = varimax(
        &fitted.loadings,
        true,
        VARIMAX_MAX_ITERATIONS,
        VARIMAX_TOLERANCE,
    )
    .unwrap();

    assert_structure_recovered(&planted, rotated.loadings.values(), 2e-2);
}

#[test]
fn full_pipeline_recovers_planted_structure_from_sampled_data() {
    let planted = planted_loadings();
    let table = sample_factor_model(&planted, 2000, 42);

    let options = AnalysisOptions {
        n_factors: 2,
        rotation: Some(Rotation::Varimax),
        ..Default::default()
    };
    let result = FactorAnalyzer::new().analyze(&table, &options).unwrap();

    // Sampling noise at n = 2000 keeps loadings within a few hundredths of
    // the population values.
    assert_structure_recovered(&planted, result.loadings().values(), 0.12);
}

#[test]
fn promax_pipeline_keeps_planted_structure_interpretable() {
    let planted = planted_loadings();
    let table = sample_factor_model(&planted, 2000, 7);

    let options = AnalysisOptions {
        n_factors: 2,
        rotation: Some(Rotation::Promax),
        ..Default::default()
    };
    let result = FactorAnalyzer::new().analyze(&table, &options).unwrap();

    for row in result.loadings().values().rows() {
        let mut magnitudes: Vec<f64> = row.iter().map(|v| v.abs()).collect();
        magnitudes.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert!(
            magnitudes[0] > 0.5,
            "dominant loading collapsed: {:?}",
            magnitudes
        );
        assert!(
            magnitudes[1] < 0.3,
            "cross-loading did not stay small: {:?}",
            magnitudes
        );
    }
    assert!(result.rotation_matrix().is_some());
}

#[test]
fn single_factor_rotation_is_identity_end_to_end() {
    let planted = array![[0.9], [0.8], [0.7], [0.6]];
    let table = sample_factor_model(&planted, 1000, 11);

    let baseline = FactorAnalyzer::new()
        .analyze(
            &table,
            &AnalysisOptions {
                n_factors: 1,
                rotation: None,
                ..Default::default()
            },
        )
        .unwrap();

    for rotation in [Rotation::Varimax, Rotation::Promax] {
        let rotated = FactorAnalyzer::new()
            .analyze(
                &table,
                &AnalysisOptions {
                    n_factors: 1,
                    rotation: Some(rotation),
                    ..Default::default()
                },
            )
            .unwrap();

        for (a, b) in baseline
            .loadings()
            .values()
            .iter()
            .zip(rotated.loadings().values().iter())
        {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        let identity = rotated.rotation_matrix().unwrap();
        assert_eq!(identity.shape(), &[1, 1]);
        assert_abs_diff_eq!(identity[[0, 0]], 1.0, epsilon = 0.0);
    }
}

#[test]
fn optimized_model_reproduces_offdiagonal_structure() {
    let planted = planted_loadings();
    let corr = exact_model_corr(&planted);

    let fitted = fit(&corr, 2, Method::MinRes, false, Some((0.005, 1.0))).unwrap();
    let l = fitted.loadings.values();
    let model = l.dot(&l.t());

    let fitted_residual: f64 = corr
        .matrix()
        .indexed_iter()
        .filter(|((i, j), _)| i != j)
        .map(|((i, j), value)| (value - model[[i, j]]).powi(2))
        .sum();

    // The planted off-diagonal structure is exactly reproducible, so the
    // optimized residual must be tiny; a flat guess cannot get there.
    assert!(
        fitted_residual < 1e-4,
        "optimized off-diagonal residual too large: {}",
        fitted_residual
    );
}

#[test]
fn derived_statistics_are_consistent_end_to_end() {
    let planted = planted_loadings();
    let table = sample_factor_model(&planted, 1500, 3);

    let options = AnalysisOptions {
        n_factors: 2,
        rotation: Some(Rotation::Varimax),
        ..Default::default()
    };
    let result = FactorAnalyzer::new().analyze(&table, &options).unwrap();

    let communalities = result.communalities();
    let uniqueness = result.uniqueness();
    for (h2, u) in communalities.iter().zip(uniqueness.iter()) {
        assert_abs_diff_eq!(h2 + u, 1.0, epsilon = 1e-12);
    }

    let variance = result.factor_variance();
    for pair in variance.cumulative.to_vec().windows(2) {
        assert!(pair[0] <= pair[1] + 1e-12);
    }
    let final_share = variance.cumulative[variance.cumulative.len() - 1];
    assert!(final_share <= 1.0 + 1e-9);

    let eigenvalues = result.eigenvalues().unwrap();
    assert_eq!(eigenvalues.original.len(), 6);
    for pair in eigenvalues.original.to_vec().windows(2) {
        assert!(pair[0] >= pair[1] - 1e-12);
    }
}

#[test]
fn diagnostics_behave_on_sampled_data() {
    let planted = planted_loadings();
    let table = sample_factor_model(&planted, 1000, 19);

    let options = AnalysisOptions {
        n_factors: 2,
        rotation: None,
        ..Default::default()
    };
    let result = FactorAnalyzer::new().analyze(&table, &options).unwrap();
    let corr = result.correlation();

    let adequacy = kmo(corr).unwrap();
    assert!(
        (0.0..=1.0).contains(&adequacy),
        "KMO out of range: {}",
        adequacy
    );

    let r_squared = smc(corr, false).unwrap();
    assert_eq!(r_squared.len(), 6);
    for (name, value) in &r_squared {
        assert!(
            (0.0..1.0).contains(value),
            "SMC for {} out of range: {}",
            name,
            value
        );
    }

    let sphericity = bartlett_sphericity(corr, 1000).unwrap();
    assert!(sphericity.chi_square > 0.0);
    assert_abs_diff_eq!(sphericity.degrees_of_freedom, 15.0, epsilon = 0.0);
    assert!(sphericity.p_value >= 0.0);
}

#[test]
fn imputation_strategies_agree_on_lightly_missing_data() {
    let planted = planted_loadings();
    let table = sample_factor_model(&planted, 1200, 23);

    // Punch a few holes in the first two variables.
    let (numeric, _) = factor_analysis::select_numeric(&table);
    let mut data = numeric.data;
    data[[5, 0]] = f64::NAN;
    data[[100, 0]] = f64::NAN;
    data[[200, 1]] = f64::NAN;
    let holed = DataTable::from_columns(
        numeric
            .names
            .iter()
            .zip(data.columns())
            .map(|(name, column)| {
                (name.clone(), Column::Numeric(column.to_vec()))
            })
            .collect(),
    )
    .unwrap();

    for strategy in [Impute::Drop, Impute::Mean, Impute::Median] {
        let options = AnalysisOptions {
            n_factors: 2,
            rotation: Some(Rotation::Varimax),
            impute: Some(strategy),
            ..Default::default()
        };
        let result = FactorAnalyzer::new().analyze(&holed, &options).unwrap();
        assert_structure_recovered(&planted, result.loadings().values(), 0.15);
    }
}
