use ndarray::{arr2, Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

use velma::collective::SingleProcess;
use velma::config::Parameters;
use velma::genotype::{GenotypeView, VariantRecord};
use velma::random::RandomDraws;
use velma::trace::TraceEstimator;
use velma::tracker::StateDump;
use velma::util::matrix_util::{normalize_matrix_columns_inplace, normalize_vector_inplace};
use velma::vbayes::VbEngine;

fn toy_genotypes(n_samples: usize, n_var: usize, seed: u64) -> GenotypeView {
    let mut rng = Pcg64::seed_from_u64(seed);
    let records: Vec<VariantRecord> = (0..n_var)
        .map(|j| VariantRecord {
            chromosome: 1 + (j * 3 / n_var) as u8,
            rsid: format!("rs{}", j),
            position: 250 * (j as u32 + 1),
            a0: "A".to_string(),
            a1: "G".to_string(),
            maf: f64::NAN,
            info: 1.,
            dosages: (0..n_samples)
                .map(|_| {
                    let f: f64 = rng.gen_range(0.1..0.9);
                    let d: f64 = (0..2).map(|_| if rng.gen_bool(f) { 1. } else { 0. }).sum();
                    d
                })
                .collect(),
        })
        .collect();
    GenotypeView::from_records(records, n_samples).unwrap()
}

fn toy_env(n_samples: usize, n_env: usize, seed: u64) -> Array2<f64> {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut e = Array2::from_shape_fn((n_samples, n_env), |_| rng.gen_range(-1.0..1.0));
    normalize_matrix_columns_inplace(&mut e, 1);
    e
}

/// Phenotype with planted main and interaction effects plus noise.
fn toy_pheno(x: &GenotypeView, e: &Array2<f64>, seed: u64) -> Array1<f64> {
    let n = x.n_samples();
    let mut rng = Pcg64::seed_from_u64(seed);
    let eta = e.column(0).to_owned();
    let mut y = Array1::<f64>::zeros(n);
    for j in [0usize, 3, 7] {
        let col = x.col(j % x.n_variants());
        y.scaled_add(0.6, &col);
        y += &(&col * &eta * 0.3);
    }
    for v in y.iter_mut() {
        *v += rng.gen_range(-0.5..0.5);
    }
    normalize_vector_inplace(&mut y, 1);
    y
}

fn base_params(dir: &std::path::Path) -> Parameters {
    let mut params = Parameters::default();
    params.out_file = dir.join("run.out").to_str().unwrap().to_string();
    params.vb_iter_max = 20;
    params.main_chunk_size = 8;
    params.gxe_chunk_size = 8;
    params
}

fn single_row_grid() -> Array2<f64> {
    arr2(&[[0.8, 0.2, 0.05, 0.1, 0.05]])
}

#[test]
fn residual_bookkeeping_invariants_hold_after_inference() {
    let dir = tempfile::tempdir().unwrap();
    let n = 60;
    let x = toy_genotypes(n, 24, 1);
    let e = toy_env(n, 2, 2);
    let y = toy_pheno(&x, &e, 3);

    let params = base_params(dir.path());
    let coll = SingleProcess;
    let mut engine = VbEngine::new(
        &x, y, e.clone(), None, vec![],
        vec!["e0".into(), "e1".into()],
        single_row_grid(), &params, &coll,
    )
    .unwrap();
    let trackers = engine.run().unwrap();
    let vp = trackers[0].vp.as_ref().unwrap();

    // ym and yx must equal the chunk-patched predictions recomputed from
    // scratch, and eta must equal E mu_w
    let mut fresh = vp.clone();
    engine.calc_pred_effects(&mut fresh);
    let tol = 1e-8 * (n as f64).sqrt();
    let ym_err = (&vp.ym - &fresh.ym).mapv(f64::abs).sum();
    let yx_err = (&vp.yx - &fresh.yx).mapv(f64::abs).sum();
    assert!(ym_err < tol, "ym drifted from X E[beta]: {}", ym_err);
    assert!(yx_err < tol, "yx drifted from X E[gamma]: {}", yx_err);

    let eta_expected = e.dot(&vp.muw);
    let eta_err = (&vp.eta - &eta_expected).mapv(f64::abs).sum();
    assert!(eta_err < tol, "eta drifted from E mu_w: {}", eta_err);
}

#[test]
fn elbo_is_monotone_under_empirical_bayes() {
    let dir = tempfile::tempdir().unwrap();
    let n = 50;
    let x = toy_genotypes(n, 20, 11);
    let e = toy_env(n, 3, 12);
    let y = toy_pheno(&x, &e, 13);

    let mut params = base_params(dir.path());
    params.mode_empirical_bayes = true;
    params.set_effects_prior_mog();
    params.burnin_maxhyps = 2;
    params.vb_iter_max = 15;
    let coll = SingleProcess;
    let engine = VbEngine::new(
        &x, y, e, None, vec![],
        vec!["e0".into(), "e1".into(), "e2".into()],
        single_row_grid(), &params, &coll,
    )
    .unwrap();

    let tracker = engine.inner_loop(0, 2).unwrap();
    let elbo = &tracker.elbo_trajectory;
    assert!(elbo.len() > 3);
    for w in elbo.windows(2) {
        assert!(
            w[1] >= w[0] - 1e-6,
            "ELBO decreased beyond tolerance: {} -> {}",
            w[0], w[1]
        );
    }
    assert!(elbo.iter().all(|v| v.is_finite()));
}

#[test]
fn fixed_seed_runs_are_identical() {
    let n = 40;
    let x = toy_genotypes(n, 16, 21);
    let e = toy_env(n, 2, 22);
    let y = toy_pheno(&x, &e, 23);
    let coll = SingleProcess;

    let run = || {
        let dir = tempfile::tempdir().unwrap();
        let params = base_params(dir.path());
        let mut engine = VbEngine::new(
            &x, y.clone(), e.clone(), None, vec![],
            vec!["e0".into(), "e1".into()],
            single_row_grid(), &params, &coll,
        )
        .unwrap();
        let trackers = engine.run().unwrap();
        let vp = trackers[0].vp.clone().unwrap();
        (trackers[0].elbo, vp)
    };

    let (elbo_a, vp_a) = run();
    let (elbo_b, vp_b) = run();
    assert_eq!(elbo_a, elbo_b);
    assert_eq!(vp_a.alpha_beta, vp_b.alpha_beta);
    assert_eq!(vp_a.mu1_beta, vp_b.mu1_beta);
    assert_eq!(vp_a.muw, vp_b.muw);
}

#[test]
fn resume_from_dump_matches_direct_run() {
    let n = 50;
    let x = toy_genotypes(n, 20, 31);
    let e = toy_env(n, 2, 32);
    let y = toy_pheno(&x, &e, 33);
    let coll = SingleProcess;
    let grid = single_row_grid();

    // direct run to 10 iterations, dumping along the way
    let dir_a = tempfile::tempdir().unwrap();
    let mut params_a = base_params(dir_a.path());
    params_a.vb_iter_max = 10;
    params_a.alpha_tol = 0.;
    params_a.alpha_tol_set_by_user = true;
    let mut engine_a = VbEngine::new(
        &x, y.clone(), e.clone(), None, vec![],
        vec!["e0".into(), "e1".into()],
        grid.clone(), &params_a, &coll,
    )
    .unwrap();
    let trackers_a = engine_a.run().unwrap();
    assert_eq!(trackers_a[0].count, 10);
    let direct_elbo = trackers_a[0].elbo;
    let direct_alpha = trackers_a[0].vp.as_ref().unwrap().alpha_beta.clone();

    // restart from the dump taken at iteration 2
    let dump_path = dir_a
        .path()
        .join("r2_interim_files/grid_point_0/run_dump_it2");
    assert!(dump_path.exists(), "expected a state dump at iteration 2");
    let dump = StateDump::load(&dump_path).unwrap();
    assert_eq!(dump.count, 2);

    let dir_b = tempfile::tempdir().unwrap();
    let mut params_b = base_params(dir_b.path());
    params_b.vb_iter_max = 10;
    params_b.vb_iter_start = 3;
    params_b.alpha_tol = 0.;
    params_b.alpha_tol_set_by_user = true;
    let mut engine_b = VbEngine::new(
        &x, y, e, None, vec![],
        vec!["e0".into(), "e1".into()],
        grid, &params_b, &coll,
    )
    .unwrap();
    engine_b.set_resume(dump).unwrap();
    let trackers_b = engine_b.run().unwrap();

    assert_eq!(trackers_b[0].count, 10);
    assert!(
        (trackers_b[0].elbo - direct_elbo).abs() < 1e-4,
        "resumed ELBO {} vs direct {}",
        trackers_b[0].elbo, direct_elbo
    );
    let resumed_alpha = &trackers_b[0].vp.as_ref().unwrap().alpha_beta;
    let max_diff = direct_alpha
        .iter()
        .zip(resumed_alpha.iter())
        .fold(0f64, |acc, (a, b)| acc.max((a - b).abs()));
    assert!(max_diff < 1e-6, "alpha max-abs diff {}", max_diff);
}

#[test]
fn resume_dump_against_other_inputs_is_refused() {
    let n = 50;
    let x = toy_genotypes(n, 20, 31);
    let e = toy_env(n, 2, 32);
    let y = toy_pheno(&x, &e, 33);
    let coll = SingleProcess;

    let dir = tempfile::tempdir().unwrap();
    let mut params = base_params(dir.path());
    params.vb_iter_max = 4;
    let mut engine = VbEngine::new(
        &x, y.clone(), e.clone(), None, vec![],
        vec!["e0".into(), "e1".into()],
        single_row_grid(), &params, &coll,
    )
    .unwrap();
    engine.run().unwrap();
    let dump_path = dir.path().join("r2_interim_files/grid_point_0/run_dump_it2");
    let dump = StateDump::load(&dump_path).unwrap();

    // same shapes, different grid row: refused
    let dir_c = tempfile::tempdir().unwrap();
    let params_c = base_params(dir_c.path());
    let other_grid = arr2(&[[0.7, 0.2, 0.05, 0.1, 0.05]]);
    let mut engine_c = VbEngine::new(
        &x, y, e, None, vec![],
        vec!["e0".into(), "e1".into()],
        other_grid, &params_c, &coll,
    )
    .unwrap();
    assert!(engine_c.set_resume(dump).is_err());
}

#[test]
fn covariates_in_vb_keep_their_contribution_in_ym() {
    let dir = tempfile::tempdir().unwrap();
    let n = 60;
    let x = toy_genotypes(n, 18, 41);
    let e = toy_env(n, 2, 42);
    let mut c = toy_env(n, 2, 43);
    normalize_matrix_columns_inplace(&mut c, 1);
    let y = toy_pheno(&x, &e, 44);

    let mut params = base_params(dir.path());
    params.use_vb_on_covars = true;
    params.vb_iter_max = 12;
    let coll = SingleProcess;
    let mut engine = VbEngine::new(
        &x, y, e, Some(c.clone()),
        vec!["age".into(), "sex".into()],
        vec!["e0".into(), "e1".into()],
        single_row_grid(), &params, &coll,
    )
    .unwrap();
    let trackers = engine.run().unwrap();
    let vp = trackers[0].vp.as_ref().unwrap();

    // at least one covariate coefficient moved off zero
    assert!(vp.muc.iter().any(|v| v.abs() > 0.));

    let mut fresh = vp.clone();
    engine.calc_pred_effects(&mut fresh);
    let tol = 1e-8 * (n as f64).sqrt();
    let ym_err = (&vp.ym - &fresh.ym).mapv(f64::abs).sum();
    assert!(ym_err < tol, "ym drifted from X E[beta] + C mu_c: {}", ym_err);
}

#[test]
fn rhe_recovers_planted_main_effect_share() {
    // strong polygenic main signal: the G component should take a large
    // share of the variance
    let n = 500;
    let n_var = 100;
    let x = toy_genotypes(n, n_var, 51);
    let mut rng = Pcg64::seed_from_u64(52);
    let mut y = Array1::<f64>::zeros(n);
    for j in 0..n_var {
        let b: f64 = rng.gen_range(-1.0..1.0);
        y.scaled_add(b * (2.0 / n_var as f64).sqrt(), &x.col(j));
    }
    for v in y.iter_mut() {
        *v += rng.gen_range(-0.4..0.4);
    }
    normalize_vector_inplace(&mut y, 1);

    let zz = RandomDraws::new(53).standard_gaussian(n, 20);
    let span = x.cumulative_pos(x.n_variants() - 1);
    let mut est = TraceEstimator::new(&y, zz, None, 8, span, None, usize::MAX / 2).unwrap();
    for (start, block) in x.col_chunk_iter(25) {
        est.add_chunk(&block.view(), x.cumulative_pos(start));
    }
    est.finalize(&SingleProcess);
    let summary = est.estimate();

    let g_index = summary.labels.iter().position(|l| l == "G").unwrap();
    assert!(
        summary.h2[g_index] > 0.5,
        "expected a dominant G share, got {}",
        summary.h2[g_index]
    );
    assert!(summary.h2_se[g_index].is_finite());
    // jackknife identity: total variants recovered across blocks
    let n_var_total: f64 = summary.n_var_jack.iter().sum::<f64>();
    assert!(n_var_total > 0.);
}

#[test]
fn streaming_and_in_memory_rhe_agree_end_to_end() {
    let n = 80;
    let x = toy_genotypes(n, 40, 61);
    let e = toy_env(n, 2, 62);
    let y = toy_pheno(&x, &e, 63);
    let eta = e.column(0).to_owned();
    let span = x.cumulative_pos(x.n_variants() - 1);
    let coll = SingleProcess;

    let solve_with_chunk = |chunk: usize| {
        let zz = RandomDraws::new(64).standard_gaussian(n, 12);
        let mut est =
            TraceEstimator::new(&y, zz, Some(&eta), 5, span, None, usize::MAX / 2).unwrap();
        for (start, block) in x.col_chunk_iter(chunk) {
            est.add_chunk(&block.view(), x.cumulative_pos(start));
        }
        est.finalize(&coll);
        est.estimate()
    };

    let bulk = solve_with_chunk(40);
    let streamed = solve_with_chunk(3);
    for (a, b) in bulk.sigmas.iter().zip(streamed.sigmas.iter()) {
        assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
    }
    for (a, b) in bulk.h2.iter().zip(streamed.h2.iter()) {
        assert!((a - b).abs() < 1e-9);
    }
}
