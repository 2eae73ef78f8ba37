use std::collections::HashMap;

use ndarray::{s, Array1, Array2};
use rayon::prelude::*;

use crate::collective::Collective;
use crate::config::Parameters;
use crate::error::Error;
use crate::genotype::GenotypeView;
use crate::hyps::{subset_grid, validate_grid, Hyps, Prior};
use crate::timer::Timer;
use crate::tracker::{StateDump, VbTracker};
use crate::variational::VariationalState;

/// Flat prior variance on covariate coefficients.
const SIGMA_C: f64 = 1e4;
const EPS: f64 = f64::MIN_POSITIVE;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// One coordinate-update chunk: an effect type (0 = main,
/// 1 = interaction) and the variant indices it visits, in pass order.
#[derive(Clone, Debug)]
struct Chunk {
    ee: usize,
    cols: Vec<usize>,
}

/// Main-effect chunks first, interaction chunks second; the backward pass
/// reverses both the chunk order and the order within each chunk.
fn build_pass_chunks(
    n_var: usize,
    n_effects: usize,
    main_chunk_size: usize,
    gxe_chunk_size: usize,
) -> (Vec<Chunk>, Vec<Chunk>) {
    let mut fwd = Vec::new();
    for start in (0..n_var).step_by(main_chunk_size) {
        let end = (start + main_chunk_size).min(n_var);
        fwd.push(Chunk { ee: 0, cols: (start..end).collect() });
    }
    if n_effects > 1 {
        for start in (0..n_var).step_by(gxe_chunk_size) {
            let end = (start + gxe_chunk_size).min(n_var);
            fwd.push(Chunk { ee: 1, cols: (start..end).collect() });
        }
    }
    let mut back: Vec<Chunk> = fwd.iter().rev().cloned().collect();
    for chunk in &mut back {
        chunk.cols.reverse();
    }
    (fwd, back)
}

/// Exponentiates and normalizes ELBO values into posterior grid weights,
/// skipping non-finite entries.
pub fn normalise_log_weights(log_weights: &[f64]) -> Vec<f64> {
    let max_elem = log_weights
        .iter()
        .copied()
        .filter(|w| w.is_finite())
        .fold(-f64::MAX, f64::max);
    let mut weights: Vec<f64> = log_weights.iter().map(|w| (w - max_elem).exp()).collect();
    let total: f64 = weights.iter().copied().filter(|w| w.is_finite()).sum();
    for w in &mut weights {
        *w /= total;
    }
    weights
}

/// Coordinate-ascent variational inference of main (beta) and
/// interaction (gamma) effects under spike-and-slab or
/// mixture-of-Gaussians priors.
///
/// The engine is shared read-only across hyperparameter grid points; each
/// grid point owns its `VariationalState` exclusively, so grid points run
/// on a thread pool without locking.
pub struct VbEngine<'a> {
    pub x: &'a GenotypeView,
    pub y: Array1<f64>,
    pub e: Array2<f64>,
    pub c: Option<Array2<f64>>,
    cty: Array1<f64>,
    /// P x L^2 matrix; column (l * L + m) holds the diagonal of
    /// X^T diag(E_l E_m) X.
    pub dxteex: Array2<f64>,

    pub params: &'a Parameters,
    pub prior_beta: Prior,
    pub prior_gam: Prior,

    pub n_samples: usize,
    pub n_var: usize,
    pub n_env: usize,
    pub n_covar: usize,
    pub n_effects: usize,
    nn: f64,

    pub covar_names: Vec<String>,
    pub env_names: Vec<String>,

    fwd_pass_chunks: Vec<Chunk>,
    back_pass_chunks: Vec<Chunk>,
    env_fwd_pass: Vec<usize>,
    env_back_pass: Vec<usize>,

    pub hyps_grid: Array2<f64>,
    pub vp_init: VariationalState,
    user_supplied_init: bool,
    resume: Option<StateDump>,

    collective: &'a dyn Collective,
}

impl<'a> VbEngine<'a> {
    pub fn new(
        x: &'a GenotypeView,
        y: Array1<f64>,
        e: Array2<f64>,
        c: Option<Array2<f64>>,
        covar_names: Vec<String>,
        env_names: Vec<String>,
        hyps_grid: Array2<f64>,
        params: &'a Parameters,
        collective: &'a dyn Collective,
    ) -> Result<VbEngine<'a>, Error> {
        let n_samples = y.len();
        let n_var = x.n_variants();
        let n_env = e.dim().1;
        let n_covar = c.as_ref().map_or(0, |c| c.dim().1);
        let n_effects = if n_env > 0 { 2 } else { 1 };
        assert_eq!(e.dim().0, n_samples);

        let n_grid = hyps_grid.dim().0;
        let valid_points = validate_grid(&hyps_grid, n_var);
        if valid_points.is_empty() {
            return Err(Error::Config(
                "no valid grid points in the hyperparameter grid".to_string(),
            ));
        }
        if valid_points.len() < n_grid {
            println!(
                "WARNING: {} invalid grid points removed from the hyperparameter grid",
                n_grid - valid_points.len()
            );
        }
        let hyps_grid = subset_grid(&hyps_grid, &valid_points);

        let prior_beta = if params.mode_mog_prior_beta {
            Prior::MixtureOfGaussians
        } else {
            Prior::SpikeSlab
        };
        let prior_gam = if params.mode_mog_prior_gam {
            Prior::MixtureOfGaussians
        } else {
            Prior::SpikeSlab
        };

        let main_chunk = params.main_chunk_size.max(1).min(n_var);
        let gxe_chunk = params.gxe_chunk_size.max(1).min(n_var);
        let (fwd_pass_chunks, back_pass_chunks) =
            build_pass_chunks(n_var, n_effects, main_chunk, gxe_chunk);

        let mut engine = VbEngine {
            x,
            y,
            e,
            c,
            cty: Array1::zeros(n_covar),
            dxteex: Array2::zeros((n_var, n_env * n_env)),
            params,
            prior_beta,
            prior_gam,
            n_samples,
            n_var,
            n_env,
            n_covar,
            n_effects,
            nn: n_samples as f64,
            covar_names,
            env_names,
            fwd_pass_chunks,
            back_pass_chunks,
            env_fwd_pass: (0..n_env).collect(),
            env_back_pass: (0..n_env).rev().collect(),
            hyps_grid,
            vp_init: VariationalState::zeros(n_var, n_covar, n_env, n_samples),
            user_supplied_init: false,
            resume: None,
            collective,
        };

        if n_effects > 1 {
            engine.dxteex = engine.calc_dxteex();
        }
        if params.use_vb_on_covars {
            if let Some(c) = &engine.c {
                let mut cty = c.t().dot(&engine.y);
                engine.collective.all_reduce_sum(cty.as_slice_mut().unwrap());
                engine.cty = cty;
            }
        }

        engine.init_random_start(params.random_seed);
        Ok(engine)
    }

    /// Seeded start point: inclusion probabilities a normalized uniform
    /// simplex, slab means standard gaussian, uniform env weights.
    fn init_random_start(&mut self, seed: u64) {
        use rand::{Rng, SeedableRng};
        use rand_distr::{Distribution, StandardNormal};
        let mut rng = rand_pcg::Pcg64::seed_from_u64(seed);

        let mut vp = VariationalState::zeros(self.n_var, self.n_covar, self.n_env, self.n_samples);
        for kk in 0..self.n_var {
            vp.alpha_beta[kk] = rng.gen_range(0.0..1.0);
            vp.mu1_beta[kk] = StandardNormal.sample(&mut rng);
        }
        let alpha_sum = vp.alpha_beta.sum();
        vp.alpha_beta /= alpha_sum;

        if self.n_effects > 1 {
            for kk in 0..self.n_var {
                vp.alpha_gam[kk] = rng.gen_range(0.0..1.0);
                vp.mu1_gam[kk] = StandardNormal.sample(&mut rng);
            }
            let alpha_sum = vp.alpha_gam.sum();
            vp.alpha_gam /= alpha_sum;
            vp.muw.fill(1.0 / self.n_env as f64);
        }

        self.vp_init = vp;
        self.refresh_init_predictions();
    }

    /// Overrides the starting env weights (e.g. from a weights file).
    pub fn set_init_env_weights(&mut self, muw: Array1<f64>) -> Result<(), Error> {
        if muw.len() != self.n_env {
            return Err(Error::Config(format!(
                "expected {} env weights, received {}",
                self.n_env, muw.len()
            )));
        }
        self.vp_init.muw = muw;
        self.refresh_init_predictions();
        Ok(())
    }

    /// Overrides the starting inclusion probabilities and slab means.
    pub fn set_init_alpha_mu(
        &mut self,
        alpha_beta: Array1<f64>,
        mu1_beta: Array1<f64>,
        alpha_gam: Option<Array1<f64>>,
        mu1_gam: Option<Array1<f64>>,
    ) -> Result<(), Error> {
        if alpha_beta.len() != self.n_var || mu1_beta.len() != self.n_var {
            return Err(Error::Config(format!(
                "init vectors must have length {}",
                self.n_var
            )));
        }
        self.vp_init.alpha_beta = alpha_beta;
        self.vp_init.mu1_beta = mu1_beta;
        self.vp_init.mu2_beta.fill(0.);
        if self.n_effects > 1 {
            match (alpha_gam, mu1_gam) {
                (Some(alpha), Some(mu)) => {
                    self.vp_init.alpha_gam = alpha;
                    self.vp_init.mu1_gam = mu;
                    self.vp_init.mu2_gam.fill(0.);
                }
                _ => {
                    return Err(Error::Config(
                        "interaction init vectors are required under the interaction model"
                            .to_string(),
                    ));
                }
            }
        }
        self.user_supplied_init = true;
        self.refresh_init_predictions();
        Ok(())
    }

    /// Registers a state dump to resume from; the grid row recorded in
    /// the dump resumes from its saved state at `vb_iter_start`.
    pub fn set_resume(&mut self, dump: StateDump) -> Result<(), Error> {
        let matched = self
            .hyps_grid
            .rows()
            .into_iter()
            .any(|row| {
                row.len() == dump.grid_row.len()
                    && row.iter().zip(dump.grid_row.iter()).all(|(a, b)| a == b)
            });
        if !matched {
            return Err(Error::ResumeMismatch(
                "dump hyperparameter row not present in the current grid".to_string(),
            ));
        }
        dump.validate(
            self.n_samples,
            self.n_var,
            self.n_env,
            self.n_covar,
            ndarray::ArrayView1::from(dump.grid_row.as_slice()),
        )?;
        self.resume = Some(dump);
        Ok(())
    }

    fn refresh_init_predictions(&mut self) {
        let mut vp = std::mem::replace(
            &mut self.vp_init,
            VariationalState::zeros(0, 0, 0, 0),
        );
        self.calc_pred_effects(&mut vp);
        if self.n_effects > 1 {
            vp.eta = self.e.dot(&vp.muw);
            vp.eta_sq = &vp.eta * &vp.eta;
        }
        self.vp_init = vp;
    }

    fn calc_dxteex(&self) -> Array2<f64> {
        let n_env = self.n_env;
        let mut ee_prod = Array2::<f64>::zeros((self.n_samples, n_env * n_env));
        for ll in 0..n_env {
            for mm in 0..n_env {
                let col = &self.e.column(ll) * &self.e.column(mm);
                ee_prod.column_mut(ll * n_env + mm).assign(&col);
            }
        }
        let mut dxteex = Array2::<f64>::zeros((self.n_var, n_env * n_env));
        for (start, block) in self.x.col_chunk_iter(self.params.main_chunk_size.max(1)) {
            let block_sq = block.mapv(|v| v * v);
            let chunk = block_sq.t().dot(&ee_prod);
            dxteex
                .slice_mut(s![start..start + chunk.dim().0, ..])
                .assign(&chunk);
        }
        self.collective.all_reduce_sum(dxteex.as_slice_mut().unwrap());
        dxteex
    }

    /// Sum of column variances of Z = diag(eta) X for the given env
    /// weights.
    pub fn calc_s_z(&self, muw: &Array1<f64>) -> f64 {
        let n_env = self.n_env;
        let mut total = 0.;
        for ll in 0..n_env {
            for mm in 0..n_env {
                total += muw[ll] * muw[mm] * self.dxteex.column(mm * n_env + ll).sum();
            }
        }
        total / (self.nn - 1.)
    }

    /// Chunked X v over all variants.
    fn x_dot(&self, v: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(self.n_samples);
        for (start, block) in self.x.col_chunk_iter(self.params.main_chunk_size.max(1)) {
            let len = block.dim().1;
            out += &block.dot(&v.slice(s![start..start + len]));
        }
        out
    }

    /// Restores ym = X E[beta] (+ C mu_c) and yx = X E[gamma].
    pub fn calc_pred_effects(&self, vp: &mut VariationalState) {
        let rr_beta = vp.mean_beta(self.prior_beta);
        vp.ym = self.x_dot(&rr_beta);
        if self.params.use_vb_on_covars {
            if let Some(c) = &self.c {
                vp.ym += &c.dot(&vp.muc);
            }
        }
        if self.n_effects > 1 {
            let rr_gam = vp.mean_gam(self.prior_gam);
            vp.yx = self.x_dot(&rr_gam);
        }
    }

    /// Resizes and seeds the posterior variances from the hyperparameters;
    /// used on the starting point so the first ELBO is well defined.
    fn update_ssq(&self, hyps: &Hyps, vp: &mut VariationalState) {
        let nn = self.nn;
        vp.s1_beta_sq.fill(hyps.slab_var[0] / (hyps.slab_relative_var[0] * (nn - 1.) + 1.));
        if self.prior_beta.is_mog() {
            vp.s2_beta_sq.fill(hyps.spike_var[0] / (hyps.spike_relative_var[0] * (nn - 1.) + 1.));
        }

        if self.n_effects > 1 {
            vp.sw_sq.fill(EPS);
            vp.calc_edztz(&self.dxteex);

            vp.s1_gam_sq.fill(hyps.slab_var[1] / (hyps.slab_relative_var[1] * (nn - 1.) + 1.));
            if self.prior_gam.is_mog() {
                vp.s2_gam_sq.fill(hyps.spike_var[1] / (hyps.spike_relative_var[1] * (nn - 1.) + 1.));
            }
        }

        vp.calc_var_beta(self.prior_beta, self.prior_gam, self.n_effects);

        if self.params.use_vb_on_covars {
            vp.sc_sq.fill(hyps.sigma * SIGMA_C / (SIGMA_C * (nn - 1.) + 1.));
        }
    }

    /// Two-round driver: a first pass over the grid finds the best
    /// starting point (skipped when the user supplied one or a resume
    /// dump), the second pass runs to convergence.
    pub fn run(&mut self) -> Result<Vec<VbTracker>, Error> {
        println!("Starting variational inference");
        let run_round1 = self.resume.is_none() && !self.user_supplied_init;

        if run_round1 {
            let trackers = self.run_inference(1)?;
            let mut best_elbo = -f64::MAX;
            let mut best_vp = None;
            for tracker in &trackers {
                if tracker.elbo.is_finite() && tracker.elbo > best_elbo {
                    best_elbo = tracker.elbo;
                    best_vp = tracker.vp.clone();
                }
            }
            match best_vp {
                Some(vp) => {
                    self.vp_init = vp;
                    self.refresh_init_predictions();
                }
                None => {
                    return Err(Error::Numerical(
                        "no valid start points found (elbo estimates all non-finite?)".to_string(),
                    ));
                }
            }
        }

        let trackers = self.run_inference(2)?;
        println!("Variational inference finished");
        Ok(trackers)
    }

    /// Runs every grid point for one round; grid points are independent
    /// and run on the rayon pool when more than one thread is configured.
    pub fn run_inference(&self, round_index: usize) -> Result<Vec<VbTracker>, Error> {
        let n_grid = self.hyps_grid.dim().0;
        let results: Vec<Result<VbTracker, Error>> = if self.params.n_thread > 1 {
            (0..n_grid)
                .into_par_iter()
                .map(|ii| self.inner_loop(ii, round_index))
                .collect()
        } else {
            (0..n_grid).map(|ii| self.inner_loop(ii, round_index)).collect()
        };
        let mut trackers = Vec::with_capacity(n_grid);
        for res in results {
            trackers.push(res?);
        }
        if trackers.iter().all(|t| !t.elbo.is_finite()) {
            return Err(Error::Numerical(
                "all grid points produced non-finite ELBO estimates".to_string(),
            ));
        }
        if trackers.iter().any(|t| !t.elbo.is_finite()) {
            println!("WARNING: non-finite elbo estimate produced");
        }
        Ok(trackers)
    }

    /// Coordinate ascent to convergence for one grid point.
    pub fn inner_loop(&self, grid_index: usize, round_index: usize) -> Result<VbTracker, Error> {
        let grid_row = self.hyps_grid.row(grid_index);
        let s_z = if self.n_effects > 1 {
            Some(self.calc_s_z(&self.vp_init.muw))
        } else {
            None
        };
        let mut hyps = Hyps::init_from_grid(
            grid_row,
            self.n_effects,
            self.n_var,
            self.params.spike_diff_factor,
            s_z,
        );
        let mut vp = self.vp_init.clone();
        let mut count = 0usize;
        let mut resumed = false;

        if let Some(dump) = &self.resume {
            let matches = grid_row.len() == dump.grid_row.len()
                && grid_row.iter().zip(dump.grid_row.iter()).all(|(a, b)| a == b);
            if matches {
                vp = dump.vp.clone();
                hyps = dump.hyps.clone();
                count = self.params.vb_iter_start;
                resumed = true;
            }
        }

        if !resumed {
            self.update_ssq(&hyps, &mut vp);
            if self.n_effects > 1 {
                vp.eta = self.e.dot(&vp.muw);
                vp.eta_sq = &vp.eta * &vp.eta;
            }
        }

        let mut tracker = VbTracker::new(grid_index, round_index);
        tracker.init_interim_output(
            &self.params.out_file,
            self.n_effects,
            self.prior_beta,
            self.prior_gam,
            self.params.use_vb_on_covars,
        )?;

        let mut memo: HashMap<(bool, usize), Array2<f64>> = HashMap::new();
        let mut timer = Timer::new();
        let mut elbo = -f64::MAX;
        let mut converged = false;

        while !converged && count < self.params.vb_iter_max {
            let alpha_prev = vp.alpha_beta.clone();
            let elbo_prev = elbo;

            self.update_all_params(count, round_index, &mut hyps, &mut vp, &mut memo, elbo_prev);

            elbo = self.calc_elbo(&hyps, &vp);
            let alpha_diff = vp
                .alpha_beta
                .iter()
                .zip(alpha_prev.iter())
                .fold(0f64, |acc, (a, b)| acc.max((a - b).abs()));

            if self.params.use_vb_on_covars && count % 10 == 0 {
                tracker.push_covar_values(count, &vp, &self.covar_names)?;
            }
            if self.params.xtra_verbose && count % 20 == 0 {
                tracker.push_param_values(count, &vp, self.x, self.n_effects)?;
            }
            tracker.push_iter_update(
                count,
                &hyps,
                elbo,
                alpha_diff,
                timer.lap_secs(),
                self.prior_beta,
                self.prior_gam,
            )?;
            tracker.dump_state(count, &vp, &hyps, grid_row, self.params.random_seed)?;

            let elbo_diff = elbo - elbo_prev;
            let p = self.params;
            converged = if p.alpha_tol_set_by_user && p.elbo_tol_set_by_user {
                alpha_diff < p.alpha_tol && elbo_diff < p.elbo_tol
            } else if p.alpha_tol_set_by_user {
                alpha_diff < p.alpha_tol
            } else if p.elbo_tol_set_by_user {
                elbo_diff < p.elbo_tol
            } else {
                alpha_diff < p.alpha_tol && elbo_diff < p.elbo_tol
            };
            count += 1;

            if (count + 1) % 25 == 0 {
                println!("Grid point {}: completed {} iterations", grid_index, count + 1);
            }
        }

        tracker.finish(count, elbo, converged, vp, hyps, timer.total_secs());
        Ok(tracker)
    }

    /// One full update sweep in the fixed order: covariates, then beta
    /// and gamma by chunks, then env weights, then (optionally) the
    /// empirical-Bayes hyperparameter maximization.
    pub fn update_all_params(
        &self,
        count: usize,
        round_index: usize,
        hyps: &mut Hyps,
        vp: &mut VariationalState,
        memo: &mut HashMap<(bool, usize), Array2<f64>>,
        mut logw_prev: f64,
    ) {
        let is_fwd_pass = count % 2 == 0;
        let chunks = if is_fwd_pass {
            &self.fwd_pass_chunks
        } else {
            &self.back_pass_chunks
        };

        if self.params.use_vb_on_covars {
            self.update_covar_effects(hyps, vp);
            self.check_monotonic_elbo(hyps, vp, count, &mut logw_prev, "update_covar_effects");
        }

        self.update_alpha_mu(chunks, is_fwd_pass, hyps, vp, memo);
        self.check_monotonic_elbo(hyps, vp, count, &mut logw_prev, "update_alpha_mu");

        if self.n_env > 1 {
            for _ in 0..self.params.env_update_repeats {
                self.update_env_weights(&self.env_fwd_pass, hyps, vp);
                self.update_env_weights(&self.env_back_pass, hyps, vp);
            }
            self.check_monotonic_elbo(hyps, vp, count, &mut logw_prev, "update_env_weights");
        }

        hyps.compute_pve(self.prior_beta, self.prior_gam);

        if round_index > 1 && self.params.mode_empirical_bayes && count >= self.params.burnin_maxhyps
        {
            self.maximise_hyps(hyps, vp);
            hyps.compute_pve(self.prior_beta, self.prior_gam);
        }
    }

    fn update_covar_effects(&self, hyps: &Hyps, vp: &mut VariationalState) {
        let c = match &self.c {
            Some(c) => c,
            None => return,
        };
        let nn = self.nn;
        for cc in 0..self.n_covar {
            let rr_k = vp.muc[cc];
            vp.sc_sq[cc] = hyps.sigma * SIGMA_C / (SIGMA_C * (nn - 1.) + 1.);

            let c_col = c.column(cc);
            let fitted = &vp.ym + &(&vp.yx * &vp.eta);
            let local = fitted.dot(&c_col);
            let a = self.cty[cc] - self.collective.sum_f64(local);
            vp.muc[cc] = vp.sc_sq[cc] * (a + rr_k * (nn - 1.)) / hyps.sigma;

            let rr_k_diff = vp.muc[cc] - rr_k;
            vp.ym.scaled_add(rr_k_diff, &c_col);
        }
    }

    /// Gauss-Seidel updates over all chunks of one pass, patching the
    /// residuals ym / yx chunk by chunk.
    fn update_alpha_mu(
        &self,
        chunks: &[Chunk],
        is_fwd_pass: bool,
        hyps: &Hyps,
        vp: &mut VariationalState,
        memo: &mut HashMap<(bool, usize), Array2<f64>>,
    ) {
        for (ch_ord, chunk) in chunks.iter().enumerate() {
            let ch_len = chunk.cols.len();
            let mut d = Array2::<f64>::zeros((self.n_samples, ch_len));
            self.x.col_block_into(&chunk.cols, d.view_mut());

            let mut a = self.compute_residual_correlation(&d, chunk.ee, vp);
            self.collective.all_reduce_sum(a.as_slice_mut().unwrap());

            let mut rr_diff = Array1::<f64>::zeros(ch_len);
            if chunk.ee == 0 {
                // D^T D is eta-independent, so it can be memoized per
                // (pass direction, chunk) on the single-threaded path
                let key = (is_fwd_pass, ch_ord);
                if self.params.n_thread == 1 {
                    if !memo.contains_key(&key) {
                        let mut d_corr = d.t().dot(&d);
                        self.collective.all_reduce_sum(d_corr.as_slice_mut().unwrap());
                        memo.insert(key, d_corr);
                    }
                    self.update_beta_chunk(&chunk.cols, &a, &memo[&key], hyps, vp, &mut rr_diff);
                } else {
                    let mut d_corr = d.t().dot(&d);
                    self.collective.all_reduce_sum(d_corr.as_slice_mut().unwrap());
                    self.update_beta_chunk(&chunk.cols, &a, &d_corr, hyps, vp, &mut rr_diff);
                }
                vp.ym += &d.dot(&rr_diff);
            } else {
                let d_corr = if ch_len > 1 {
                    let mut scaled = d.clone();
                    for (mut row, &w) in scaled.rows_mut().into_iter().zip(vp.eta_sq.iter()) {
                        row *= w;
                    }
                    let mut d_corr = d.t().dot(&scaled);
                    self.collective.all_reduce_sum(d_corr.as_slice_mut().unwrap());
                    d_corr
                } else {
                    Array2::zeros((ch_len, ch_len))
                };
                self.update_gamma_chunk(&chunk.cols, &a, &d_corr, hyps, vp, &mut rr_diff);
                vp.yx += &d.dot(&rr_diff);
            }
        }

        vp.calc_var_beta(self.prior_beta, self.prior_gam, self.n_effects);
    }

    /// Correlation of the chunk columns with the residual appropriate to
    /// the effect type being updated.
    fn compute_residual_correlation(
        &self,
        d: &Array2<f64>,
        ee: usize,
        vp: &VariationalState,
    ) -> Array1<f64> {
        if self.n_effects == 1 {
            let resid = &self.y - &vp.ym;
            d.t().dot(&resid)
        } else if ee == 0 {
            let resid = &self.y - &vp.ym - &(&vp.yx * &vp.eta);
            d.t().dot(&resid)
        } else {
            let resid = (&self.y - &vp.ym) * &vp.eta - &vp.yx * &vp.eta_sq;
            d.t().dot(&resid)
        }
    }

    fn update_beta_chunk(
        &self,
        cols: &[usize],
        a: &Array1<f64>,
        d_corr: &Array2<f64>,
        hyps: &Hyps,
        vp: &mut VariationalState,
        rr_diff: &mut Array1<f64>,
    ) {
        let ee = 0;
        let nn = self.nn;
        let mog = self.prior_beta.is_mog();
        let lam = hyps.lambda[ee];
        let alpha_cnst = if mog {
            (lam / (1. - lam) + EPS).ln()
                - (hyps.slab_var[ee].ln() - hyps.spike_var[ee].ln()) / 2.
        } else {
            (lam / (1. - lam) + EPS).ln() - hyps.slab_var[ee].ln() / 2.
        };

        for (ii, &jj) in cols.iter().enumerate() {
            let mut rr_k = vp.alpha_beta[jj] * vp.mu1_beta[jj];
            if mog {
                rr_k += (1. - vp.alpha_beta[jj]) * vp.mu2_beta[jj];
            }

            vp.s1_beta_sq[jj] =
                hyps.slab_var[ee] / (hyps.slab_relative_var[ee] * (nn - 1.) + 1.);
            if mog {
                vp.s2_beta_sq[jj] =
                    hyps.spike_var[ee] / (hyps.spike_relative_var[ee] * (nn - 1.) + 1.);
            }

            let mut offset = rr_k * (nn - 1.);
            for mm in 0..ii {
                offset -= rr_diff[mm] * d_corr[[mm, ii]];
            }
            let aa = a[ii] + offset;
            vp.mu1_beta[jj] = vp.s1_beta_sq[jj] * aa / hyps.sigma;
            if mog {
                vp.mu2_beta[jj] = vp.s2_beta_sq[jj] * aa / hyps.sigma;
            }

            let mut ff = vp.mu1_beta[jj] * vp.mu1_beta[jj] / vp.s1_beta_sq[jj]
                + vp.s1_beta_sq[jj].ln();
            if mog {
                ff -= vp.mu2_beta[jj] * vp.mu2_beta[jj] / vp.s2_beta_sq[jj]
                    + vp.s2_beta_sq[jj].ln();
            }
            vp.alpha_beta[jj] = sigmoid(ff / 2. + alpha_cnst);

            rr_diff[ii] = vp.alpha_beta[jj] * vp.mu1_beta[jj] - rr_k;
            if mog {
                rr_diff[ii] += (1. - vp.alpha_beta[jj]) * vp.mu2_beta[jj];
            }
        }
    }

    fn update_gamma_chunk(
        &self,
        cols: &[usize],
        a: &Array1<f64>,
        d_corr: &Array2<f64>,
        hyps: &Hyps,
        vp: &mut VariationalState,
        rr_diff: &mut Array1<f64>,
    ) {
        let ee = 1;
        let mog = self.prior_gam.is_mog();
        let lam = hyps.lambda[ee];
        let alpha_cnst = if mog {
            (lam / (1. - lam) + EPS).ln()
                - (hyps.slab_var[ee].ln() - hyps.spike_var[ee].ln()) / 2.
        } else {
            (lam / (1. - lam) + EPS).ln() - hyps.slab_var[ee].ln() / 2.
        };

        for (ii, &jj) in cols.iter().enumerate() {
            let mut rr_k = vp.alpha_gam[jj] * vp.mu1_gam[jj];
            if mog {
                rr_k += (1. - vp.alpha_gam[jj]) * vp.mu2_gam[jj];
            }

            let denom = vp.edztz[jj];
            vp.s1_gam_sq[jj] = hyps.slab_var[ee] / (hyps.slab_relative_var[ee] * denom + 1.);
            if mog {
                vp.s2_gam_sq[jj] = hyps.spike_var[ee] / (hyps.spike_relative_var[ee] * denom + 1.);
            }

            let mut offset = rr_k * denom;
            for mm in 0..ii {
                offset -= rr_diff[mm] * d_corr[[mm, ii]];
            }
            let aa = a[ii] + offset;
            vp.mu1_gam[jj] = vp.s1_gam_sq[jj] * aa / hyps.sigma;
            if mog {
                vp.mu2_gam[jj] = vp.s2_gam_sq[jj] * aa / hyps.sigma;
            }

            let mut ff =
                vp.mu1_gam[jj] * vp.mu1_gam[jj] / vp.s1_gam_sq[jj] + vp.s1_gam_sq[jj].ln();
            if mog {
                ff -= vp.mu2_gam[jj] * vp.mu2_gam[jj] / vp.s2_gam_sq[jj]
                    + vp.s2_gam_sq[jj].ln();
            }
            vp.alpha_gam[jj] = sigmoid(ff / 2. + alpha_cnst);

            rr_diff[ii] = vp.alpha_gam[jj] * vp.mu1_gam[jj] - rr_k;
            if mog {
                rr_diff[ii] += (1. - vp.alpha_gam[jj]) * vp.mu2_gam[jj];
            }
        }
    }

    fn update_env_weights(&self, order: &[usize], hyps: &mut Hyps, vp: &mut VariationalState) {
        let n_env = self.n_env;
        for &ll in order {
            let r_ll = vp.muw[ll];
            let e_col = self.e.column(ll);

            let yx_e = (&vp.yx * &e_col).mapv(|v| v * v).sum();
            let mut denom = hyps.sigma + self.collective.sum_f64(yx_e);
            denom += (&vp.var_gam * &self.dxteex.column(ll * n_env + ll)).sum();
            vp.sw_sq[ll] = hyps.sigma / denom;

            vp.eta.scaled_add(-r_ll, &e_col);

            let mut env_vars = Array1::<f64>::zeros(self.n_var);
            for mm in 0..n_env {
                if mm != ll {
                    env_vars.scaled_add(vp.muw[mm], &self.dxteex.column(ll * n_env + mm));
                }
            }

            let resid = &self.y - &vp.ym;
            let eff_local = (&resid * &e_col).dot(&vp.yx)
                - (&vp.yx * &e_col * &vp.eta).dot(&vp.yx);
            let mut eff = self.collective.sum_f64(eff_local);
            eff -= (&vp.var_gam * &env_vars).sum();
            vp.muw[ll] = vp.sw_sq[ll] * eff / hyps.sigma;

            vp.eta.scaled_add(vp.muw[ll], &e_col);
        }

        // eta_sq = eta^2 + E^2 s_w^2
        vp.eta_sq = &vp.eta * &vp.eta;
        vp.eta_sq += &self.e.mapv(|v| v * v).dot(&vp.sw_sq);

        vp.calc_edztz(&self.dxteex);

        hyps.s_x[0] = self.n_var as f64;
        hyps.s_x[1] = self.calc_s_z(&vp.muw);
    }

    /// Expectation of ||y - C tau - X beta - Z gamma||^2 under the
    /// current posterior.
    pub fn calc_exp_linear(&self, vp: &VariationalState) -> f64 {
        let resid = &self.y - &vp.ym;
        let mut sample_terms = [0f64; 3];
        sample_terms[0] = resid.dot(&resid);
        if self.n_effects > 1 {
            sample_terms[1] = (&resid * &vp.eta).dot(&vp.yx);
            if self.n_env > 1 {
                sample_terms[2] = (&vp.yx * &vp.eta_sq).dot(&vp.yx);
            } else {
                let yx_eta = &vp.yx * &vp.eta;
                sample_terms[2] = yx_eta.dot(&yx_eta);
            }
        }
        self.collective.all_reduce_sum(&mut sample_terms);

        let mut int_linear = sample_terms[0];
        if self.n_effects > 1 {
            int_linear -= 2. * sample_terms[1];
            int_linear += sample_terms[2];
        }

        if self.params.use_vb_on_covars {
            int_linear += (self.nn - 1.) * vp.sc_sq.sum();
        }
        int_linear += (self.nn - 1.) * vp.var_beta.sum();
        if self.n_effects > 1 {
            int_linear += (&vp.edztz * &vp.var_gam).sum();
        }
        int_linear
    }

    fn calc_int_kl_beta(&self, hyps: &Hyps, vp: &VariationalState) -> f64 {
        let ee = 0;
        let n_var = self.n_var as f64;
        let mut res;
        if self.prior_beta.is_mog() {
            res = n_var / 2.;
            res -= (&vp.alpha_beta
                * &(&(&vp.mu1_beta * &vp.mu1_beta) + &vp.s1_beta_sq))
                .sum()
                / 2.
                / hyps.slab_var[ee];
            res += (&vp.alpha_beta * &vp.s1_beta_sq.mapv(f64::ln)).sum() / 2.;

            let one_minus_alpha = vp.alpha_beta.mapv(|a| 1. - a);
            res -= (&one_minus_alpha * &(&(&vp.mu2_beta * &vp.mu2_beta) + &vp.s2_beta_sq)).sum()
                / 2.
                / hyps.spike_var[ee];
            res += (&one_minus_alpha * &vp.s2_beta_sq.mapv(f64::ln)).sum() / 2.;

            let col_sum = vp.alpha_beta.sum();
            res -= hyps.slab_var[ee].ln() * col_sum / 2.;
            res -= hyps.spike_var[ee].ln() * (n_var - col_sum) / 2.;
        } else {
            res = (&vp.alpha_beta * &vp.s1_beta_sq.mapv(f64::ln)).sum() / 2.;
            res -= (&vp.alpha_beta
                * &(&(&vp.mu1_beta * &vp.mu1_beta) + &vp.s1_beta_sq))
                .sum()
                / 2.
                / hyps.slab_var[ee];

            let col_sum = vp.alpha_beta.sum();
            res += col_sum * (1. - hyps.slab_var[ee].ln()) / 2.;
        }

        for &alpha in vp.alpha_beta.iter() {
            res -= alpha * (alpha + EPS).ln();
            res -= (1. - alpha) * (1. - alpha + EPS).ln();
        }
        res
    }

    fn calc_int_kl_gamma(&self, hyps: &Hyps, vp: &VariationalState) -> f64 {
        let ee = 1;
        let n_var = self.n_var as f64;
        let mut res;
        if self.prior_gam.is_mog() {
            res = n_var / 2.;
            res -= (&vp.alpha_gam * &(&(&vp.mu1_gam * &vp.mu1_gam) + &vp.s1_gam_sq)).sum()
                / 2.
                / hyps.slab_var[ee];
            res += (&vp.alpha_gam * &vp.s1_gam_sq.mapv(f64::ln)).sum() / 2.;

            let one_minus_alpha = vp.alpha_gam.mapv(|a| 1. - a);
            res -= (&one_minus_alpha * &(&(&vp.mu2_gam * &vp.mu2_gam) + &vp.s2_gam_sq)).sum()
                / 2.
                / hyps.spike_var[ee];
            res += (&one_minus_alpha * &vp.s2_gam_sq.mapv(f64::ln)).sum() / 2.;

            let col_sum = vp.alpha_gam.sum();
            res -= hyps.slab_var[ee].ln() * col_sum / 2.;
            res -= hyps.spike_var[ee].ln() * (n_var - col_sum) / 2.;
        } else {
            res = (&vp.alpha_gam * &vp.s1_gam_sq.mapv(f64::ln)).sum() / 2.;
            res -= (&vp.alpha_gam * &(&(&vp.mu1_gam * &vp.mu1_gam) + &vp.s1_gam_sq)).sum()
                / 2.
                / hyps.slab_var[ee];

            let col_sum = vp.alpha_gam.sum();
            res += col_sum * (1. - hyps.slab_var[ee].ln()) / 2.;
        }

        for &alpha in vp.alpha_gam.iter() {
            res -= alpha * (alpha + EPS).ln();
            res -= (1. - alpha) * (1. - alpha + EPS).ln();
        }
        res
    }

    /// Evidence lower bound for one grid point.
    pub fn calc_elbo(&self, hyps: &Hyps, vp: &VariationalState) -> f64 {
        use std::f64::consts::PI;

        let mut int_linear = -1.0 * self.calc_exp_linear(vp) / 2.0 / hyps.sigma;
        int_linear -= self.nn * (2.0 * PI * hyps.sigma).ln() / 2.0;

        let n_var = self.n_var as f64;
        let mut int_gamma = 0.;
        for ee in 0..self.n_effects {
            let col_sum = if ee == 0 {
                vp.alpha_beta.sum()
            } else {
                vp.alpha_gam.sum()
            };
            int_gamma += col_sum * (hyps.lambda[ee] + EPS).ln();
            int_gamma -= col_sum * (1. - hyps.lambda[ee] + EPS).ln();
            int_gamma += n_var * (1. - hyps.lambda[ee] + EPS).ln();
        }

        let mut int_klbeta = self.calc_int_kl_beta(hyps, vp);
        if self.n_effects > 1 {
            int_klbeta += self.calc_int_kl_gamma(hyps, vp);
        }

        let mut kl_covar = 0.;
        if self.params.use_vb_on_covars {
            kl_covar += self.n_covar as f64 * (1. - hyps.sigma * SIGMA_C) / 2.;
            kl_covar += vp.sc_sq.mapv(f64::ln).sum() / 2.;
            kl_covar -= vp.sc_sq.sum() / 2. / hyps.sigma / SIGMA_C;
            kl_covar -= vp.muc.dot(&vp.muc) / 2. / hyps.sigma / SIGMA_C;
        }

        let mut kl_weights = 0.;
        if self.n_env > 1 {
            kl_weights += self.n_env as f64 / 2.;
            kl_weights += vp.sw_sq.mapv(f64::ln).sum() / 2.;
            kl_weights -= vp.sw_sq.sum() / 2.;
            kl_weights -= vp.muw.dot(&vp.muw) / 2.;
        }

        int_linear + int_gamma + int_klbeta + kl_covar + kl_weights
    }

    /// Closed-form empirical-Bayes updates of sigma, lambda and the
    /// slab/spike variances from the current posterior moments.
    pub fn maximise_hyps(&self, hyps: &mut Hyps, vp: &VariationalState) {
        let n_var = self.n_var as f64;

        let mut sigma = self.calc_exp_linear(vp);
        if self.params.use_vb_on_covars {
            sigma += (&vp.sc_sq + &(&vp.muc * &vp.muc)).sum() / SIGMA_C;
            sigma /= self.nn + self.n_covar as f64;
        } else {
            sigma /= self.nn;
        }
        hyps.sigma = sigma;

        // beta
        let ee = 0;
        let mut lambda = vp.alpha_beta.sum();
        hyps.slab_var[ee] = (&vp.alpha_beta
            * &(&vp.s1_beta_sq + &(&vp.mu1_beta * &vp.mu1_beta)))
            .sum()
            / lambda;
        hyps.slab_relative_var[ee] = hyps.slab_var[ee] / sigma;
        if self.prior_beta.is_mog() {
            let one_minus_alpha = vp.alpha_beta.mapv(|a| 1. - a);
            hyps.spike_var[ee] = (&one_minus_alpha
                * &(&vp.s2_beta_sq + &(&vp.mu2_beta * &vp.mu2_beta)))
                .sum()
                / (n_var - lambda);
            hyps.spike_relative_var[ee] = hyps.spike_var[ee] / sigma;
        }
        lambda /= n_var;
        hyps.lambda[ee] = lambda;

        // gamma
        if self.n_effects > 1 {
            let ee = 1;
            let mut lambda = vp.alpha_gam.sum();
            hyps.slab_var[ee] = (&vp.alpha_gam
                * &(&vp.s1_gam_sq + &(&vp.mu1_gam * &vp.mu1_gam)))
                .sum()
                / lambda;
            hyps.slab_relative_var[ee] = hyps.slab_var[ee] / sigma;
            if self.prior_gam.is_mog() {
                let one_minus_alpha = vp.alpha_gam.mapv(|a| 1. - a);
                hyps.spike_var[ee] = (&one_minus_alpha
                    * &(&vp.s2_gam_sq + &(&vp.mu2_gam * &vp.mu2_gam)))
                    .sum()
                    / (n_var - lambda);
                hyps.spike_relative_var[ee] = hyps.spike_var[ee] / sigma;
            }
            lambda /= n_var;
            hyps.lambda[ee] = lambda;
        }
    }

    fn check_monotonic_elbo(
        &self,
        hyps: &Hyps,
        vp: &VariationalState,
        count: usize,
        logw_prev: &mut f64,
        prev_function: &str,
    ) {
        let i_logw = self.calc_elbo(hyps, vp);
        if i_logw < *logw_prev {
            println!(
                "{}: {} {} -> {} (difference of {})",
                count, prev_function, logw_prev, i_logw, i_logw - *logw_prev
            );
        }
        *logw_prev = i_logw;
    }
}
