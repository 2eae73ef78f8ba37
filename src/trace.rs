use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::QR;

use crate::collective::Collective;
use crate::error::Error;
use crate::projection::CovariateProjector;

/// One variance component of the Haseman-Elston system: accumulates
/// per-jackknife-block X X^T z products and y^T X X^T y scalars over the
/// chunk stream. The GxE component operates on Z = diag(eta) X by scaling
/// its private copies of y, z and Wz on entry and multiplying the
/// accumulated buffers back by eta on finalize.
pub struct TraceComponent {
    pub label: String,
    is_active: bool,
    eta: Option<Array1<f64>>,
    y: Array1<f64>,
    zz: Array2<f64>,
    wzz: Array2<f64>,
    n_covar: usize,
    n_draws: usize,

    xxtz_blocks: Vec<Array2<f64>>,
    xxtwz_blocks: Vec<Array2<f64>>,
    yt_xxt_y_blocks: Vec<f64>,
    n_var_blocks: Vec<f64>,

    xxtz: Array2<f64>,
    xxtwz: Array2<f64>,
    yt_xxt_y: f64,
    n_var: f64,
}

impl TraceComponent {
    fn new(
        label: &str,
        y: Array1<f64>,
        zz: Array2<f64>,
        wzz: Array2<f64>,
        n_covar: usize,
        n_jackknife: usize,
    ) -> TraceComponent {
        let (n_samples, n_draws) = zz.dim();
        TraceComponent {
            label: label.to_string(),
            is_active: true,
            eta: None,
            y,
            zz,
            wzz,
            n_covar,
            n_draws,
            xxtz_blocks: vec![Array2::zeros((n_samples, n_draws)); n_jackknife],
            xxtwz_blocks: vec![Array2::zeros((n_samples, n_draws)); n_jackknife],
            yt_xxt_y_blocks: vec![0.; n_jackknife],
            n_var_blocks: vec![0.; n_jackknife],
            xxtz: Array2::zeros((n_samples, n_draws)),
            xxtwz: Array2::zeros((n_samples, n_draws)),
            yt_xxt_y: 0.,
            n_var: 0.,
        }
    }

    fn set_eta(&mut self, eta: Array1<f64>) {
        assert!(self.is_active);
        self.y *= &eta;
        for mut col in self.zz.axis_iter_mut(Axis(1)) {
            col *= &eta;
        }
        for mut col in self.wzz.axis_iter_mut(Axis(1)) {
            col *= &eta;
        }
        self.eta = Some(eta);
    }

    /// The inactive component stands in for the noise term sigma_e.
    fn set_inactive(&mut self) {
        assert!(self.eta.is_none());
        self.is_active = false;
        self.xxtz = self.zz.clone();
        self.xxtwz = self.wzz.clone();
        self.n_var = 1.;
        self.yt_xxt_y = self.y.dot(&self.y);
    }

    fn add_chunk(&mut self, d: &ArrayView2<f64>, jackknife_index: usize) {
        assert!(jackknife_index < self.n_var_blocks.len());
        if !self.is_active {
            return;
        }
        let dty = d.t().dot(&self.y);
        self.yt_xxt_y_blocks[jackknife_index] += dty.dot(&dty);
        let dtz = d.t().dot(&self.zz);
        self.xxtz_blocks[jackknife_index] += &d.dot(&dtz);
        if self.n_covar > 0 {
            let dtwz = d.t().dot(&self.wzz);
            self.xxtwz_blocks[jackknife_index] += &d.dot(&dtwz);
        }
        self.n_var_blocks[jackknife_index] += d.dim().1 as f64;
    }

    fn finalize(&mut self, collective: &dyn Collective) {
        if !self.is_active {
            return;
        }
        if let Some(eta) = &self.eta {
            for block in self.xxtz_blocks.iter_mut().chain(self.xxtwz_blocks.iter_mut()) {
                for mut col in block.axis_iter_mut(Axis(1)) {
                    col *= eta;
                }
            }
        }
        for block in &mut self.xxtz_blocks {
            collective.all_reduce_sum(block.as_slice_mut().unwrap());
        }
        for block in &mut self.xxtwz_blocks {
            collective.all_reduce_sum(block.as_slice_mut().unwrap());
        }
        collective.all_reduce_sum(&mut self.yt_xxt_y_blocks);
        collective.all_reduce_sum(&mut self.n_var_blocks);

        self.xxtz.fill(0.);
        self.xxtwz.fill(0.);
        for block in &self.xxtz_blocks {
            self.xxtz += block;
        }
        for block in &self.xxtwz_blocks {
            self.xxtwz += block;
        }
        self.n_var = self.n_var_blocks.iter().sum();
        self.yt_xxt_y = self.yt_xxt_y_blocks.iter().sum();
    }

    fn xxtz(&self, rm_block: Option<usize>) -> Array2<f64> {
        match rm_block {
            Some(jj) if self.is_active => &self.xxtz - &self.xxtz_blocks[jj],
            _ => self.xxtz.clone(),
        }
    }

    fn xxtwz(&self, rm_block: Option<usize>) -> Array2<f64> {
        match rm_block {
            Some(jj) if self.is_active => &self.xxtwz - &self.xxtwz_blocks[jj],
            _ => self.xxtwz.clone(),
        }
    }

    pub fn n_var_local(&self, rm_block: Option<usize>) -> f64 {
        match rm_block {
            Some(jj) if self.is_active => self.n_var - self.n_var_blocks[jj],
            _ => self.n_var,
        }
    }

    pub fn n_var_in_block(&self, jj: usize) -> f64 {
        self.n_var_blocks[jj]
    }

    /// y^T X X^T y / n_var; the right-hand side of the component's row.
    fn bb_trace(&self, rm_block: Option<usize>) -> f64 {
        let yty = match rm_block {
            Some(jj) if self.is_active => self.yt_xxt_y - self.yt_xxt_y_blocks[jj],
            _ => self.yt_xxt_y,
        };
        yty / self.n_var_local(rm_block)
    }

    fn inner_product(
        &self,
        other: &TraceComponent,
        rm_block: Option<usize>,
        projector: Option<&CovariateProjector>,
    ) -> f64 {
        let res = if self.n_covar == 0 {
            (&self.xxtz(rm_block) * &other.xxtz(rm_block)).sum()
        } else if self.label == "noise" || other.label == "noise" {
            (&self.xxtz(rm_block) * &other.xxtwz(rm_block)).sum()
        } else {
            let projected = projector
                .expect("covariate projection requested without a projector")
                .project(&self.xxtz(rm_block));
            (&projected * &other.xxtwz(rm_block)).sum()
        };
        res / self.n_var_local(rm_block) / other.n_var_local(rm_block) / self.n_draws as f64
    }
}

/// Jackknife block size over the cumulative-position axis. Both the
/// in-memory and the streaming ingest paths bucket chunks by the first
/// column's cumulative position divided by this size, which is what makes
/// their results identical.
pub fn jackknife_block_size(genome_span: u64, n_jackknife: usize) -> u64 {
    ((genome_span + n_jackknife as u64 - 1) / n_jackknife as u64).max(1)
}

/// Estimates of the variance-component system with jackknife errors.
#[derive(Clone, Debug)]
pub struct RheEstimates {
    pub labels: Vec<String>,
    pub sigmas: Array1<f64>,
    pub h2: Array1<f64>,
    pub h2_se: Array1<f64>,
    pub h2_bias_corrected: Array1<f64>,
    pub h2_reweighted: Array1<f64>,
    pub h2_reweighted_se: Array1<f64>,
    pub h2_reweighted_bias_corrected: Array1<f64>,
    pub h2_jack: Array2<f64>,
    pub n_var_jack: Array1<f64>,
    /// h2 of the main component under the 2x2 (G, noise) subsystem.
    pub h2_main_effects_only: Option<f64>,
}

/// Streaming randomized Haseman-Elston estimator.
pub struct TraceEstimator<'a> {
    pub components: Vec<TraceComponent>,
    projector: Option<&'a CovariateProjector>,
    n_samples: usize,
    n_covar: usize,
    n_draws: usize,
    n_jackknife: usize,
    jack_block_size: u64,
    main: usize,
    gxe: Option<usize>,
    noise: usize,
    finalized: bool,
}

impl<'a> TraceEstimator<'a> {
    /// `y` must already be mean-centered; when a projector is supplied,
    /// y and the draws are projected here. `eta` switches on the GxE
    /// component. Fails when one component's per-block buffers would
    /// exceed `max_bytes_per_rank`.
    pub fn new(
        y: &Array1<f64>,
        zz: Array2<f64>,
        eta: Option<&Array1<f64>>,
        n_jackknife: usize,
        genome_span: u64,
        projector: Option<&'a CovariateProjector>,
        max_bytes_per_rank: usize,
    ) -> Result<TraceEstimator<'a>, Error> {
        let (n_samples, n_draws) = zz.dim();
        assert_eq!(y.len(), n_samples);
        assert!(n_jackknife > 0);

        let block_buffer_bytes = 8 * n_samples * n_draws * n_jackknife * 2;
        if block_buffer_bytes > max_bytes_per_rank {
            return Err(Error::MemoryBudget(format!(
                "per-component trace buffers need {} bytes (N={} x B={} x J={}), \
                 above the {} byte per-rank cap; reduce the samples per rank",
                block_buffer_bytes, n_samples, n_draws, n_jackknife, max_bytes_per_rank
            )));
        }

        let n_covar = projector.map_or(0, |p| p.n_covar());
        let (y, wzz) = match projector {
            Some(p) => (p.project_vec(y), p.project(&zz)),
            None => (y.clone(), zz.clone()),
        };

        let mut components = Vec::new();
        components.push(TraceComponent::new("G", y.clone(), zz.clone(), wzz.clone(), n_covar, n_jackknife));
        let mut gxe = None;
        if let Some(eta) = eta {
            let mut comp = TraceComponent::new("GxE", y.clone(), zz.clone(), wzz.clone(), n_covar, n_jackknife);
            comp.set_eta(eta.clone());
            gxe = Some(components.len());
            components.push(comp);
        }
        let mut noise = TraceComponent::new("noise", y, zz, wzz, n_covar, n_jackknife);
        noise.set_inactive();
        let noise_index = components.len();
        components.push(noise);

        Ok(TraceEstimator {
            components,
            projector,
            n_samples,
            n_covar,
            n_draws,
            n_jackknife,
            jack_block_size: jackknife_block_size(genome_span, n_jackknife),
            main: 0,
            gxe,
            noise: noise_index,
            finalized: false,
        })
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    /// Jackknife bucket for a chunk whose first column sits at
    /// `first_cum_pos` on the cumulative-position axis.
    pub fn jackknife_index(&self, first_cum_pos: u64) -> usize {
        ((first_cum_pos / self.jack_block_size) as usize).min(self.n_jackknife - 1)
    }

    /// Accumulates one standardized N x m chunk into every active
    /// component.
    pub fn add_chunk(&mut self, d: &ArrayView2<f64>, first_cum_pos: u64) {
        assert!(!self.finalized);
        let jackknife_index = self.jackknife_index(first_cum_pos);
        for comp in &mut self.components {
            comp.add_chunk(d, jackknife_index);
        }
    }

    /// Sums block buffers into totals across jackknife blocks and ranks.
    pub fn finalize(&mut self, collective: &dyn Collective) {
        for comp in &mut self.components {
            comp.finalize(collective);
        }
        self.finalized = true;
    }

    pub fn n_var_total(&self) -> f64 {
        self.components[self.main].n_var_local(None)
    }

    /// The (C+1) x (C+1) system: entry (i,k) is the pairwise component
    /// inner product; the noise diagonal is N - K; the last column holds
    /// the right-hand side y^T X X^T y / n_var.
    pub fn build_system(&self, rm_block: Option<usize>) -> (Array2<f64>, Array1<f64>) {
        assert!(self.finalized);
        let nc = self.components.len();
        let mut a = Array2::<f64>::zeros((nc, nc));
        let mut b = Array1::<f64>::zeros(nc);
        for ii in 0..nc {
            b[ii] = self.components[ii].bb_trace(rm_block);
            for jj in 0..=ii {
                if ii == jj && self.components[ii].label == "noise" {
                    a[[ii, jj]] = (self.n_samples - self.n_covar) as f64;
                } else {
                    let v = self.components[ii].inner_product(
                        &self.components[jj],
                        rm_block,
                        self.projector,
                    );
                    a[[ii, jj]] = v;
                    a[[jj, ii]] = v;
                }
            }
        }
        (a, b)
    }

    /// Variance-component estimates, optionally with one jackknife block
    /// deleted. A rank-deficient system yields a zero vector with a
    /// warning rather than an error.
    pub fn solve(&self, rm_block: Option<usize>) -> Array1<f64> {
        let (a, b) = self.build_system(rm_block);
        solve_vc_system(&a, &b)
    }

    /// sigma / sum(sigma); `reweight_by_s_x` rescales by the noise row of
    /// the system matrix over N first.
    pub fn heritability(&self, rm_block: Option<usize>, reweight_by_s_x: bool) -> Array1<f64> {
        let (a, b) = self.build_system(rm_block);
        calc_h2(&a, &b, self.n_samples, reweight_by_s_x)
    }

    /// Full estimates with delete-one jackknife standard errors and bias
    /// correction, plus the main-effects-only h2 when GxE is present.
    pub fn estimate(&self) -> RheEstimates {
        assert!(self.finalized);
        let nc = self.components.len();
        let (a, b) = self.build_system(None);
        let sigmas = solve_vc_system(&a, &b);
        let h2 = calc_h2(&a, &b, self.n_samples, false);
        let h2b = calc_h2(&a, &b, self.n_samples, true);

        let n_var = self.n_var_total();
        let mut h2_jack = Array2::<f64>::zeros((self.n_jackknife, nc));
        let mut h2b_jack = Array2::<f64>::zeros((self.n_jackknife, nc));
        let mut n_var_jack = Array1::<f64>::zeros(self.n_jackknife);
        for jj in 0..self.n_jackknife {
            let (aj, bj) = self.build_system(Some(jj));
            n_var_jack[jj] = self.components[self.main].n_var_local(Some(jj));
            h2_jack.slice_mut(s![jj, ..]).assign(&calc_h2(&aj, &bj, self.n_samples, false));
            h2b_jack.slice_mut(s![jj, ..]).assign(&calc_h2(&aj, &bj, self.n_samples, true));
        }

        // rescale the genetic components for the smaller delete-one
        // variant counts
        for ii in 0..nc {
            if self.components[ii].label == "noise" {
                continue;
            }
            for jj in 0..self.n_jackknife {
                h2_jack[[jj, ii]] *= n_var / n_var_jack[jj];
                h2b_jack[[jj, ii]] *= n_var / n_var_jack[jj];
            }
        }

        let mut h2_se = Array1::<f64>::zeros(nc);
        let mut h2b_se = Array1::<f64>::zeros(nc);
        let mut h2_bc = Array1::<f64>::zeros(nc);
        let mut h2b_bc = Array1::<f64>::zeros(nc);
        for ii in 0..nc {
            h2_se[ii] = jackknife_variance(&h2_jack.column(ii).to_owned()).sqrt();
            h2b_se[ii] = jackknife_variance(&h2b_jack.column(ii).to_owned()).sqrt();
            h2_bc[ii] = jackknife_bias_correct(&h2_jack.column(ii).to_owned(), h2[ii]);
            h2b_bc[ii] = jackknife_bias_correct(&h2b_jack.column(ii).to_owned(), h2b[ii]);
        }

        let h2_main_effects_only = self.gxe.map(|_| {
            let mut a1 = Array2::<f64>::zeros((2, 2));
            let mut b1 = Array1::<f64>::zeros(2);
            for (r, &ci) in [self.main, self.noise].iter().enumerate() {
                b1[r] = b[ci];
                for (c, &cj) in [self.main, self.noise].iter().enumerate() {
                    a1[[r, c]] = a[[ci, cj]];
                }
            }
            let s1 = solve_vc_system(&a1, &b1);
            s1[0] / s1.sum()
        });

        RheEstimates {
            labels: self.components.iter().map(|c| c.label.clone()).collect(),
            sigmas,
            h2,
            h2_se,
            h2_bias_corrected: h2_bc,
            h2_reweighted: h2b,
            h2_reweighted_se: h2b_se,
            h2_reweighted_bias_corrected: h2b_bc,
            h2_jack,
            n_var_jack,
            h2_main_effects_only,
        }
    }
}

/// Column-pivot-free QR solve with an explicit near-zero pivot check; a
/// rank-deficient system is reported and yields zeros.
pub fn solve_vc_system(a: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    match qr_solve(a, b) {
        Ok(x) => x,
        Err(why) => {
            eprintln!("WARNING: {}; returning zero variance components", why);
            Array1::zeros(b.len())
        }
    }
}

fn qr_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, Error> {
    let n = b.len();
    let (q, r) = a
        .qr()
        .map_err(|why| Error::Numerical(format!("QR factorization failed: {}", why)))?;
    let max_pivot = r.diag().iter().fold(0f64, |acc, x| acc.max(x.abs()));
    let min_pivot = r.diag().iter().fold(f64::INFINITY, |acc, x| acc.min(x.abs()));
    if max_pivot <= 0. || min_pivot < 1e-12 * max_pivot {
        return Err(Error::Numerical(format!(
            "variance-component system is rank deficient (pivot ratio {:.3e})",
            min_pivot / max_pivot
        )));
    }
    let qtb = q.t().dot(b);
    let mut x = Array1::<f64>::zeros(n);
    for ii in (0..n).rev() {
        let mut acc = qtb[ii];
        for kk in ii + 1..n {
            acc -= r[[ii, kk]] * x[kk];
        }
        x[ii] = acc / r[[ii, ii]];
    }
    Ok(x)
}

fn calc_h2(a: &Array2<f64>, b: &Array1<f64>, n_samples: usize, reweight_by_s_x: bool) -> Array1<f64> {
    let mut ss = solve_vc_system(a, b);
    if reweight_by_s_x {
        let bottom = a.row(a.dim().0 - 1);
        for (s, &w) in ss.iter_mut().zip(bottom.iter()) {
            *s *= w / n_samples as f64;
        }
    }
    let total = ss.sum();
    ss.mapv(|v| v / total)
}

pub fn jackknife_variance(estimates: &Array1<f64>) -> f64 {
    let nn = estimates.len() as f64;
    let mean = estimates.sum() / nn;
    estimates.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() * (nn - 1.) / nn
}

pub fn jackknife_bias_correct(estimates: &Array1<f64>, full_estimate: f64) -> f64 {
    let nn = estimates.len() as f64;
    let mean = estimates.sum() / nn;
    nn * full_estimate - (nn - 1.) * mean
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array1, Axis};

    use crate::collective::SingleProcess;
    use crate::genotype::{GenotypeView, VariantRecord};
    use crate::random::RandomDraws;

    use super::{jackknife_bias_correct, jackknife_variance, solve_vc_system, TraceEstimator};

    fn toy_view(n_samples: usize, n_var: usize, seed: u64) -> GenotypeView {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_pcg::Pcg64::seed_from_u64(seed);
        let records: Vec<VariantRecord> = (0..n_var)
            .map(|j| VariantRecord {
                chromosome: 1 + (j * 2 / n_var) as u8,
                rsid: format!("rs{}", j),
                position: 100 * (j as u32 + 1),
                a0: "A".to_string(),
                a1: "G".to_string(),
                maf: f64::NAN,
                info: 1.,
                dosages: (0..n_samples).map(|_| rng.gen_range(0..3) as f64).collect(),
            })
            .collect();
        GenotypeView::from_records(records, n_samples).unwrap()
    }

    fn centered_y(n: usize, seed: u64) -> Array1<f64> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_pcg::Pcg64::seed_from_u64(seed);
        let mut y: Array1<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let m = y.sum() / n as f64;
        y -= m;
        y
    }

    #[test]
    fn test_qr_solve_recovers_known_solution() {
        let a = arr2(&[[4., 1., 0.], [1., 3., 1.], [0., 1., 2.]]);
        let x_true = arr1(&[1., -2., 0.5]);
        let b = a.dot(&x_true);
        let x = solve_vc_system(&a, &b);
        for (xi, ti) in x.iter().zip(x_true.iter()) {
            assert!((xi - ti).abs() < 1e-10);
        }
    }

    #[test]
    fn test_singular_system_yields_zeros() {
        let a = arr2(&[[1., 2.], [2., 4.]]);
        let b = arr1(&[1., 2.]);
        let x = solve_vc_system(&a, &b);
        assert_eq!(x, arr1(&[0., 0.]));
    }

    #[test]
    fn test_jackknife_identities() {
        let est = arr1(&[1.0, 1.2, 0.9, 1.1, 0.8]);
        let var = jackknife_variance(&est);
        assert!(var > 0.);
        // bias correction of a constant sequence is the full estimate
        let flat = Array1::from_elem(5, 2.5);
        assert!((jackknife_bias_correct(&flat, 2.5) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_delete_one_block_equals_global_minus_block() {
        let n = 30;
        let view = toy_view(n, 24, 3);
        let y = centered_y(n, 4);
        let zz = RandomDraws::new(9).standard_gaussian(n, 6);
        let span = view.cumulative_pos(view.n_variants() - 1);
        let mut est = TraceEstimator::new(&y, zz, None, 4, span, None, usize::MAX / 2).unwrap();
        for (start, block) in view.col_chunk_iter(5) {
            est.add_chunk(&block.view(), view.cumulative_pos(start));
        }
        est.finalize(&SingleProcess);

        let total: f64 = (0..4).map(|jj| est.components[0].n_var_in_block(jj)).sum();
        assert!((total - view.n_variants() as f64).abs() < 1e-12);
        for jj in 0..4 {
            let removed = est.components[0].n_var_local(Some(jj));
            let block = est.components[0].n_var_in_block(jj);
            assert!((total - removed - block).abs() < 1e-12);
        }
    }

    #[test]
    fn test_noise_only_model_attributes_variance_to_noise() {
        // independent y: expect sigma_G near zero, noise near var(y)
        let n = 400;
        let view = toy_view(n, 60, 11);
        let y = centered_y(n, 12);
        let zz = RandomDraws::new(5).standard_gaussian(n, 20);
        let span = view.cumulative_pos(view.n_variants() - 1);
        let mut est = TraceEstimator::new(&y, zz, None, 5, span, None, usize::MAX / 2).unwrap();
        for (start, block) in view.col_chunk_iter(16) {
            est.add_chunk(&block.view(), view.cumulative_pos(start));
        }
        est.finalize(&SingleProcess);
        let h2 = est.heritability(None, false);
        assert!(h2.len() == 2);
        assert!((h2.sum() - 1.).abs() < 1e-9);
        assert!(h2[1] > h2[0], "noise share {} should dominate {}", h2[1], h2[0]);
    }

    #[test]
    fn test_streaming_matches_in_memory_ingest() {
        let n = 50;
        let view = toy_view(n, 40, 21);
        let y = centered_y(n, 22);
        let span = view.cumulative_pos(view.n_variants() - 1);
        let eta = centered_y(n, 23);

        let zz = RandomDraws::new(1).standard_gaussian(n, 8);
        let mut in_memory =
            TraceEstimator::new(&y, zz.clone(), Some(&eta), 6, span, None, usize::MAX / 2).unwrap();
        for (start, block) in view.col_chunk_iter(40) {
            in_memory.add_chunk(&block.view(), view.cumulative_pos(start));
        }
        in_memory.finalize(&SingleProcess);

        // stream one small chunk at a time
        let mut streaming =
            TraceEstimator::new(&y, zz, Some(&eta), 6, span, None, usize::MAX / 2).unwrap();
        for (start, block) in view.col_chunk_iter(7) {
            streaming.add_chunk(&block.view(), view.cumulative_pos(start));
        }
        streaming.finalize(&SingleProcess);

        let a = in_memory.solve(None);
        let b = streaming.solve(None);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9, "{} vs {}", x, y);
        }
        for jj in 0..6 {
            let a = in_memory.solve(Some(jj));
            let b = streaming.solve(Some(jj));
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_estimate_produces_full_summary() {
        let n = 60;
        let view = toy_view(n, 50, 31);
        let y = centered_y(n, 32);
        let eta = centered_y(n, 33);
        let zz = RandomDraws::new(2).standard_gaussian(n, 10);
        let span = view.cumulative_pos(view.n_variants() - 1);
        let mut est = TraceEstimator::new(&y, zz, Some(&eta), 5, span, None, usize::MAX / 2).unwrap();
        for (start, block) in view.col_chunk_iter(10) {
            est.add_chunk(&block.view(), view.cumulative_pos(start));
        }
        est.finalize(&SingleProcess);
        let summary = est.estimate();
        assert_eq!(summary.labels, vec!["G", "GxE", "noise"]);
        assert_eq!(summary.h2_jack.len_of(Axis(0)), 5);
        assert!((summary.h2.sum() - 1.).abs() < 1e-9);
        assert!(summary.h2_main_effects_only.is_some());
        assert!(summary.h2_se.iter().all(|se| se.is_finite()));
    }

    #[test]
    fn test_buffer_cap_enforced() {
        let n = 50;
        let y = centered_y(n, 1);
        let zz = RandomDraws::new(1).standard_gaussian(n, 10);
        assert!(TraceEstimator::new(&y, zz, None, 10, 1000, None, 1024).is_err());
    }
}
