use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Prior family for one effect type, dispatched by match in the update
/// loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prior {
    SpikeSlab,
    MixtureOfGaussians,
}

impl Prior {
    pub fn is_mog(self) -> bool {
        self == Prior::MixtureOfGaussians
    }
}

/// Column order of the hyperparameter grid.
pub const HYPS_NAMES: [&str; 5] = ["sigma", "sigma_b", "sigma_g", "lambda_b", "lambda_g"];

const SIGMA_IND: usize = 0;
const SIGMA_B_IND: usize = 1;
const SIGMA_G_IND: usize = 2;
const LAM_B_IND: usize = 3;
const LAM_G_IND: usize = 4;

/// Hyperparameters for one grid point. Indices into the per-effect
/// vectors are 0 = main, 1 = interaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyps {
    pub sigma: f64,
    pub lambda: Array1<f64>,
    pub slab_var: Array1<f64>,
    pub spike_var: Array1<f64>,
    pub slab_relative_var: Array1<f64>,
    pub spike_relative_var: Array1<f64>,
    /// Sum of column variances per effect design: s_x[0] = P,
    /// s_x[1] = sum of column variances of diag(eta) X.
    pub s_x: Array1<f64>,
    pub pve: Array1<f64>,
    pub pve_large: Array1<f64>,
}

impl Hyps {
    /// Unpacks one validated grid row. `s_z` supplies s_x[1] and is
    /// required when `n_effects == 2`.
    pub fn init_from_grid(
        grid_row: ArrayView1<f64>,
        n_effects: usize,
        n_var: usize,
        spike_diff_factor: f64,
        s_z: Option<f64>,
    ) -> Hyps {
        assert!(n_effects == 1 || n_effects == 2);
        let sigma = grid_row[SIGMA_IND];
        let sigma_b = grid_row[SIGMA_B_IND];
        let sigma_g = grid_row[SIGMA_G_IND];
        let lam_b = grid_row[LAM_B_IND];
        let lam_g = grid_row[LAM_G_IND];

        let take = |main: f64, gxe: f64| -> Array1<f64> {
            if n_effects == 1 {
                ndarray::arr1(&[main])
            } else {
                ndarray::arr1(&[main, gxe])
            }
        };

        let slab_relative_var = take(sigma_b, sigma_g);
        let spike_relative_var = slab_relative_var.mapv(|v| v / spike_diff_factor);
        let slab_var = slab_relative_var.mapv(|v| v * sigma);
        let spike_var = spike_relative_var.mapv(|v| v * sigma);
        let lambda = take(lam_b, lam_g);
        let s_x = take(
            n_var as f64,
            s_z.expect("s_z is required for the interaction effect type"),
        );

        let mut hyps = Hyps {
            sigma,
            lambda,
            slab_var,
            spike_var,
            slab_relative_var,
            spike_relative_var,
            s_x,
            pve: Array1::zeros(n_effects),
            pve_large: Array1::zeros(n_effects),
        };
        hyps.compute_pve(Prior::SpikeSlab, Prior::SpikeSlab);
        hyps
    }

    pub fn n_effects(&self) -> usize {
        self.lambda.len()
    }

    /// Proportion of phenotypic variance explained per effect type,
    /// normalized by (sum + 1) so the residual keeps its share.
    pub fn compute_pve(&mut self, prior_beta: Prior, prior_gam: Prior) {
        let n_effects = self.n_effects();
        let mut pve = &self.lambda * &self.slab_relative_var * &self.s_x;
        let mut pve_large = Array1::zeros(n_effects);

        let priors = [prior_beta, prior_gam];
        for ee in 0..n_effects {
            if priors[ee].is_mog() {
                pve_large[ee] = pve[ee];
                pve[ee] += (1. - self.lambda[ee]) * self.spike_relative_var[ee] * self.s_x[ee];
            }
        }

        let denom = pve.sum() + 1.;
        self.pve = pve.mapv(|v| v / denom);
        self.pve_large = pve_large.mapv(|v| v / denom);
    }
}

/// Indices of the grid rows that pass the sanity checks; invalid rows are
/// excluded with a warning upstream.
pub fn validate_grid(grid: &Array2<f64>, n_var: usize) -> Vec<usize> {
    let mut valid_points = Vec::new();
    for (ii, row) in grid.rows().into_iter().enumerate() {
        let sigma = row[SIGMA_IND];
        let sigma_b = row[SIGMA_B_IND];
        let sigma_g = row[SIGMA_G_IND];
        let lam_b = row[LAM_B_IND];
        let lam_g = row[LAM_G_IND];

        let chck_sigma = sigma > 0.0 && sigma.is_finite();
        let chck_sigma_b = sigma_b > 0.0 && sigma_b.is_finite();
        let chck_sigma_g = sigma_g >= 0.0 && sigma_g.is_finite();
        let chck_lam_b = lam_b >= 1.0 / n_var as f64 && lam_b < 1.0 && lam_b.is_finite();
        let chck_lam_g = lam_g >= 0.0 && lam_g < 1.0 && lam_g.is_finite();
        if chck_sigma && chck_sigma_b && chck_sigma_g && chck_lam_b && chck_lam_g {
            valid_points.push(ii);
        }
    }
    valid_points
}

pub fn subset_grid(grid: &Array2<f64>, valid_points: &[usize]) -> Array2<f64> {
    let n_cols = grid.dim().1;
    let mut subset = Array2::zeros((valid_points.len(), n_cols));
    for (kk, &ii) in valid_points.iter().enumerate() {
        subset.row_mut(kk).assign(&grid.row(ii));
    }
    subset
}
