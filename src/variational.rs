use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::hyps::Prior;

/// Approximating-posterior parameters for one hyperparameter grid point,
/// together with the derived residual bookkeeping. Mutation happens only
/// through the inference engine, which owns each instance exclusively.
///
/// Residual invariants at iteration boundaries:
///   ym = X E[beta] (+ C mu_c when covariates are updated variationally),
///   yx = X E[gamma], eta = E mu_w, eta_sq = eta^2 + E^2 s_w^2.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariationalState {
    // main effects over variants
    pub alpha_beta: Array1<f64>,
    pub mu1_beta: Array1<f64>,
    pub mu2_beta: Array1<f64>,
    pub s1_beta_sq: Array1<f64>,
    pub s2_beta_sq: Array1<f64>,

    // interaction effects over variants
    pub alpha_gam: Array1<f64>,
    pub mu1_gam: Array1<f64>,
    pub mu2_gam: Array1<f64>,
    pub s1_gam_sq: Array1<f64>,
    pub s2_gam_sq: Array1<f64>,

    // covariate block
    pub muc: Array1<f64>,
    pub sc_sq: Array1<f64>,

    // environment-weight block
    pub muw: Array1<f64>,
    pub sw_sq: Array1<f64>,

    // derived residual quantities
    pub ym: Array1<f64>,
    pub yx: Array1<f64>,
    pub eta: Array1<f64>,
    pub eta_sq: Array1<f64>,

    /// Expected diagonal of Z^T Z where Z = diag(eta) X.
    pub edztz: Array1<f64>,

    // posterior variance caches
    pub var_beta: Array1<f64>,
    pub var_gam: Array1<f64>,
}

impl VariationalState {
    pub fn zeros(n_var: usize, n_covar: usize, n_env: usize, n_samples: usize) -> VariationalState {
        VariationalState {
            alpha_beta: Array1::zeros(n_var),
            mu1_beta: Array1::zeros(n_var),
            mu2_beta: Array1::zeros(n_var),
            s1_beta_sq: Array1::zeros(n_var),
            s2_beta_sq: Array1::zeros(n_var),
            alpha_gam: Array1::zeros(n_var),
            mu1_gam: Array1::zeros(n_var),
            mu2_gam: Array1::zeros(n_var),
            s1_gam_sq: Array1::zeros(n_var),
            s2_gam_sq: Array1::zeros(n_var),
            muc: Array1::zeros(n_covar),
            sc_sq: Array1::zeros(n_covar),
            muw: Array1::zeros(n_env),
            sw_sq: Array1::zeros(n_env),
            ym: Array1::zeros(n_samples),
            yx: Array1::zeros(n_samples),
            eta: Array1::zeros(n_samples),
            eta_sq: Array1::zeros(n_samples),
            edztz: Array1::zeros(n_var),
            var_beta: Array1::zeros(n_var),
            var_gam: Array1::zeros(n_var),
        }
    }

    pub fn n_var(&self) -> usize {
        self.alpha_beta.len()
    }

    pub fn n_env(&self) -> usize {
        self.muw.len()
    }

    pub fn n_covar(&self) -> usize {
        self.muc.len()
    }

    pub fn n_samples(&self) -> usize {
        self.ym.len()
    }

    /// Posterior-mean main effect per variant.
    pub fn mean_beta(&self, prior: Prior) -> Array1<f64> {
        match prior {
            Prior::SpikeSlab => &self.alpha_beta * &self.mu1_beta,
            Prior::MixtureOfGaussians => {
                &self.alpha_beta * (&self.mu1_beta - &self.mu2_beta) + &self.mu2_beta
            }
        }
    }

    /// Posterior-mean interaction effect per variant.
    pub fn mean_gam(&self, prior: Prior) -> Array1<f64> {
        match prior {
            Prior::SpikeSlab => &self.alpha_gam * &self.mu1_gam,
            Prior::MixtureOfGaussians => {
                &self.alpha_gam * (&self.mu1_gam - &self.mu2_gam) + &self.mu2_gam
            }
        }
    }

    /// Refreshes the posterior-variance caches from the current
    /// (alpha, mu, s^2) values.
    pub fn calc_var_beta(&mut self, prior_beta: Prior, prior_gam: Prior, n_effects: usize) {
        self.var_beta = match prior_beta {
            Prior::SpikeSlab => {
                let mean = &self.alpha_beta * &self.mu1_beta;
                &self.alpha_beta * (&self.s1_beta_sq + &(&self.mu1_beta * &self.mu1_beta))
                    - &(&mean * &mean)
            }
            Prior::MixtureOfGaussians => {
                let mean = self.mean_beta(Prior::MixtureOfGaussians);
                &self.alpha_beta * (&self.s1_beta_sq + &(&self.mu1_beta * &self.mu1_beta))
                    + self.alpha_beta.mapv(|a| 1. - a)
                        * (&self.s2_beta_sq + &(&self.mu2_beta * &self.mu2_beta))
                    - &(&mean * &mean)
            }
        };
        if n_effects > 1 {
            self.var_gam = match prior_gam {
                Prior::SpikeSlab => {
                    let mean = &self.alpha_gam * &self.mu1_gam;
                    &self.alpha_gam * (&self.s1_gam_sq + &(&self.mu1_gam * &self.mu1_gam))
                        - &(&mean * &mean)
                }
                Prior::MixtureOfGaussians => {
                    let mean = self.mean_gam(Prior::MixtureOfGaussians);
                    &self.alpha_gam * (&self.s1_gam_sq + &(&self.mu1_gam * &self.mu1_gam))
                        + self.alpha_gam.mapv(|a| 1. - a)
                            * (&self.s2_gam_sq + &(&self.mu2_gam * &self.mu2_gam))
                        - &(&mean * &mean)
                }
            };
        }
    }

    /// Expected diagonal of Z^T Z from the interaction-moment matrix
    /// dXtEEX, whose column (l * L + m) holds the diagonal of
    /// X^T diag(E_l E_m) X.
    pub fn calc_edztz(&mut self, dxteex: &Array2<f64>) {
        let n_env = self.n_env();
        let n_var = self.n_var();
        assert_eq!(dxteex.dim(), (n_var, n_env * n_env));

        self.edztz.fill(0.);
        for ll in 0..n_env {
            for mm in 0..n_env {
                let w = self.muw[ll] * self.muw[mm];
                if w == 0. {
                    continue;
                }
                let col = dxteex.column(mm * n_env + ll);
                for (e, &d) in self.edztz.iter_mut().zip(col.iter()) {
                    *e += w * d;
                }
            }
        }
        if n_env > 1 {
            for ll in 0..n_env {
                let w = self.sw_sq[ll];
                let col = dxteex.column(ll * n_env + ll);
                for (e, &d) in self.edztz.iter_mut().zip(col.iter()) {
                    *e += w * d;
                }
            }
        }
    }
}
