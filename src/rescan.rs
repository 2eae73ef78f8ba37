use std::collections::BTreeMap;

use ndarray::Array1;
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};

use crate::genotype::GenotypeView;
use crate::hyps::Prior;
use crate::variational::VariationalState;

fn neglog10(p: f64) -> f64 {
    -p.log10()
}

fn t_test_neglogp(tstat: f64, freedom: f64) -> f64 {
    let t_dist = StudentsT::new(0.0, 1.0, freedom).expect("invalid t distribution");
    neglog10(2.0 * t_dist.sf(tstat.abs()))
}

/// Per-variant interaction scan on the posterior residuals: a two-sided
/// t-test of gamma in (y - ym) ~ diag(eta) x_j.
pub fn rescan_gwas(
    x: &GenotypeView,
    y: &Array1<f64>,
    vp: &VariationalState,
) -> Array1<f64> {
    let n = x.n_samples() as f64;
    let pheno = y - &vp.ym;
    let mut neglogp = Array1::<f64>::zeros(x.n_variants());

    for jj in 0..x.n_variants() {
        let z_kk = &x.col(jj) * &vp.eta;
        let ztz_inv = 1.0 / z_kk.dot(&z_kk);
        let gam = z_kk.dot(&pheno) * ztz_inv;
        let fitted = z_kk.mapv(|v| v * gam);
        let resid = &pheno - &fitted;
        let rss_null = resid.dot(&resid);

        let se_j = (rss_null / (n - 1.0) * ztz_inv).sqrt();
        neglogp[jj] = t_test_neglogp(gam / se_j, n - 1.0);
    }
    neglogp
}

/// Leave-one-chromosome-out residuals: the posterior residual
/// y - ym - yx .* eta plus the add-back of the left-out chromosome's
/// predicted main and interaction effects, mean-centered per chromosome.
pub fn residuals_per_chromosome(
    x: &GenotypeView,
    y: &Array1<f64>,
    vp: &VariationalState,
    prior_beta: Prior,
    prior_gam: Prior,
    n_effects: usize,
) -> BTreeMap<u8, Array1<f64>> {
    let n = x.n_samples() as f64;
    let map_residuals = if n_effects > 1 {
        y - &vp.ym - &(&vp.yx * &vp.eta)
    } else {
        y - &vp.ym
    };

    let eq_beta = vp.mean_beta(prior_beta);
    let eq_gam = vp.mean_gam(prior_gam);

    let mut residuals = BTreeMap::new();
    for cc in x.chromosomes() {
        let pred_main = x.mult_by_chr(cc, eq_beta.view());
        let mut resid = &map_residuals + &pred_main;
        if n_effects > 1 {
            let pred_int = x.mult_by_chr(cc, eq_gam.view());
            resid += &(&pred_int * &vp.eta);
        }
        let mean = resid.sum() / n;
        resid -= mean;
        residuals.insert(cc, resid);
    }
    residuals
}

/// Per-variant association tests against the LOCO residuals: a t-test of
/// the main effect, and under the interaction model per-coefficient
/// t-tests plus a 2-df joint F-test.
pub fn loco_pvals(
    x: &GenotypeView,
    vp: &VariationalState,
    chr_residuals: &BTreeMap<u8, Array1<f64>>,
    n_effects: usize,
) -> (Array1<f64>, Option<Array1<f64>>, Option<Array1<f64>>) {
    assert!(n_effects == 1 || n_effects == 2);
    let n_var = x.n_variants();
    let n = x.n_samples() as f64;
    let freedom = n - n_effects as f64 - 1.0;

    let mut neglogp_beta = Array1::<f64>::zeros(n_var);
    let mut neglogp_gam = Array1::<f64>::zeros(n_var);
    let mut neglogp_joint = Array1::<f64>::zeros(n_var);

    for jj in 0..n_var {
        let chr = x.chromosome(jj);
        let resid = &chr_residuals[&chr];
        let h0 = x.col(jj);

        if n_effects == 1 {
            let ztz_inv = 1.0 / h0.dot(&h0);
            let tau = h0.dot(resid) * ztz_inv;
            let fitted = h0.mapv(|v| v * tau);
            let r = resid - &fitted;
            let rss_null = r.dot(&r);
            let se_j = (rss_null / (n - 1.0) * ztz_inv).sqrt();
            neglogp_beta[jj] = t_test_neglogp(tau / se_j, freedom);
        } else {
            let h1 = &h0 * &vp.eta;

            // 2 x 2 normal equations solved in closed form
            let a00 = h0.dot(&h0);
            let a01 = h0.dot(&h1);
            let a11 = h1.dot(&h1);
            let det = a00 * a11 - a01 * a01;
            let inv00 = a11 / det;
            let inv01 = -a01 / det;
            let inv11 = a00 / det;

            let b0 = h0.dot(resid);
            let b1 = h1.dot(resid);
            let tau0 = inv00 * b0 + inv01 * b1;
            let tau1 = inv01 * b0 + inv11 * b1;

            let rss_null = resid.dot(resid);
            let fitted = h0.mapv(|v| v * tau0) + h1.mapv(|v| v * tau1);
            let r = resid - &fitted;
            let rss_alt = r.dot(&r);

            let beta_tstat = tau0 / (rss_alt * inv00 / (n - 3.0)).sqrt();
            neglogp_beta[jj] = t_test_neglogp(beta_tstat, freedom);

            let gam_tstat = tau1 / (rss_alt * inv11 / (n - 3.0)).sqrt();
            neglogp_gam[jj] = t_test_neglogp(gam_tstat, freedom);

            let joint_fstat = (rss_null - rss_alt) / 2.0 / (rss_alt / (n - 3.0));
            let f_dist = FisherSnedecor::new(n_effects as f64, freedom)
                .expect("invalid F distribution");
            neglogp_joint[jj] = neglog10(f_dist.sf(joint_fstat));
        }
    }

    if n_effects == 1 {
        (neglogp_beta, None, None)
    } else {
        (neglogp_beta, Some(neglogp_gam), Some(neglogp_joint))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;

    use crate::genotype::{GenotypeView, VariantRecord};
    use crate::hyps::Prior;
    use crate::variational::VariationalState;

    use super::{loco_pvals, rescan_gwas, residuals_per_chromosome};

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

    fn centered(n: usize, seed: u64) -> Array1<f64> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_pcg::Pcg64::seed_from_u64(seed);
        let mut v: Array1<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let m = v.sum() / n as f64;
        v -= m;
        v
    }

    #[test]
    fn test_rescan_on_null_data_gives_moderate_pvalues() {
        let n = 80;
        let view = toy_view(n, 12, 41);
        let y = centered(n, 42);
        let mut vp = VariationalState::zeros(12, 0, 1, n);
        vp.eta = Array1::ones(n);
        let neglogp = rescan_gwas(&view, &y, &vp);
        assert_eq!(neglogp.len(), 12);
        // under the null, very strong hits are unlikely
        assert!(neglogp.iter().all(|&p| p.is_finite() && p >= 0.));
        assert!(neglogp.iter().filter(|&&p| p > 3.).count() <= 2);
    }

    #[test]
    fn test_rescan_detects_planted_interaction() {
        let n = 200;
        let view = toy_view(n, 10, 51);
        let eta = centered(n, 52).mapv(|v| v + 1.5);
        // plant a strong interaction effect at variant 3
        let y = &view.col(3) * &eta * 2.0 + &centered(n, 53).mapv(|v| v * 0.1);
        let mut vp = VariationalState::zeros(10, 0, 1, n);
        vp.eta = eta;
        let neglogp = rescan_gwas(&view, &y, &vp);
        let best = neglogp
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(best, 3);
        assert!(neglogp[3] > 5.);
    }

    #[test]
    fn test_loco_residuals_are_mean_centered_and_add_back_own_chromosome() {
        let n = 60;
        let n_var = 10;
        let view = toy_view(n, n_var, 61);
        let y = centered(n, 62);
        let mut vp = VariationalState::zeros(n_var, 0, 1, n);
        vp.alpha_beta.fill(0.5);
        vp.mu1_beta.fill(0.2);
        vp.eta = Array1::ones(n);
        // keep the bookkeeping invariant: ym = X E[beta]
        let rr = vp.mean_beta(Prior::SpikeSlab);
        let mut ym = Array1::<f64>::zeros(n);
        for jj in 0..n_var {
            ym.scaled_add(rr[jj], &view.col(jj));
        }
        vp.ym = ym;

        let residuals = residuals_per_chromosome(&view, &y, &vp, Prior::SpikeSlab, Prior::SpikeSlab, 2);
        assert_eq!(residuals.len(), view.chromosomes().len());
        for resid in residuals.values() {
            assert!((resid.sum() / n as f64).abs() < 1e-10);
        }

        let (beta, gam, joint) = loco_pvals(&view, &vp, &residuals, 2);
        assert_eq!(beta.len(), n_var);
        assert!(gam.is_some());
        assert!(joint.is_some());
        assert!(beta.iter().all(|&p| p.is_finite() && p >= 0.));
        assert!(joint.unwrap().iter().all(|&p| p.is_finite() && p >= 0.));
    }
}
