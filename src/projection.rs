use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{Inverse, OperationNorm};

use crate::error::Error;

const MAX_CONDITION_NUMBER: f64 = 1e12;

/// Residualizer for the column space of a covariate matrix C:
/// `M - C (C^T C)^-1 C^T M`. The pseudoinverse factor is computed once at
/// construction and reused for every projection.
pub struct CovariateProjector {
    c: Array2<f64>,
    ctc_inv: Array2<f64>,
}

impl CovariateProjector {
    /// Fails when C^T C is numerically singular (1-norm condition
    /// estimate above 1e12).
    pub fn new(c: Array2<f64>) -> Result<CovariateProjector, Error> {
        let ctc = c.t().dot(&c);
        let ctc_inv = ctc
            .inv()
            .map_err(|why| Error::Numerical(format!("singular covariate matrix: {}", why)))?;
        let cond = ctc.opnorm_one().unwrap_or(f64::INFINITY)
            * ctc_inv.opnorm_one().unwrap_or(f64::INFINITY);
        if !cond.is_finite() || cond > MAX_CONDITION_NUMBER {
            return Err(Error::Numerical(format!(
                "singular covariate matrix: condition number estimate {:.3e} exceeds {:.0e}",
                cond, MAX_CONDITION_NUMBER
            )));
        }
        Ok(CovariateProjector { c, ctc_inv })
    }

    /// Appends an intercept column before factorizing.
    pub fn with_intercept(c: Option<Array2<f64>>, n_samples: usize) -> Result<CovariateProjector, Error> {
        let ones = Array2::<f64>::ones((n_samples, 1));
        let c = match c {
            Some(c) => ndarray::concatenate(Axis(1), &[c.view(), ones.view()])
                .map_err(|why| Error::Config(format!("{}", why)))?,
            None => ones,
        };
        CovariateProjector::new(c)
    }

    pub fn n_covar(&self) -> usize {
        self.c.dim().1
    }

    pub fn covariates(&self) -> &Array2<f64> {
        &self.c
    }

    pub fn project(&self, m: &Array2<f64>) -> Array2<f64> {
        let beta = self.ctc_inv.dot(&self.c.t().dot(m));
        m - &self.c.dot(&beta)
    }

    pub fn project_vec(&self, v: &Array1<f64>) -> Array1<f64> {
        let beta = self.ctc_inv.dot(&self.c.t().dot(v));
        v - &self.c.dot(&beta)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, Array2};
    use ndarray_rand::RandomExt;
    use rand::distributions::Uniform;

    use super::CovariateProjector;

    #[test]
    fn test_projection_is_idempotent_and_orthogonal() {
        let n = 40;
        let c = Array::random((n, 3), Uniform::new(-2f64, 2f64));
        let proj = CovariateProjector::new(c.clone()).unwrap();
        let m = Array::random((n, 5), Uniform::new(-1f64, 1f64));

        let once = proj.project(&m);
        let twice = proj.project(&once);
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((a - b).abs() < 1e-10);
        }

        // residuals are orthogonal to the covariate columns
        let ctr = c.t().dot(&once);
        for v in ctr.iter() {
            assert!(v.abs() < 1e-8);
        }
    }

    #[test]
    fn test_singular_covariates_rejected() {
        let n = 20;
        let mut c = Array2::<f64>::zeros((n, 2));
        for i in 0..n {
            c[[i, 0]] = i as f64;
            c[[i, 1]] = 2. * i as f64;
        }
        assert!(CovariateProjector::new(c).is_err());
    }
}
