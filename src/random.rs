use ndarray::{Array, Ix2};
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_pcg::Pcg64;

/// Deterministic source of N x B standard-gaussian draw matrices.
///
/// The stream is a Pcg64 seeded from a 64-bit value, so equal seeds and
/// dimensions reproduce bit-identical matrices on every platform.
pub struct RandomDraws {
    seed: u64,
}

impl RandomDraws {
    pub fn new(seed: u64) -> RandomDraws {
        RandomDraws { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fills column by column, matching the draw order of the streaming
    /// ingest path.
    pub fn standard_gaussian(&self, n_rows: usize, n_cols: usize) -> Array<f64, Ix2> {
        let mut rng = Pcg64::seed_from_u64(self.seed);
        let mut zz = Array::<f64, Ix2>::zeros((n_rows, n_cols));
        for bb in 0..n_cols {
            for ii in 0..n_rows {
                zz[[ii, bb]] = StandardNormal.sample(&mut rng);
            }
        }
        zz
    }
}
