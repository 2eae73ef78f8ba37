use ndarray::{Array, Axis, Ix1, Ix2};
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;

use crate::util::stats_util::{mean, std};

/// Draws are filled deterministically from a Pcg64 stream seeded with
/// `seed`, so results are reproducible across platforms.
pub fn generate_standard_normal_matrix(seed: u64, num_rows: usize, num_cols: usize) -> Array<f64, Ix2> {
    let mut rng = Pcg64::seed_from_u64(seed);
    Array::random_using((num_rows, num_cols), StandardNormal, &mut rng)
}

/// `ddof`: delta degrees of freedom, where the denominator will be `N - ddof`,
/// where `N` is the number of rows
pub fn normalize_matrix_columns_inplace(matrix: &mut Array<f64, Ix2>, ddof: usize) {
    let num_rows = matrix.dim().0;
    let denominator = (num_rows - ddof) as f64;
    for mut col in matrix.axis_iter_mut(Axis(1)) {
        let m = col.sum() / num_rows as f64;
        col -= m;
        let std = ((&col * &col).sum() / denominator).sqrt();
        if std > 0. {
            col /= std;
        }
    }
}

pub fn normalize_vector_inplace(vec: &mut Array<f64, Ix1>, ddof: usize) {
    *vec -= mean(vec.iter());
    let s = std(vec.iter(), ddof);
    if s > 0. {
        *vec /= s;
    }
}

pub fn mean_center_vector(vector: &mut Array<f64, Ix1>) {
    *vector -= mean(vector.iter());
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use ndarray_rand::RandomExt;
    use rand::distributions::Uniform;

    use crate::util::stats_util::{mean, std};

    use super::{generate_standard_normal_matrix, mean_center_vector,
                normalize_matrix_columns_inplace, normalize_vector_inplace};

    #[test]
    fn test_normalize_matrix_columns() {
        let ddof = 1;
        let (num_rows, num_cols) = (50, 100);
        let mut matrix = Array::random((num_rows, num_cols), Uniform::new(-10f64, 50f64));
        normalize_matrix_columns_inplace(&mut matrix, ddof);

        // check that the means are close to 0 and the standard deviations are close to 1
        for col in matrix.columns() {
            assert!(mean(col.iter()).abs() < 1e-10);
            assert!((std(col.iter(), ddof) - 1.).abs() < 1e-10);
        }
    }

    #[test]
    fn test_normalize_vector_inplace() {
        let num_elements = 1000;
        let ddof = 0;
        let mut vec = Array::random(num_elements, Uniform::new(-10f64, 50f64));
        assert!(mean(vec.iter()).abs() > 1e-3, "the randomly generated vector should have a large non-zero mean");
        normalize_vector_inplace(&mut vec, ddof);
        assert!(mean(vec.iter()).abs() < 1e-10);
        assert!((std(vec.iter(), ddof) - 1.).abs() < 1e-10);
    }

    #[test]
    fn test_mean_center_vector() {
        let size = 100;
        let mut vec = Array::random(size, Uniform::new(-10f64, 50f64));
        mean_center_vector(&mut vec);
        assert!(mean(vec.iter()).abs() < 1e-10);
    }

    #[test]
    fn test_seeded_gaussian_matrix_is_deterministic() {
        let a = generate_standard_normal_matrix(7, 20, 5);
        let b = generate_standard_normal_matrix(7, 20, 5);
        assert_eq!(a, b);
        let c = generate_standard_normal_matrix(8, 20, 5);
        assert!(a.iter().zip(c.iter()).any(|(x, y)| x != y));
    }
}
