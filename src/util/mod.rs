use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};

use ndarray::{Array, Ix1, Ix2};

pub mod matrix_util;
pub mod stats_util;

pub fn get_line_count(filepath: &str) -> Result<usize, String> {
    let buf = match OpenOptions::new().read(true).open(filepath) {
        Err(why) => return Err(format!("failed to open {}: {}", filepath, why)),
        Ok(f) => BufReader::new(f),
    };
    Ok(buf.lines().count())
}

fn open_buffered(filepath: &str) -> Result<BufReader<File>, String> {
    match OpenOptions::new().read(true).open(filepath) {
        Err(why) => Err(format!("failed to open {}: {}", filepath, why)),
        Ok(f) => Ok(BufReader::new(f)),
    }
}

/// The first line is a single phenotype name; each remaining line holds one
/// numeric value. Values equal to `missing_code` are flagged in the returned
/// mask (true = missing).
pub fn get_pheno_arr(pheno_path: &str, missing_code: f64) -> Result<(Array<f64, Ix1>, Vec<bool>), String> {
    let mut buf = open_buffered(pheno_path)?;
    let mut header = String::new();
    buf.read_line(&mut header)
       .map_err(|why| format!("failed to read the header of {}: {}", pheno_path, why))?;
    println!("\n{} header:\n{}", pheno_path, header.trim_end());

    let mut pheno_vec = Vec::new();
    let mut missing = Vec::new();
    for (i, l) in buf.lines().enumerate() {
        let line = l.map_err(|why| format!("failed to read {}: {}", pheno_path, why))?;
        let val = line
            .split_whitespace()
            .next()
            .ok_or_else(|| format!("{} line {}: empty line", pheno_path, i + 2))?
            .parse::<f64>()
            .map_err(|why| format!("{} line {}: {}", pheno_path, i + 2, why))?;
        missing.push(val == missing_code || !val.is_finite());
        pheno_vec.push(val);
    }
    Ok((Array::from_vec(pheno_vec), missing))
}

/// The first line holds column names; each remaining line holds the
/// corresponding numeric fields. Returns (names, N x K array).
pub fn get_named_matrix(path: &str) -> Result<(Vec<String>, Array<f64, Ix2>), String> {
    let num_people = get_line_count(path)? - 1;
    let mut buf = open_buffered(path)?;

    let mut header = String::new();
    buf.read_line(&mut header)
       .map_err(|why| format!("failed to read the header of {}: {}", path, why))?;
    let names: Vec<String> = header.split_whitespace().map(|t| t.to_string()).collect();
    let num_cols = names.len();

    let mut values: Vec<f64> = Vec::with_capacity(num_people * num_cols);
    for (i, l) in buf.lines().enumerate() {
        let line = l.map_err(|why| format!("failed to read {}: {}", path, why))?;
        let mut n_fields = 0;
        for tok in line.split_whitespace() {
            values.push(
                tok.parse::<f64>()
                   .map_err(|why| format!("{} line {}: {}", path, i + 2, why))?,
            );
            n_fields += 1;
        }
        if n_fields != num_cols {
            return Err(format!(
                "{} line {}: expected {} fields, received {}",
                path, i + 2, num_cols, n_fields
            ));
        }
    }
    let arr = Array::from_shape_vec((num_people, num_cols), values)
        .map_err(|why| format!("{}: {}", path, why))?;
    Ok((names, arr))
}

/// Hyperparameter grid file; the header must start with
/// `sigma sigma_b sigma_g lambda_b lambda_g`.
pub fn get_hyps_grid(path: &str) -> Result<Array<f64, Ix2>, String> {
    let (names, grid) = get_named_matrix(path)?;
    let expected = ["sigma", "sigma_b", "sigma_g", "lambda_b", "lambda_g"];
    for (i, (actual, expected)) in names.iter().zip(expected.iter()).enumerate() {
        if actual != expected {
            return Err(format!(
                "expected the header field at position {} to be {}, received {}",
                i, expected, actual
            ));
        }
    }
    if grid.dim().1 != expected.len() {
        return Err(format!(
            "{}: expected {} columns, received {}",
            path, expected.len(), grid.dim().1
        ));
    }
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{get_hyps_grid, get_named_matrix, get_pheno_arr};

    fn write_tmp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_get_pheno_arr() {
        let f = write_tmp("height\n1.5\n-999\n0.25\n");
        let (arr, missing) = get_pheno_arr(f.path().to_str().unwrap(), -999.).unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(missing, vec![false, true, false]);
        assert!((arr[2] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_get_named_matrix() {
        let f = write_tmp("age sex\n50 0\n60 1\n");
        let (names, arr) = get_named_matrix(f.path().to_str().unwrap()).unwrap();
        assert_eq!(names, vec!["age".to_string(), "sex".to_string()]);
        assert_eq!(arr.dim(), (2, 2));
        assert!((arr[[1, 0]] - 60.).abs() < 1e-12);
    }

    #[test]
    fn test_get_named_matrix_ragged_line() {
        let f = write_tmp("age sex\n50 0\n60\n");
        assert!(get_named_matrix(f.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_get_hyps_grid_rejects_bad_header() {
        let f = write_tmp("sigma sigma_b sigma_g lam_b lambda_g\n1 0.1 0.1 0.1 0.1\n");
        assert!(get_hyps_grid(f.path().to_str().unwrap()).is_err());
    }
}
