use std::collections::BTreeSet;

use ndarray::{Array, Array1, Array2, ArrayView1, ArrayViewMut2, Ix1};

use crate::error::Error;

/// One variant as delivered by the upstream genotype source.
#[derive(Clone, Debug)]
pub struct VariantRecord {
    pub chromosome: u8,
    pub rsid: String,
    pub position: u32,
    pub a0: String,
    pub a1: String,
    pub maf: f64,
    pub info: f64,
    pub dosages: Vec<f64>,
}

/// Column-standardized view of an N x P dosage matrix.
///
/// Dosages are held raw in single precision together with per-column
/// moments; reads restore the centered, unit-variance form in f64.
/// Constant columns are excluded at construction time and the
/// original-index -> kept-index mapping is retained. All read paths take
/// `&self` and are safe to share across threads.
pub struct GenotypeView {
    n_samples: usize,
    dosages: Array2<f32>,
    col_mean: Vec<f64>,
    col_std: Vec<f64>,
    pub chromosome: Vec<u8>,
    pub rsid: Vec<String>,
    pub position: Vec<u32>,
    pub al_0: Vec<String>,
    pub al_1: Vec<String>,
    pub maf: Vec<f64>,
    pub info: Vec<f64>,
    /// Strictly increasing genome-wide coordinate used for jackknife
    /// bucketing; later chromosomes are offset past earlier ones.
    pub cumulative_pos: Vec<u64>,
    kept_index: Vec<Option<usize>>,
    n_dropped: usize,
}

impl GenotypeView {
    pub fn from_records<I>(records: I, n_samples: usize) -> Result<GenotypeView, Error>
        where I: IntoIterator<Item = VariantRecord> {
        let mut raw: Vec<f32> = Vec::new();
        let mut col_mean = Vec::new();
        let mut col_std = Vec::new();
        let mut chromosome = Vec::new();
        let mut rsid = Vec::new();
        let mut position = Vec::new();
        let mut al_0 = Vec::new();
        let mut al_1 = Vec::new();
        let mut maf = Vec::new();
        let mut info = Vec::new();
        let mut cumulative_pos = Vec::new();
        let mut kept_index = Vec::new();
        let mut n_dropped = 0usize;

        let mut chr_offset = 0u64;
        let mut last_chr: Option<u8> = None;
        let mut last_cum = 0u64;

        for rec in records {
            if rec.dosages.len() != n_samples {
                return Err(Error::Config(format!(
                    "variant {} has {} dosages, expected {}",
                    rec.rsid, rec.dosages.len(), n_samples
                )));
            }
            let (m, s) = column_moments(&rec.dosages);
            if s <= 0. {
                kept_index.push(None);
                n_dropped += 1;
                continue;
            }
            kept_index.push(Some(col_mean.len()));
            raw.extend(rec.dosages.iter().map(|&d| d as f32));
            col_mean.push(m);
            col_std.push(s);

            if last_chr != Some(rec.chromosome) {
                chr_offset = last_cum;
                last_chr = Some(rec.chromosome);
            }
            last_cum = chr_offset + rec.position as u64;
            cumulative_pos.push(last_cum);

            chromosome.push(rec.chromosome);
            rsid.push(rec.rsid);
            position.push(rec.position);
            al_0.push(rec.a0);
            al_1.push(rec.a1);
            maf.push(if rec.maf.is_finite() { rec.maf } else { maf_from_mean(m) });
            info.push(rec.info);
        }

        let n_kept = col_mean.len();
        if n_kept == 0 {
            return Err(Error::Config("no non-constant variants in the genotype source".to_string()));
        }
        // column-major per variant: reshape from (n_kept, n_samples) rows
        let dosages = Array::from_shape_vec((n_kept, n_samples), raw)
            .map_err(|why| Error::Config(format!("{}", why)))?
            .reversed_axes();

        Ok(GenotypeView {
            n_samples,
            dosages,
            col_mean,
            col_std,
            chromosome,
            rsid,
            position,
            al_0,
            al_1,
            maf,
            info,
            cumulative_pos,
            kept_index,
            n_dropped,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_variants(&self) -> usize {
        self.col_mean.len()
    }

    pub fn n_dropped(&self) -> usize {
        self.n_dropped
    }

    /// Kept-column index for an original source index, `None` if the
    /// column was dropped as constant.
    pub fn kept_index(&self, original_index: usize) -> Option<usize> {
        self.kept_index[original_index]
    }

    pub fn chromosome(&self, j: usize) -> u8 {
        self.chromosome[j]
    }

    pub fn cumulative_pos(&self, j: usize) -> u64 {
        self.cumulative_pos[j]
    }

    pub fn chromosomes(&self) -> BTreeSet<u8> {
        self.chromosome.iter().copied().collect()
    }

    /// Standardized column j (mean zero, unit variance).
    pub fn col(&self, j: usize) -> Array<f64, Ix1> {
        let m = self.col_mean[j];
        let s = self.col_std[j];
        self.dosages.column(j).mapv(|d| (d as f64 - m) / s)
    }

    /// Fills `out` (N x m) with the standardized columns listed in `cols`.
    pub fn col_block_into(&self, cols: &[usize], mut out: ArrayViewMut2<f64>) {
        assert_eq!(out.dim(), (self.n_samples, cols.len()));
        for (k, &j) in cols.iter().enumerate() {
            let m = self.col_mean[j];
            let s = self.col_std[j];
            let src = self.dosages.column(j);
            for (o, &d) in out.column_mut(k).iter_mut().zip(src.iter()) {
                *o = (d as f64 - m) / s;
            }
        }
    }

    /// X_c v_c restricted to the columns on chromosome `chr`.
    pub fn mult_by_chr(&self, chr: u8, v: ArrayView1<f64>) -> Array1<f64> {
        assert_eq!(v.len(), self.n_variants());
        let mut out = Array1::<f64>::zeros(self.n_samples);
        for j in 0..self.n_variants() {
            if self.chromosome[j] != chr {
                continue;
            }
            let vj = v[j];
            if vj == 0. {
                continue;
            }
            let m = self.col_mean[j];
            let s = self.col_std[j];
            let col = self.dosages.column(j);
            for (o, &d) in out.iter_mut().zip(col.iter()) {
                *o += (d as f64 - m) / s * vj;
            }
        }
        out
    }

    /// Contiguous column chunks of at most `chunk_size` standardized
    /// columns, yielding (first column index, N x m block).
    pub fn col_chunk_iter(&self, chunk_size: usize) -> impl Iterator<Item = (usize, Array2<f64>)> + '_ {
        let n_var = self.n_variants();
        (0..n_var).step_by(chunk_size).map(move |start| {
            let end = (start + chunk_size).min(n_var);
            let cols: Vec<usize> = (start..end).collect();
            let mut block = Array2::<f64>::zeros((self.n_samples, cols.len()));
            self.col_block_into(&cols, block.view_mut());
            (start, block)
        })
    }
}

/// Whitespace dosage file: a `chr rsid pos a0 a1` header line, then one
/// line per variant holding those five fields followed by the N dosages.
pub fn read_dosage_file(path: &str) -> Result<Vec<VariantRecord>, String> {
    use std::io::{BufRead, BufReader};
    let f = std::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|why| format!("failed to open {}: {}", path, why))?;
    let mut lines = BufReader::new(f).lines();

    let header = lines
        .next()
        .ok_or_else(|| format!("{} is empty", path))?
        .map_err(|why| format!("failed to read {}: {}", path, why))?;
    let expected = ["chr", "rsid", "pos", "a0", "a1"];
    for (i, (actual, expected)) in header.split_whitespace().zip(expected.iter()).enumerate() {
        if actual != *expected {
            return Err(format!(
                "expected the header field at position {} to be {}, received {}",
                i, expected, actual
            ));
        }
    }

    let mut records = Vec::new();
    let mut n_samples: Option<usize> = None;
    for (i, l) in lines.enumerate() {
        let line = l.map_err(|why| format!("failed to read {}: {}", path, why))?;
        let mut toks = line.split_whitespace();
        let parse_err = |field: &str| format!("{} line {}: missing {}", path, i + 2, field);
        let chromosome = toks
            .next()
            .ok_or_else(|| parse_err("chr"))?
            .parse::<u8>()
            .map_err(|why| format!("{} line {}: {}", path, i + 2, why))?;
        let rsid = toks.next().ok_or_else(|| parse_err("rsid"))?.to_string();
        let position = toks
            .next()
            .ok_or_else(|| parse_err("pos"))?
            .parse::<u32>()
            .map_err(|why| format!("{} line {}: {}", path, i + 2, why))?;
        let a0 = toks.next().ok_or_else(|| parse_err("a0"))?.to_string();
        let a1 = toks.next().ok_or_else(|| parse_err("a1"))?.to_string();
        let dosages: Vec<f64> = toks
            .map(|t| {
                t.parse::<f64>()
                    .map_err(|why| format!("{} line {}: {}", path, i + 2, why))
            })
            .collect::<Result<_, _>>()?;
        match n_samples {
            None => n_samples = Some(dosages.len()),
            Some(n) => {
                if dosages.len() != n {
                    return Err(format!(
                        "{} line {}: expected {} dosages, received {}",
                        path, i + 2, n, dosages.len()
                    ));
                }
            }
        }
        records.push(VariantRecord {
            chromosome,
            rsid,
            position,
            a0,
            a1,
            maf: f64::NAN,
            info: 1.,
            dosages,
        });
    }
    Ok(records)
}

fn column_moments(dosages: &[f64]) -> (f64, f64) {
    let n = dosages.len();
    let mean = dosages.iter().sum::<f64>() / n as f64;
    let ssq: f64 = dosages.iter().map(|&d| (d - mean) * (d - mean)).sum();
    (mean, (ssq / (n - 1) as f64).sqrt())
}

fn maf_from_mean(mean_dosage: f64) -> f64 {
    let f = mean_dosage / 2.;
    f.min(1. - f)
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use crate::util::stats_util::{mean, std};

    use super::{GenotypeView, VariantRecord};

    pub fn record(chr: u8, pos: u32, rsid: &str, dosages: Vec<f64>) -> VariantRecord {
        VariantRecord {
            chromosome: chr,
            rsid: rsid.to_string(),
            position: pos,
            a0: "A".to_string(),
            a1: "G".to_string(),
            maf: f64::NAN,
            info: 1.,
            dosages,
        }
    }

    #[test]
    fn test_columns_are_standardized() {
        let records = vec![
            record(1, 100, "rs1", vec![0., 1., 2., 1., 0.]),
            record(1, 200, "rs2", vec![2., 2., 0., 1., 1.]),
        ];
        let view = GenotypeView::from_records(records, 5).unwrap();
        assert_eq!(view.n_variants(), 2);
        for j in 0..2 {
            let col = view.col(j);
            assert!(mean(col.iter()).abs() < 1e-12);
            assert!((std(col.iter(), 1) - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn test_constant_columns_dropped_with_mapping() {
        let records = vec![
            record(1, 100, "rs1", vec![0., 1., 2., 1.]),
            record(1, 200, "rs2", vec![1., 1., 1., 1.]),
            record(1, 300, "rs3", vec![2., 0., 1., 1.]),
        ];
        let view = GenotypeView::from_records(records, 4).unwrap();
        assert_eq!(view.n_variants(), 2);
        assert_eq!(view.n_dropped(), 1);
        assert_eq!(view.kept_index(0), Some(0));
        assert_eq!(view.kept_index(1), None);
        assert_eq!(view.kept_index(2), Some(1));
    }

    #[test]
    fn test_cumulative_pos_increases_across_chromosomes() {
        let records = vec![
            record(1, 100, "rs1", vec![0., 1., 2., 1.]),
            record(1, 900, "rs2", vec![1., 0., 1., 2.]),
            record(2, 50, "rs3", vec![2., 0., 1., 1.]),
        ];
        let view = GenotypeView::from_records(records, 4).unwrap();
        assert_eq!(view.cumulative_pos(0), 100);
        assert_eq!(view.cumulative_pos(1), 900);
        assert_eq!(view.cumulative_pos(2), 950);
    }

    #[test]
    fn test_col_block_and_chunk_iter_agree() {
        let records = vec![
            record(1, 100, "rs1", vec![0., 1., 2., 1., 0.]),
            record(1, 200, "rs2", vec![2., 2., 0., 1., 1.]),
            record(1, 300, "rs3", vec![1., 0., 0., 2., 1.]),
        ];
        let view = GenotypeView::from_records(records, 5).unwrap();
        let mut block = Array2::<f64>::zeros((5, 3));
        view.col_block_into(&[0, 1, 2], block.view_mut());
        let chunks: Vec<_> = view.col_chunk_iter(2).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks[1].0, 2);
        for j in 0..3 {
            let col = view.col(j);
            for i in 0..5 {
                assert!((block[[i, j]] - col[i]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_mult_by_chr() {
        let records = vec![
            record(1, 100, "rs1", vec![0., 1., 2., 1., 0.]),
            record(2, 200, "rs2", vec![2., 2., 0., 1., 1.]),
        ];
        let view = GenotypeView::from_records(records, 5).unwrap();
        let v = ndarray::arr1(&[0.5, 2.0]);
        let by_chr = view.mult_by_chr(1, v.view());
        let expected = view.col(0).mapv(|x| x * 0.5);
        for i in 0..5 {
            assert!((by_chr[i] - expected[i]).abs() < 1e-12);
        }
    }
}
