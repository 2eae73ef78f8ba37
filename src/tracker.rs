use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::genotype::GenotypeView;
use crate::hyps::{Hyps, Prior};
use crate::variational::VariationalState;

const DUMP_FORMAT_VERSION: u32 = 1;

/// Everything needed to restart inference for one grid point exactly
/// where it stopped. The format is versioned; a mismatched version or a
/// dump taken against different inputs is refused rather than migrated.
#[derive(Clone, Serialize, Deserialize)]
pub struct StateDump {
    pub version: u32,
    pub n_samples: usize,
    pub n_var: usize,
    pub n_env: usize,
    pub n_covar: usize,
    pub grid_row: Vec<f64>,
    pub count: usize,
    pub random_seed: u64,
    pub vp: VariationalState,
    pub hyps: Hyps,
}

impl StateDump {
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<StateDump, Error> {
        let reader = BufReader::new(File::open(path)?);
        let dump: StateDump = bincode::deserialize_from(reader)?;
        if dump.version != DUMP_FORMAT_VERSION {
            return Err(Error::ResumeMismatch(format!(
                "dump format version {} is not supported (expected {})",
                dump.version, DUMP_FORMAT_VERSION
            )));
        }
        Ok(dump)
    }

    /// Refuses a dump that is inconsistent with the current inputs.
    pub fn validate(
        &self,
        n_samples: usize,
        n_var: usize,
        n_env: usize,
        n_covar: usize,
        grid_row: ArrayView1<f64>,
    ) -> Result<(), Error> {
        if self.n_samples != n_samples
            || self.n_var != n_var
            || self.n_env != n_env
            || self.n_covar != n_covar
        {
            return Err(Error::ResumeMismatch(format!(
                "dump dimensions (N={}, P={}, L={}, K={}) do not match the \
                 current inputs (N={}, P={}, L={}, K={})",
                self.n_samples, self.n_var, self.n_env, self.n_covar,
                n_samples, n_var, n_env, n_covar
            )));
        }
        if self.grid_row.len() != grid_row.len()
            || self.grid_row.iter().zip(grid_row.iter()).any(|(a, b)| a != b)
        {
            return Err(Error::ResumeMismatch(
                "dump hyperparameter grid row does not match the current grid".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-grid-point progress record for one inference run. Appends
/// per-iteration tuples, owns the interim output files and emits state
/// dumps at iteration boundaries.
pub struct VbTracker {
    pub grid_index: usize,
    pub round_index: usize,
    pub count: usize,
    pub elbo: f64,
    pub converged: bool,
    pub vp: Option<VariationalState>,
    pub hyps: Option<Hyps>,
    pub elbo_trajectory: Vec<f64>,
    pub alpha_diff_trajectory: Vec<f64>,
    pub elapsed_secs: f64,

    interim_dir: Option<PathBuf>,
    out_stem: String,
    outf_iter: Option<BufWriter<File>>,
    outf_covar: Option<BufWriter<File>>,
}

impl VbTracker {
    pub fn new(grid_index: usize, round_index: usize) -> VbTracker {
        VbTracker {
            grid_index,
            round_index,
            count: 0,
            elbo: -f64::MAX,
            converged: false,
            vp: None,
            hyps: None,
            elbo_trajectory: Vec::new(),
            alpha_diff_trajectory: Vec::new(),
            elapsed_secs: 0.,
            interim_dir: None,
            out_stem: String::new(),
            outf_iter: None,
            outf_covar: None,
        }
    }

    /// Creates `r<round>_interim_files/grid_point_<i>/` next to the main
    /// out-file and opens the per-iteration update stream.
    pub fn init_interim_output(
        &mut self,
        out_file: &str,
        n_effects: usize,
        prior_beta: Prior,
        prior_gam: Prior,
        use_vb_on_covars: bool,
    ) -> Result<(), Error> {
        let path = Path::new(out_file);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Config(format!("invalid output path: {}", out_file)))?;
        let stem = match file_name.find('.') {
            Some(dot) => &file_name[..dot],
            None => file_name,
        };
        let interim_dir = dir.join(format!(
            "r{}_interim_files/grid_point_{}",
            self.round_index, self.grid_index
        ));
        std::fs::create_dir_all(&interim_dir)?;

        let mut outf_iter =
            BufWriter::new(File::create(interim_dir.join(format!("{}_iter_updates.out", stem)))?);
        write!(outf_iter, "count\tsigma\tsigma_b\t")?;
        if prior_beta.is_mog() {
            write!(outf_iter, "sigma_b_spike\t")?;
        }
        if n_effects > 1 {
            write!(outf_iter, "sigma_g\t")?;
            if prior_gam.is_mog() {
                write!(outf_iter, "sigma_g_spike\t")?;
            }
        }
        writeln!(outf_iter, "lambda_b\tlambda_g\telbo\talpha_diff\tseconds")?;

        if use_vb_on_covars {
            let mut outf_covar =
                BufWriter::new(File::create(interim_dir.join(format!("{}_covars.out", stem)))?);
            writeln!(outf_covar, "count covar beta")?;
            self.outf_covar = Some(outf_covar);
        }

        self.out_stem = stem.to_string();
        self.interim_dir = Some(interim_dir);
        self.outf_iter = Some(outf_iter);
        Ok(())
    }

    pub fn push_iter_update(
        &mut self,
        count: usize,
        hyps: &Hyps,
        elbo: f64,
        alpha_diff: f64,
        lap_seconds: f64,
        prior_beta: Prior,
        prior_gam: Prior,
    ) -> Result<(), Error> {
        self.elbo_trajectory.push(elbo);
        self.alpha_diff_trajectory.push(alpha_diff);
        if let Some(w) = self.outf_iter.as_mut() {
            let n_effects = hyps.n_effects();
            write!(w, "{}\t{:.8}\t{:.8}\t", count, hyps.sigma, hyps.slab_relative_var[0])?;
            if prior_beta.is_mog() {
                write!(w, "{:.8}\t", hyps.spike_relative_var[0])?;
            }
            if n_effects > 1 {
                write!(w, "{:.8}\t", hyps.slab_relative_var[1])?;
                if prior_gam.is_mog() {
                    write!(w, "{:.8}\t", hyps.spike_relative_var[1])?;
                }
            }
            let lambda_g = if n_effects > 1 { hyps.lambda[1] } else { 0. };
            writeln!(
                w,
                "{:.8}\t{:.8}\t{:.8}\t{:.8}\t{:.3}",
                hyps.lambda[0], lambda_g, elbo, alpha_diff, lap_seconds
            )?;
        }
        Ok(())
    }

    pub fn push_covar_values(
        &mut self,
        count: usize,
        vp: &VariationalState,
        covar_names: &[String],
    ) -> Result<(), Error> {
        if let Some(w) = self.outf_covar.as_mut() {
            for cc in 0..vp.n_covar() {
                writeln!(w, "{} {} {:.9}", count, covar_names[cc], vp.muc[cc])?;
            }
        }
        Ok(())
    }

    /// Per-variant alpha/mu snapshot for the extra-verbose mode.
    pub fn push_param_values(
        &mut self,
        count: usize,
        vp: &VariationalState,
        x: &GenotypeView,
        n_effects: usize,
    ) -> Result<(), Error> {
        let dir = match &self.interim_dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };
        let mut w = BufWriter::new(File::create(
            dir.join(format!("{}_params_it{}.out", self.out_stem, count)),
        )?);
        writeln!(w, "chr rsid pos alpha_beta mu1_beta alpha_gam mu1_gam")?;
        for jj in 0..x.n_variants() {
            write!(
                w,
                "{} {} {} {:.9} {:.9}",
                x.chromosome[jj], x.rsid[jj], x.position[jj],
                vp.alpha_beta[jj], vp.mu1_beta[jj]
            )?;
            if n_effects > 1 {
                write!(w, " {:.9} {:.9}", vp.alpha_gam[jj], vp.mu1_gam[jj])?;
            } else {
                write!(w, " 0 0")?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Dump path for iteration `count` inside the interim directory.
    pub fn dump_path(&self, count: usize) -> Option<PathBuf> {
        self.interim_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_dump_it{}", self.out_stem, count)))
    }

    pub fn dump_state(
        &self,
        count: usize,
        vp: &VariationalState,
        hyps: &Hyps,
        grid_row: ArrayView1<f64>,
        random_seed: u64,
    ) -> Result<(), Error> {
        let path = match self.dump_path(count) {
            Some(path) => path,
            None => return Ok(()),
        };
        let dump = StateDump {
            version: DUMP_FORMAT_VERSION,
            n_samples: vp.n_samples(),
            n_var: vp.n_var(),
            n_env: vp.n_env(),
            n_covar: vp.n_covar(),
            grid_row: grid_row.to_vec(),
            count,
            random_seed,
            vp: vp.clone(),
            hyps: hyps.clone(),
        };
        dump.save(&path)
    }

    pub fn finish(
        &mut self,
        count: usize,
        elbo: f64,
        converged: bool,
        vp: VariationalState,
        hyps: Hyps,
        elapsed_secs: f64,
    ) {
        self.count = count;
        self.elbo = elbo;
        self.converged = converged;
        self.vp = Some(vp);
        self.hyps = Some(hyps);
        self.elapsed_secs = elapsed_secs;
        if let Some(w) = self.outf_iter.as_mut() {
            let _ = w.flush();
        }
        if let Some(w) = self.outf_covar.as_mut() {
            let _ = w.flush();
        }
    }
}
