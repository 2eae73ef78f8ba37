use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array1, Array2};

use crate::error::Error;
use crate::genotype::GenotypeView;
use crate::hyps::{Hyps, Prior};
use crate::trace::RheEstimates;
use crate::variational::VariationalState;

/// Builds `<dir>/<prefix><stem><suffix><ext>` next to the main out-file
/// and opens it for writing, gzip-compressed when the extension carries
/// `.gz`.
pub fn fstream_init(
    out_file: &str,
    file_prefix: &str,
    file_suffix: &str,
) -> Result<(PathBuf, Box<dyn Write>), Error> {
    let path = Path::new(out_file);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config(format!("invalid output path: {}", out_file)))?;
    let (stem, ext) = match file_name.find('.') {
        Some(dot) => (&file_name[..dot], &file_name[dot..]),
        None => (file_name, ""),
    };

    let ofile = dir.join(format!("{}{}{}{}", file_prefix, stem, file_suffix, ext));
    if let Some(parent) = ofile.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(&ofile)?;
    let writer: Box<dyn Write> = if ext.contains(".gz") {
        Box::new(BufWriter::new(GzEncoder::new(file, Compression::default())))
    } else {
        Box::new(BufWriter::new(file))
    };
    Ok((ofile, writer))
}

/// Converged hyperparameter table, one row per grid point.
pub fn write_hyps_table(
    w: &mut dyn Write,
    weights: &[f64],
    elbos: &[f64],
    counts: &[usize],
    hyps: &[&Hyps],
    prior_beta: Prior,
    prior_gam: Prior,
) -> Result<(), Error> {
    let n_effects = hyps.first().map_or(1, |h| h.n_effects());
    let priors = [prior_beta, prior_gam];

    write!(w, "weight elbo count sigma")?;
    for ee in 0..n_effects {
        write!(w, " pve{}", ee)?;
        if priors[ee].is_mog() {
            write!(w, " pve_large{}", ee)?;
        }
        write!(w, " sigma{}", ee)?;
        if priors[ee].is_mog() {
            write!(w, " sigma_spike{} sigma_spike_dilution{}", ee, ee)?;
        }
        write!(w, " lambda{}", ee)?;
    }
    writeln!(w)?;

    for ii in 0..hyps.len() {
        write!(w, "{:.4} {} {} {}", weights[ii], elbos[ii], counts[ii], hyps[ii].sigma)?;
        for ee in 0..n_effects {
            write!(w, " {:.8}", hyps[ii].pve[ee])?;
            if priors[ee].is_mog() {
                write!(w, " {:.8}", hyps[ii].pve_large[ee])?;
            }
            write!(w, " {:.5e}", hyps[ii].slab_relative_var[ee])?;
            if priors[ee].is_mog() {
                write!(w, " {:.5e}", hyps[ii].spike_relative_var[ee])?;
                write!(
                    w,
                    " {:.3}",
                    hyps[ii].slab_relative_var[ee] / hyps[ii].spike_relative_var[ee]
                )?;
            }
            write!(w, " {:.8}", hyps[ii].lambda[ee])?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Per-variant posterior summary; column order is fixed.
pub fn write_snp_stats(
    w: &mut dyn Write,
    x: &GenotypeView,
    vp: &VariationalState,
    n_effects: usize,
    prior_beta: Prior,
    prior_gam: Prior,
) -> Result<(), Error> {
    write!(w, "chr rsid pos a0 a1 maf info alpha_beta mu1_beta")?;
    if prior_beta.is_mog() {
        write!(w, " mu2_beta")?;
    }
    if n_effects > 1 {
        write!(w, " alpha_gam mu1_gam")?;
        if prior_gam.is_mog() {
            write!(w, " mu2_gam")?;
        }
    }
    writeln!(w)?;

    for jj in 0..x.n_variants() {
        write!(
            w,
            "{} {} {} {} {} {:.6} {:.6}",
            x.chromosome[jj], x.rsid[jj], x.position[jj], x.al_0[jj], x.al_1[jj],
            x.maf[jj], x.info[jj]
        )?;
        write!(w, " {:.9} {:.9}", vp.alpha_beta[jj], vp.mu1_beta[jj])?;
        if prior_beta.is_mog() {
            write!(w, " {:.9}", vp.mu2_beta[jj])?;
        }
        if n_effects > 1 {
            write!(w, " {:.9} {:.9}", vp.alpha_gam[jj], vp.mu1_gam[jj])?;
            if prior_gam.is_mog() {
                write!(w, " {:.9}", vp.mu2_gam[jj])?;
            }
        }
        writeln!(w)?;
    }
    Ok(())
}

pub fn write_covar_coeffs(
    w: &mut dyn Write,
    covar_names: &[String],
    vp: &VariationalState,
) -> Result<(), Error> {
    writeln!(w, "covar beta")?;
    for cc in 0..vp.n_covar() {
        writeln!(w, "{} {:.9}", covar_names[cc], vp.muc[cc])?;
    }
    Ok(())
}

/// Predicted effects from the MAP state: Xbeta (and eta, Xgamma under the
/// interaction model).
pub fn write_predictions(
    w: &mut dyn Write,
    vp: &VariationalState,
    n_effects: usize,
) -> Result<(), Error> {
    if n_effects == 1 {
        writeln!(w, "Xbeta")?;
        for ii in 0..vp.n_samples() {
            writeln!(w, "{:.9}", vp.ym[ii])?;
        }
    } else {
        writeln!(w, "Xbeta eta Xgamma")?;
        for ii in 0..vp.n_samples() {
            writeln!(w, "{:.9} {:.9} {:.9}", vp.ym[ii], vp.eta[ii], vp.yx[ii])?;
        }
    }
    Ok(())
}

pub fn write_env_weights(
    w: &mut dyn Write,
    env_names: &[String],
    muw: &Array1<f64>,
) -> Result<(), Error> {
    writeln!(w, "{}", env_names.join(" "))?;
    let values: Vec<String> = muw.iter().map(|v| format!("{:.9}", v)).collect();
    writeln!(w, "{}", values.join(" "))?;
    Ok(())
}

pub fn write_rescan(
    w: &mut dyn Write,
    x: &GenotypeView,
    neglogp: &Array1<f64>,
) -> Result<(), Error> {
    writeln!(w, "chr rsid pos a0 a1 maf info neglogp")?;
    for kk in 0..x.n_variants() {
        writeln!(
            w,
            "{} {} {} {} {} {:.6} {:.6} {:.6}",
            x.chromosome[kk], x.rsid[kk], x.position[kk], x.al_0[kk], x.al_1[kk],
            x.maf[kk], x.info[kk], neglogp[kk]
        )?;
    }
    Ok(())
}

pub fn write_loco_pvals(
    w: &mut dyn Write,
    x: &GenotypeView,
    neglogp_beta: &Array1<f64>,
    neglogp_gam: Option<&Array1<f64>>,
    neglogp_joint: Option<&Array1<f64>>,
) -> Result<(), Error> {
    write!(w, "chr rsid pos a0 a1 neglogp_beta")?;
    if neglogp_gam.is_some() {
        write!(w, " neglogp_gam neglogp_joint")?;
    }
    writeln!(w)?;
    for kk in 0..x.n_variants() {
        write!(
            w,
            "{} {} {} {} {} {:.6}",
            x.chromosome[kk], x.rsid[kk], x.position[kk], x.al_0[kk], x.al_1[kk],
            neglogp_beta[kk]
        )?;
        if let (Some(gam), Some(joint)) = (neglogp_gam, neglogp_joint) {
            write!(w, " {:.6} {:.6}", gam[kk], joint[kk])?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// One row per grid point; columns are the per-iteration values.
pub fn write_trajectories(w: &mut dyn Write, rows: &[Vec<f64>]) -> Result<(), Error> {
    for row in rows {
        let values: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
        writeln!(w, "{}", values.join(" "))?;
    }
    Ok(())
}

/// Variance-component estimates with jackknife errors.
pub fn write_rhe_results(w: &mut dyn Write, est: &RheEstimates) -> Result<(), Error> {
    writeln!(w, "component sigmas h2 h2_se h2_bias_corrected")?;
    for ii in 0..est.labels.len() {
        writeln!(
            w,
            "{} {:.9} {:.9} {:.9} {:.9}",
            est.labels[ii], est.sigmas[ii], est.h2[ii], est.h2_se[ii], est.h2_bias_corrected[ii]
        )?;
    }
    for ii in 0..est.labels.len() {
        writeln!(
            w,
            "{}_v2 {:.9} {:.9} {:.9} {:.9}",
            est.labels[ii],
            est.sigmas[ii],
            est.h2_reweighted[ii],
            est.h2_reweighted_se[ii],
            est.h2_reweighted_bias_corrected[ii]
        )?;
    }
    Ok(())
}

/// Verbose per-jackknife h2 table.
pub fn write_rhe_jackknife(
    w: &mut dyn Write,
    est: &RheEstimates,
    h2_jack: &Array2<f64>,
) -> Result<(), Error> {
    write!(w, "n_jack")?;
    for label in &est.labels {
        write!(w, " {}", label)?;
    }
    writeln!(w)?;
    for jj in 0..h2_jack.dim().0 {
        write!(w, "{}", est.n_var_jack[jj])?;
        for ii in 0..h2_jack.dim().1 {
            write!(w, " {:.9}", h2_jack[[jj, ii]])?;
        }
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::fstream_init;

    #[test]
    fn test_fstream_init_plain_and_gz_naming() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run.out");
        let (path, mut w) = fstream_init(out.to_str().unwrap(), "", "_map_snp_stats").unwrap();
        assert!(path.to_str().unwrap().ends_with("run_map_snp_stats.out"));
        writeln!(w, "hello").unwrap();
        drop(w);
        let mut content = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello\n");

        let out_gz = dir.path().join("run.out.gz");
        let (path_gz, mut w) = fstream_init(out_gz.to_str().unwrap(), "", "_elbo").unwrap();
        assert!(path_gz.to_str().unwrap().ends_with("run_elbo.out.gz"));
        writeln!(w, "compressed").unwrap();
        drop(w);
        let f = std::fs::File::open(&path_gz).unwrap();
        let mut gz = flate2::read::GzDecoder::new(f);
        let mut content = String::new();
        gz.read_to_string(&mut content).unwrap();
        assert_eq!(content, "compressed\n");
    }
}
