use clap::{App, Arg};
use ndarray::{s, Array1, Array2, Axis};

use velma::collective::{current_usage_ram, partition_samples, Collective, SingleProcess};
use velma::config::Parameters;
use velma::error::Error;
use velma::genotype::{read_dosage_file, GenotypeView};
use velma::output;
use velma::program_flow::{
    extract_optional_numeric_arg, extract_optional_str_arg, extract_str_arg, OrExit,
};
use velma::projection::CovariateProjector;
use velma::random::RandomDraws;
use velma::rescan::{loco_pvals, rescan_gwas, residuals_per_chromosome};
use velma::timer::Timer;
use velma::trace::TraceEstimator;
use velma::tracker::StateDump;
use velma::util::matrix_util::{normalize_matrix_columns_inplace, normalize_vector_inplace};
use velma::util::{get_hyps_grid, get_named_matrix, get_pheno_arr};
use velma::vbayes::{normalise_log_weights, VbEngine};

fn main() {
    let app = App::new("velma")
        .version("0.1")
        .about(
            "Whole-genome regression of a continuous phenotype with joint\n\
             main and gene-environment interaction effects: variational\n\
             inference plus randomized Haseman-Elston variance components",
        )
        .arg(
            Arg::with_name("dosage_file")
                .long("dosages").short("g").takes_value(true).required(true)
                .help(
                    "Whitespace-delimited dosage file.\n\
                     Header line: chr rsid pos a0 a1\n\
                     Then one line per variant: the five fields above\n\
                     followed by one dosage per sample",
                ),
        )
        .arg(
            Arg::with_name("pheno_path")
                .long("pheno").short("p").takes_value(true).required(true)
                .help(
                    "Phenotype file. The first line is the phenotype name;\n\
                     each remaining line holds one numeric value",
                ),
        )
        .arg(
            Arg::with_name("covar_path")
                .long("covar").short("c").takes_value(true)
                .help("Covariate file: header of names, then N x K numeric fields"),
        )
        .arg(
            Arg::with_name("env_path")
                .long("environment").short("e").takes_value(true)
                .help(
                    "Environment file: header of names, then N x L numeric\n\
                     fields. Enables the interaction model",
                ),
        )
        .arg(
            Arg::with_name("hyps_grid")
                .long("hyps-grid").takes_value(true)
                .help(
                    "Hyperparameter grid with header\n\
                     sigma sigma_b sigma_g lambda_b lambda_g",
                ),
        )
        .arg(
            Arg::with_name("out_file")
                .long("out").short("o").takes_value(true).required(true)
                .help("Main output path; a .gz suffix enables compression of result files"),
        )
        .arg(Arg::with_name("mode_vb").long("mode-vb").help("Run variational inference"))
        .arg(
            Arg::with_name("mode_rhe")
                .long("mode-rhe")
                .help("Run the randomized variance-component estimator"),
        )
        .arg(Arg::with_name("mog_beta").long("mode-mog-prior-beta")
            .help("Mixture-of-gaussians prior on main effects"))
        .arg(Arg::with_name("mog_gam").long("mode-mog-prior-gam")
            .help("Mixture-of-gaussians prior on interaction effects"))
        .arg(Arg::with_name("mog_both").long("effects-prior-mog")
            .help("Shorthand for both mixture-of-gaussians priors"))
        .arg(Arg::with_name("empirical_bayes").long("mode-empirical-bayes")
            .help("Closed-form hyperparameter updates each iteration"))
        .arg(Arg::with_name("vb_covars").long("use-vb-on-covars")
            .help("Update covariate coefficients inside the variational scheme\n\
                   instead of pre-regressing them out"))
        .arg(Arg::with_name("spike_diff_factor").long("spike-diff-factor").takes_value(true))
        .arg(Arg::with_name("burnin_maxhyps").long("burnin-maxhyps").takes_value(true))
        .arg(Arg::with_name("env_update_repeats").long("env-update-repeats").takes_value(true))
        .arg(Arg::with_name("vb_iter_max").long("vb-iter-max").takes_value(true))
        .arg(Arg::with_name("vb_iter_start").long("vb-iter-start").takes_value(true))
        .arg(Arg::with_name("alpha_tol").long("alpha-tol").takes_value(true))
        .arg(Arg::with_name("elbo_tol").long("elbo-tol").takes_value(true))
        .arg(Arg::with_name("n_pve_samples").long("n-pve-samples").takes_value(true)
            .help("Random draws for the trace estimator"))
        .arg(Arg::with_name("n_jackknife").long("n-jackknife").takes_value(true))
        .arg(Arg::with_name("main_chunk_size").long("main-chunk-size").takes_value(true))
        .arg(Arg::with_name("gxe_chunk_size").long("gxe-chunk-size").takes_value(true))
        .arg(Arg::with_name("max_bytes_per_rank").long("max-bytes-per-rank").takes_value(true))
        .arg(Arg::with_name("random_seed").long("random-seed").takes_value(true))
        .arg(Arg::with_name("missing_code").long("missing-code").takes_value(true))
        .arg(Arg::with_name("threads").long("threads").takes_value(true))
        .arg(Arg::with_name("verbose").long("verbose"))
        .arg(Arg::with_name("xtra_verbose").long("xtra-verbose"))
        .arg(
            Arg::with_name("resume_dump")
                .long("resume-from-param-dump").takes_value(true)
                .help("State dump written under the interim files to restart from"),
        )
        .arg(
            Arg::with_name("env_weights")
                .long("env-weights").takes_value(true)
                .help("Starting environment weights, one value per column"),
        );
    let matches = app.get_matches();

    let mut params = Parameters::default();
    params.out_file = extract_str_arg(&matches, "out_file");
    params.mode_mog_prior_beta = matches.is_present("mog_beta");
    params.mode_mog_prior_gam = matches.is_present("mog_gam");
    if matches.is_present("mog_both") {
        params.set_effects_prior_mog();
    }
    params.mode_empirical_bayes = matches.is_present("empirical_bayes");
    params.use_vb_on_covars = matches.is_present("vb_covars");
    params.verbose = matches.is_present("verbose");
    params.xtra_verbose = matches.is_present("xtra_verbose");
    params.resume_from_dump = extract_optional_str_arg(&matches, "resume_dump");
    params.env_weights_file = extract_optional_str_arg(&matches, "env_weights");

    macro_rules! numeric_opt {
        ($field:ident, $name:expr, $ty:ty) => {
            if let Some(v) = extract_optional_numeric_arg::<$ty>(&matches, $name)
                .unwrap_or_exit(Some(concat!("failed to parse ", $name)))
            {
                params.$field = v;
            }
        };
    }
    numeric_opt!(spike_diff_factor, "spike_diff_factor", f64);
    numeric_opt!(burnin_maxhyps, "burnin_maxhyps", usize);
    numeric_opt!(env_update_repeats, "env_update_repeats", usize);
    numeric_opt!(vb_iter_max, "vb_iter_max", usize);
    numeric_opt!(vb_iter_start, "vb_iter_start", usize);
    numeric_opt!(n_pve_samples, "n_pve_samples", usize);
    numeric_opt!(n_jackknife, "n_jackknife", usize);
    numeric_opt!(main_chunk_size, "main_chunk_size", usize);
    numeric_opt!(gxe_chunk_size, "gxe_chunk_size", usize);
    numeric_opt!(max_bytes_per_rank, "max_bytes_per_rank", usize);
    numeric_opt!(random_seed, "random_seed", u64);
    numeric_opt!(missing_code, "missing_code", f64);
    numeric_opt!(n_thread, "threads", usize);
    if let Some(v) = extract_optional_numeric_arg::<f64>(&matches, "alpha_tol")
        .unwrap_or_exit(Some("failed to parse alpha_tol"))
    {
        params.alpha_tol = v;
        params.alpha_tol_set_by_user = true;
    }
    if let Some(v) = extract_optional_numeric_arg::<f64>(&matches, "elbo_tol")
        .unwrap_or_exit(Some("failed to parse elbo_tol"))
    {
        params.elbo_tol = v;
        params.elbo_tol_set_by_user = true;
    }

    let mode_vb = matches.is_present("mode_vb");
    let mode_rhe = matches.is_present("mode_rhe");
    if !mode_vb && !mode_rhe {
        eprintln!("at least one of --mode-vb and --mode-rhe is required");
        std::process::exit(1);
    }
    if mode_vb && matches.value_of("hyps_grid").is_none() {
        eprintln!("--hyps-grid is required with --mode-vb");
        std::process::exit(1);
    }

    if params.n_thread > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(params.n_thread)
            .build_global()
            .unwrap_or_exit(Some("failed to configure the thread pool"));
    }

    run(&matches, params).unwrap_or_exit(None);
}

fn run(matches: &clap::ArgMatches, params: Parameters) -> Result<(), Error> {
    let mut timer = Timer::new();
    let collective = SingleProcess;

    // ----- non-genetic data -----
    let pheno_path = extract_str_arg(matches, "pheno_path");
    let (pheno_raw, missing) = get_pheno_arr(&pheno_path, params.missing_code)
        .map_err(Error::Config)?;
    let keep: Vec<usize> = (0..pheno_raw.len()).filter(|&i| !missing[i]).collect();
    let n_samples = keep.len();
    if n_samples == 0 {
        return Err(Error::Config("no samples with a non-missing phenotype".to_string()));
    }
    println!(
        "{} of {} samples have a non-missing phenotype",
        n_samples,
        pheno_raw.len()
    );

    let mut y = Array1::from_iter(keep.iter().map(|&i| pheno_raw[i]));
    normalize_vector_inplace(&mut y, 1);

    let (covar_names, covars) = match extract_optional_str_arg(matches, "covar_path") {
        Some(path) => {
            let (names, arr) = get_named_matrix(&path).map_err(Error::Config)?;
            check_sample_count(arr.dim().0, pheno_raw.len(), &path)?;
            let mut arr = select_rows(&arr, &keep);
            normalize_matrix_columns_inplace(&mut arr, 1);
            (names, Some(arr))
        }
        None => (Vec::new(), None),
    };

    let (env_names, env) = match extract_optional_str_arg(matches, "env_path") {
        Some(path) => {
            let (names, arr) = get_named_matrix(&path).map_err(Error::Config)?;
            check_sample_count(arr.dim().0, pheno_raw.len(), &path)?;
            let mut arr = select_rows(&arr, &keep);
            normalize_matrix_columns_inplace(&mut arr, 1);
            (names, arr)
        }
        None => (Vec::new(), Array2::zeros((n_samples, 0))),
    };
    let n_env = env.dim().1;

    // ----- genotypes -----
    let dosage_path = extract_str_arg(matches, "dosage_file");
    let records = read_dosage_file(&dosage_path).map_err(Error::Config)?;
    let records: Vec<_> = records
        .into_iter()
        .map(|mut rec| {
            check_sample_count(rec.dosages.len(), pheno_raw.len(), &dosage_path)?;
            rec.dosages = keep.iter().map(|&i| rec.dosages[i]).collect();
            Ok(rec)
        })
        .collect::<Result<_, Error>>()?;
    let x = GenotypeView::from_records(records, n_samples)?;
    println!(
        "{} variants retained ({} constant columns dropped)",
        x.n_variants(),
        x.n_dropped()
    );
    timer.print();

    // ----- rank budget check -----
    let partition = partition_samples(
        n_samples,
        x.n_variants(),
        n_env.max(1),
        params.max_bytes_per_rank,
        collective.n_ranks(),
    )?;
    // global sample count must match the partitioned total
    let rank_samples = partition.samples_per_rank[collective.rank()];
    let n_samples_global = collective.sum_u64(rank_samples as u64) as usize;
    if n_samples_global != partition.n_samples() {
        return Err(Error::Numerical(format!(
            "rank sample counts sum to {} but the partition holds {}",
            n_samples_global,
            partition.n_samples()
        )));
    }
    if collective.is_root() {
        println!(
            "Samples per rank: {:?}",
            partition.samples_per_rank
        );
        println!("{}", current_usage_ram(&collective));
    }

    // ----- covariate handling -----
    let projector = match &covars {
        Some(c) => Some(CovariateProjector::with_intercept(Some(c.clone()), n_samples)?),
        None => None,
    };
    let (vb_covars, vb_covar_names, mut y_vb, mut env_vb) = if params.use_vb_on_covars {
        (covars.clone(), covar_names.clone(), y.clone(), env.clone())
    } else if let Some(proj) = &projector {
        // pre-regress covariates out of the phenotype and environments
        let y_res = proj.project_vec(&y);
        let env_res = if n_env > 0 { proj.project(&env) } else { env.clone() };
        (None, Vec::new(), y_res, env_res)
    } else {
        (None, Vec::new(), y.clone(), env.clone())
    };
    if n_env > 0 {
        normalize_matrix_columns_inplace(&mut env_vb, 1);
    }
    if !params.use_vb_on_covars && projector.is_some() {
        normalize_vector_inplace(&mut y_vb, 1);
    }

    let mode_vb = matches.is_present("mode_vb");
    let mode_rhe = matches.is_present("mode_rhe");
    let n_effects = if n_env > 0 { 2 } else { 1 };

    let mut map_vp = None;
    let mut map_eta = None;

    if mode_vb {
        let grid_path = extract_str_arg(matches, "hyps_grid");
        let hyps_grid = get_hyps_grid(&grid_path).map_err(Error::Config)?;

        let mut engine = VbEngine::new(
            &x,
            y_vb.clone(),
            env_vb.clone(),
            vb_covars.clone(),
            vb_covar_names.clone(),
            env_names.clone(),
            hyps_grid,
            &params,
            &collective,
        )?;

        if let Some(path) = &params.env_weights_file {
            let (_, arr) = get_named_matrix(path).map_err(Error::Config)?;
            let muw = arr.row(0).to_owned();
            engine.set_init_env_weights(muw)?;
        }
        if let Some(path) = &params.resume_from_dump {
            let dump = StateDump::load(std::path::Path::new(path))?;
            engine.set_resume(dump)?;
        }

        let trackers = engine.run()?;
        timer.print();

        if collective.is_root() {
            let (path, mut w) = output::fstream_init(&params.out_file, "", "_inits")?;
            println!("Writing start points for alpha and mu to {}", path.display());
            output::write_snp_stats(
                &mut w, &x, &engine.vp_init, n_effects, engine.prior_beta, engine.prior_gam,
            )?;
        }

        // posterior grid weights from the final ELBOs
        let elbos: Vec<f64> = trackers.iter().map(|t| t.elbo).collect();
        let weights = if trackers.len() > 1 && params.mode_empirical_bayes {
            normalise_log_weights(&elbos)
        } else if trackers.len() > 1 {
            vec![1.0 / trackers.len() as f64; trackers.len()]
        } else {
            vec![1.0]
        };

        let mut map_index = 0;
        let mut best_weight = -f64::MAX;
        for (ii, w) in weights.iter().enumerate() {
            if w.is_finite() && *w > best_weight {
                best_weight = *w;
                map_index = ii;
            }
        }
        let vp_map = trackers[map_index].vp.clone().expect("tracker lost its state");

        if collective.is_root() {
            let counts: Vec<usize> = trackers.iter().map(|t| t.count).collect();
            let hyps_refs: Vec<&velma::hyps::Hyps> =
                trackers.iter().map(|t| t.hyps.as_ref().unwrap()).collect();

            let (path, mut w) = output::fstream_init(&params.out_file, "", "")?;
            println!("Writing converged hyperparameter values to {}", path.display());
            output::write_hyps_table(
                &mut w, &weights, &elbos, &counts, &hyps_refs,
                engine.prior_beta, engine.prior_gam,
            )?;

            let (path, mut w) = output::fstream_init(&params.out_file, "", "_map_snp_stats")?;
            println!("Writing MAP snp stats to {}", path.display());
            output::write_snp_stats(&mut w, &x, &vp_map, n_effects, engine.prior_beta, engine.prior_gam)?;

            let (path, mut w) = output::fstream_init(&params.out_file, "", "_map_yhat")?;
            println!("Writing predicted effects to {}", path.display());
            output::write_predictions(&mut w, &vp_map, n_effects)?;

            if n_env > 0 {
                let (path, mut w) = output::fstream_init(&params.out_file, "", "_env_weights")?;
                println!("Writing env weights to {}", path.display());
                output::write_env_weights(&mut w, &env_names, &vp_map.muw)?;
            }

            if params.use_vb_on_covars {
                let (path, mut w) = output::fstream_init(&params.out_file, "", "_map_covar")?;
                println!("Writing MAP covariate coefficients to {}", path.display());
                output::write_covar_coeffs(&mut w, &vb_covar_names, &vp_map)?;
            }

            if n_effects > 1 {
                let neglogp = rescan_gwas(&x, &engine.y, &vp_map);
                let (path, mut w) = output::fstream_init(&params.out_file, "", "_map_rescan")?;
                println!("Writing rescan p-values to {}", path.display());
                output::write_rescan(&mut w, &x, &neglogp)?;
            }

            let chr_residuals = residuals_per_chromosome(
                &x, &engine.y, &vp_map, engine.prior_beta, engine.prior_gam, n_effects,
            );
            let (beta, gam, joint) = loco_pvals(&x, &vp_map, &chr_residuals, n_effects);
            let (path, mut w) = output::fstream_init(&params.out_file, "", "_loco_pvals")?;
            println!("Writing LOCO p-values to {}", path.display());
            output::write_loco_pvals(&mut w, &x, &beta, gam.as_ref(), joint.as_ref())?;

            if params.verbose {
                let rows: Vec<Vec<f64>> =
                    trackers.iter().map(|t| t.elbo_trajectory.clone()).collect();
                let (_, mut w) = output::fstream_init(&params.out_file, "", "_elbo")?;
                output::write_trajectories(&mut w, &rows)?;
                let rows: Vec<Vec<f64>> =
                    trackers.iter().map(|t| t.alpha_diff_trajectory.clone()).collect();
                let (_, mut w) = output::fstream_init(&params.out_file, "", "_alpha_diff")?;
                output::write_trajectories(&mut w, &rows)?;
            }
        }

        map_eta = if n_env > 0 { Some(vp_map.eta.clone()) } else { None };
        map_vp = Some(vp_map);
        timer.print();
    }

    if mode_rhe {
        // eta for the GxE component: MAP weights when inference ran,
        // uniform weights otherwise
        let eta = match (&map_vp, n_env) {
            (_, 0) => None,
            (Some(_), _) => map_eta.clone(),
            (None, _) => {
                let muw = Array1::from_elem(n_env, 1.0 / n_env as f64);
                let mut eta = env_vb.dot(&muw);
                normalize_vector_inplace(&mut eta, 1);
                Some(eta)
            }
        };

        let draws = RandomDraws::new(params.random_seed);
        let zz = draws.standard_gaussian(n_samples, params.n_pve_samples);
        let genome_span = x.cumulative_pos(x.n_variants() - 1);
        let mut estimator = TraceEstimator::new(
            &y,
            zz,
            eta.as_ref(),
            params.n_jackknife,
            genome_span,
            projector.as_ref(),
            params.max_bytes_per_rank,
        )?;

        println!(
            "Estimating variance components with {} draws and {} jackknife blocks",
            params.n_pve_samples, params.n_jackknife
        );
        for (start, block) in x.col_chunk_iter(params.main_chunk_size.max(1)) {
            estimator.add_chunk(&block.view(), x.cumulative_pos(start));
        }
        estimator.finalize(&collective);
        let estimates = estimator.estimate();

        if collective.is_root() {
            let (path, mut w) = output::fstream_init(&params.out_file, "", "_pve")?;
            println!("Writing variance-component estimates to {}", path.display());
            output::write_rhe_results(&mut w, &estimates)?;

            if params.xtra_verbose {
                let (_, mut w) = output::fstream_init(&params.out_file, "", "_pve_jackknife")?;
                output::write_rhe_jackknife(&mut w, &estimates, &estimates.h2_jack)?;
            }
            if let Some(h2_g) = estimates.h2_main_effects_only {
                println!("h2-G = {:.6} (main effects model only)", h2_g);
            }
        }
        timer.print();
    }

    Ok(())
}

fn check_sample_count(actual: usize, expected: usize, path: &str) -> Result<(), Error> {
    if actual != expected {
        return Err(Error::Config(format!(
            "{} holds {} samples, expected {}",
            path, actual, expected
        )));
    }
    Ok(())
}

fn select_rows(arr: &Array2<f64>, keep: &[usize]) -> Array2<f64> {
    let mut out = Array2::zeros((keep.len(), arr.dim().1));
    for (r, &i) in keep.iter().enumerate() {
        out.slice_mut(s![r, ..]).assign(&arr.index_axis(Axis(0), i));
    }
    out
}
