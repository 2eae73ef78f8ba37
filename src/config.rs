/// Runtime options for variational inference and the variance-component
/// estimator. Defaults mirror the command-line defaults.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub out_file: String,

    // prior structure
    pub mode_mog_prior_beta: bool,
    pub mode_mog_prior_gam: bool,
    pub mode_empirical_bayes: bool,
    pub use_vb_on_covars: bool,
    pub spike_diff_factor: f64,

    // iteration control
    pub vb_iter_max: usize,
    pub vb_iter_start: usize,
    pub burnin_maxhyps: usize,
    pub env_update_repeats: usize,
    pub alpha_tol: f64,
    pub elbo_tol: f64,
    pub alpha_tol_set_by_user: bool,
    pub elbo_tol_set_by_user: bool,

    // variance components
    pub n_pve_samples: usize,
    pub n_jackknife: usize,

    // resources
    pub main_chunk_size: usize,
    pub gxe_chunk_size: usize,
    pub max_bytes_per_rank: usize,
    pub n_thread: usize,

    pub random_seed: u64,
    pub missing_code: f64,
    pub verbose: bool,
    pub xtra_verbose: bool,

    pub resume_from_dump: Option<String>,
    pub env_weights_file: Option<String>,
}

impl Default for Parameters {
    fn default() -> Parameters {
        Parameters {
            out_file: "velma.out".to_string(),
            mode_mog_prior_beta: false,
            mode_mog_prior_gam: false,
            mode_empirical_bayes: false,
            use_vb_on_covars: false,
            spike_diff_factor: 100.0,
            vb_iter_max: 10000,
            vb_iter_start: 0,
            burnin_maxhyps: 0,
            env_update_repeats: 1,
            alpha_tol: 1e-4,
            elbo_tol: 1e-2,
            alpha_tol_set_by_user: false,
            elbo_tol_set_by_user: false,
            n_pve_samples: 40,
            n_jackknife: 100,
            main_chunk_size: 128,
            gxe_chunk_size: 128,
            max_bytes_per_rank: 16_000_000_000,
            n_thread: 1,
            random_seed: 1,
            missing_code: -999.0,
            verbose: false,
            xtra_verbose: false,
            resume_from_dump: None,
            env_weights_file: None,
        }
    }
}

impl Parameters {
    /// Shorthand enabling the two-component prior for both effect types.
    pub fn set_effects_prior_mog(&mut self) {
        self.mode_mog_prior_beta = true;
        self.mode_mog_prior_gam = true;
    }
}
