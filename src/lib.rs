//! velma: whole-genome variational inference of main and
//! gene-environment interaction effects on a continuous phenotype,
//! coupled with a randomized Haseman-Elston variance-component
//! estimator with jackknife standard errors.

pub mod collective;
pub mod config;
pub mod error;
pub mod genotype;
pub mod hyps;
pub mod output;
pub mod program_flow;
pub mod projection;
pub mod random;
pub mod rescan;
pub mod timer;
pub mod trace;
pub mod tracker;
pub mod util;
pub mod variational;
pub mod vbayes;
