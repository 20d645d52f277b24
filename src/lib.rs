//! `tau-id-eff` measures the efficiency of hadronic tau identification
//! discriminators in muon + tau-jet events.
//!
//! Events are split into regions by di-tau charge (OS/SS), muon
//! isolation (tight/loose), di-tau kinematics (1 = signal-like, 2 =
//! background-like), and the tau id. decision (p = passed, f = failed).
//! A binned maximum-likelihood template fit to several regions at once
//! determines the per-process yields, which factorise into region
//! probabilities. The probability for signal events to pass the tau id.
//! discriminator is the efficiency.
//!
//! # How to use
//!
//! The `fit-tau-id-eff` executable takes a YAML [configuration](config)
//! and runs a [Measurement]: histograms are [loaded](reader), templates
//! [prepared](templates::TemplatePreparer), [fitted](fit), and the results
//! [written](writer).
//!
//! ## Most relevant modules
//!
//! - [prelude] exports a list of the most relevant classes and objects
//! - [measurement] lists the steps that are performed
//! - [fit] sets up the likelihood for the tau id. efficiency
//! - [model] and [minimizer] implement the binned likelihood fit
//! - [morphing] for systematic template variations
//! - [toys] for pseudo-experiments

/// Output compression
pub mod compression;
/// Run configuration
pub mod config;
/// Tau id. efficiency fits
pub mod fit;
/// One-dimensional histograms
pub mod histogram;
/// Histogram keys and systematic uncertainties
pub mod key;
pub mod measurement;
/// L-BFGS minimisation and covariance estimation
pub mod minimizer;
/// Extended binned likelihood
pub mod model;
/// Template morphing
pub mod morphing;
/// Most important exports
pub mod prelude;
/// Progress bar
pub mod progress_bar;
/// Histogram input
pub mod reader;
/// ABCD regions
pub mod region;
/// Data distributions and templates
pub mod templates;
/// Pseudo-experiments
pub mod toys;
/// Common traits
pub mod traits;
/// Result output
pub mod writer;

pub use measurement::{Measurement, MeasurementBuilder};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_REV: Option<&str> = option_env!("VERGEN_GIT_SHA");
pub const GIT_BRANCH: Option<&str> = option_env!("VERGEN_GIT_BRANCH");
