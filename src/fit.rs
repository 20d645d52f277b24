use std::collections::BTreeMap;

use derive_builder::Builder;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::histogram::HistogramError;
use crate::key::{HistogramKey, Selection, SysUncertainty};
use crate::minimizer::{correlation, Minimizer, MinimizerOptions};
use crate::model::{
    factor_product, Channel, Component, Constraint, Model, ModelError, ModelFit, Parameter,
};
use crate::morphing::{Interpolation, MorphedTemplate, MorphingMode};
use crate::region::{Probability, Region, RegionError};
use crate::templates::{ratio, selection_for, HistogramSet, TemplateError};
use crate::toys::{PseudoExperimentResult, PseudoExperiments};
use crate::traits::Fit;

/// Bounds of the systematic nuisance parameters, in units of their width
const NUISANCE_RANGE: (f64, f64) = (-5., 5.);

/// Which regions enter the fit
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FitMode {
    /// Only the tau id. split of the signal region C1
    C1,
    /// All ABCD regions simultaneously
    #[default]
    Abcd,
}

/// Gaussian constraint on a fit parameter, relative to its initial value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintSettings {
    pub parameter: String,
    #[serde(default = "default_mean")]
    pub mean: f64,
    pub width: f64,
}

fn default_mean() -> f64 {
    1.
}

/// Settings for a single tau id. efficiency fit
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct FitOptions {
    #[builder(default)]
    pub mode: FitMode,
    pub processes: Vec<String>,
    #[builder(default = "\"Ztautau\".to_owned()", setter(into))]
    pub signal_process: String,
    #[builder(default = "\"diTauMt\".to_owned()", setter(into))]
    pub mt_variable: String,
    /// Split C2 by the tau id. decision, too
    #[builder(default)]
    pub fit_tau_id_eff_c2: bool,
    #[builder(default = "0.55")]
    pub initial_signal_efficiency: f64,
    /// Parameters kept at their initial values. `None` selects a default list
    #[builder(default)]
    pub fixed_parameters: Option<Vec<String>>,
    #[builder(default)]
    pub constraints: Vec<ConstraintSettings>,
    #[builder(default)]
    pub sys_uncertainties: Vec<SysUncertainty>,
    #[builder(default)]
    pub morphing: MorphingMode,
    #[builder(default)]
    pub interpolation: Interpolation,
    #[builder(default)]
    pub minimizer: MinimizerOptions,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FitError {
    #[error("Signal process `{0}` is not among the fitted processes")]
    MissingSignal(String),
    #[error("Constraint on `{0}` needs a positive width")]
    ConstraintWidth(String),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Histogram(#[from] HistogramError),
}

/// Fitted value of a single parameter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedParameter {
    pub name: String,
    pub init: f64,
    pub value: f64,
    pub error: f64,
    pub fixed: bool,
}

/// Post-fit event numbers in one channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelYields {
    pub observable: String,
    pub data: f64,
    pub expected: f64,
    pub processes: BTreeMap<String, f64>,
}

/// Result of fitting the tau id. efficiency for one discriminator and fit variable
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TauIdEffFit {
    pub tau_id: String,
    pub fit_variable: String,
    pub efficiency: f64,
    pub efficiency_error: f64,
    pub converged: bool,
    pub status: i32,
    pub nll: f64,
    /// Fitted number of signal events in C1
    pub norm_c1: f64,
    pub norm_c1_error: f64,
    /// Efficiency expected from the signal templates
    pub efficiency_mc_expected: f64,
    /// Number of signal events in C1 expected from the templates
    pub norm_c1_mc_expected: f64,
    pub parameters: Vec<FittedParameter>,
    /// Names of the floating parameters, in the order of `correlations`
    pub free_parameters: Vec<String>,
    pub correlations: Option<Vec<Vec<f64>>>,
    /// Fitted number of events per process and region
    pub norm_factors: BTreeMap<String, BTreeMap<String, f64>>,
    /// Post-fit yields per channel
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub yields: BTreeMap<String, ChannelYields>,
}

/// Parameters describing the yields of one process
#[derive(Clone, Debug, Default)]
struct ProcessParameters {
    norm: usize,
    probabilities: BTreeMap<Probability, usize>,
}

impl ProcessParameters {
    /// Probability factors for a region
    ///
    /// Factors without a parameter are absorbed into the normalisation.
    fn factors(&self, region: &Region) -> Vec<(usize, bool)> {
        region
            .factors()
            .into_iter()
            .filter_map(|f| {
                self.probabilities
                    .get(&f.probability)
                    .map(|&idx| (idx, f.inverted))
            })
            .collect()
    }

    fn norm_in_region(&self, region: &Region, params: &[f64]) -> f64 {
        factor_product(&self.factors(region), params) * params[self.norm]
    }

    /// Uncertainty of [norm_in_region](Self::norm_in_region) by linear error propagation
    fn norm_in_region_error(&self, region: &Region, fit: &ModelFit) -> f64 {
        let factors = self.factors(region);
        let params = &fit.values;
        let mut gradient = vec![(self.norm, factor_product(&factors, params))];
        for (n, &(idx, inverted)) in factors.iter().enumerate() {
            let others: Vec<_> = factors
                .iter()
                .enumerate()
                .filter(|&(m, _)| m != n)
                .map(|(_, f)| *f)
                .collect();
            let sign = if inverted { -1. } else { 1. };
            gradient.push((idx, sign * params[self.norm] * factor_product(&others, params)));
        }
        let mut var = 0.;
        for &(i, di) in &gradient {
            for &(j, dj) in &gradient {
                var += di * dj * fit.covariance(i, j).unwrap_or(0.);
            }
        }
        var.max(0.).sqrt()
    }
}

fn region(label: &str) -> Result<Region, RegionError> {
    label.parse()
}

fn upper_bound(n: f64) -> f64 {
    if n > 0. {
        n
    } else {
        1.
    }
}

/// Fitted regions and their observables
fn channel_regions(
    mode: FitMode,
    fit_tau_id_eff_c2: bool,
    mt_variable: &str,
    fit_variable: &str,
) -> Result<Vec<(Region, String)>, RegionError> {
    let mut labels = Vec::new();
    if mode == FitMode::Abcd {
        labels.extend(["A", "B"].map(|r| (r, mt_variable)));
        if fit_tau_id_eff_c2 {
            labels.extend(["C2p", "C2f"].map(|r| (r, mt_variable)));
        } else {
            labels.push(("C2", mt_variable));
        }
        labels.push(("D", mt_variable));
    }
    labels.extend(["C1p", "C1f"].map(|r| (r, fit_variable)));
    labels
        .into_iter()
        .map(|(r, obs)| Ok((region(r)?, obs.to_owned())))
        .collect()
}

/// Regions for which fitted normalisations are reported
fn reported_regions(mode: FitMode) -> &'static [&'static str] {
    match mode {
        FitMode::C1 => &["C1", "C1p", "C1f"],
        FitMode::Abcd => &[
            "ABCD", "A", "B", "C", "C1", "C1p", "C1f", "C2", "C2p", "C2f", "D",
        ],
    }
}

fn default_fixed_parameters(options: &FitOptions) -> Vec<String> {
    use Probability::*;
    if options.mode == FitMode::C1 {
        return Vec::new();
    }
    let fixed: [(&str, &[Probability]); 3] = [
        (options.signal_process.as_str(), &[DiTauCharge, MuonIso, DiTauKine]),
        ("Zmumu", &[MuonIso, DiTauKine]),
        ("TTplusJets", &[DiTauCharge, MuonIso, DiTauKine]),
    ];
    fixed
        .iter()
        .flat_map(|(process, probs)| probs.iter().map(move |p| format!("{p}_{process}")))
        .collect()
}

fn c1_parameters(
    model: &mut Model,
    set: &HistogramSet,
    process: &str,
    tau_id: &str,
    fit_variable: &str,
    options: &FitOptions,
) -> Result<ProcessParameters, FitError> {
    let key_all = HistogramKey::new(fit_variable, tau_id, Selection::All);
    let key_passed = HistogramKey::new(fit_variable, tau_id, Selection::Passed);

    let n_data = set.data_histogram("C1", &key_all)?.integral(false, false);
    let norm_init = set.num_events(process, "C1", &key_all)?;
    let tau_id_init = if process == options.signal_process {
        options.initial_signal_efficiency
    } else {
        ratio(
            set.fitted_events(process, "C1p", &key_passed)?,
            set.fitted_events(process, "C1", &key_all)?,
        )
    };

    let norm = model.add_parameter(Parameter::new(
        format!("normC1_{process}"),
        norm_init,
        (0., upper_bound(2. * n_data)),
    ));
    let p = model.add_parameter(Parameter::new(
        format!("{}_{process}", Probability::TauId),
        tau_id_init,
        (0., 1.),
    ));
    Ok(ProcessParameters {
        norm,
        probabilities: BTreeMap::from([(Probability::TauId, p)]),
    })
}

fn abcd_parameters(
    model: &mut Model,
    set: &HistogramSet,
    process: &str,
    tau_id: &str,
    fit_variable: &str,
    options: &FitOptions,
) -> Result<ProcessParameters, FitError> {
    let mt = &options.mt_variable;
    let key_all = HistogramKey::new(mt, tau_id, Selection::All);
    let n = |region: &str| set.fitted_events(process, region, &key_all);

    let n_data = set.data_histogram("ABCD", &key_all)?.integral(false, false);
    let norm_init = set.num_events(process, "ABCD", &key_all)?;
    let [a, b, c, d] = [n("A")?, n("B")?, n("C")?, n("D")?];
    let c1 = n("C1")?;
    let c1p = set.fitted_events(
        process,
        "C1p",
        &HistogramKey::new(fit_variable, tau_id, Selection::Passed),
    )?;
    let c1_fit = set.fitted_events(
        process,
        "C1",
        &HistogramKey::new(fit_variable, tau_id, Selection::All),
    )?;

    let total = a + b + c + d;
    let charge_init = ratio(a + c, total);
    let iso_init = ratio(c + d, total);
    let kine_init = ratio(c1, c);
    let tau_id_init = if process == options.signal_process {
        options.initial_signal_efficiency
    } else if options.fit_tau_id_eff_c2 {
        let c2p = set.fitted_events(
            process,
            "C2p",
            &HistogramKey::new(mt, tau_id, Selection::Passed),
        )?;
        ratio(c1p + c2p, c)
    } else {
        ratio(c1p, c1_fit)
    };
    trace!(
        "{process}: A = {a}, B = {b}, C = {c}, D = {d}, C1 = {c1}, C1p = {c1p}"
    );

    let norm = model.add_parameter(Parameter::new(
        format!("normABCD_{process}"),
        norm_init,
        (0., upper_bound(n_data)),
    ));
    let mut probabilities = BTreeMap::new();
    for (probability, init) in [
        (Probability::DiTauCharge, charge_init),
        (Probability::MuonIso, iso_init),
        (Probability::DiTauKine, kine_init),
        (Probability::TauId, tau_id_init),
    ] {
        let idx = model.add_parameter(Parameter::new(
            format!("{probability}_{process}"),
            init,
            (0., 1.),
        ));
        probabilities.insert(probability, idx);
    }
    Ok(ProcessParameters {
        norm,
        probabilities,
    })
}

/// Efficiency and C1 yield of the signal process predicted by the templates
fn mc_expected(
    set: &HistogramSet,
    tau_id: &str,
    fit_variable: &str,
    options: &FitOptions,
) -> (f64, f64) {
    let signal = &options.signal_process;
    let mt_all = HistogramKey::new(&options.mt_variable, tau_id, Selection::All);
    let fit_all = HistogramKey::new(fit_variable, tau_id, Selection::All);
    let n = |region: &str, key: &HistogramKey| set.num_events(signal, region, key).ok();

    let Some(norm_c1) = n("C1", &mt_all).or_else(|| n("C1", &fit_all)) else {
        return (f64::NAN, f64::NAN);
    };
    let c1p = n("C1p", &HistogramKey::new(fit_variable, tau_id, Selection::Passed));
    let eff = if options.fit_tau_id_eff_c2 {
        let c2p = n(
            "C2p",
            &HistogramKey::new(&options.mt_variable, tau_id, Selection::Passed),
        );
        match (c1p, c2p, n("C", &mt_all)) {
            (Some(c1p), Some(c2p), Some(c)) => (c1p + c2p) / c,
            _ => f64::NAN,
        }
    } else {
        c1p.map(|c1p| c1p / norm_c1).unwrap_or(f64::NAN)
    };
    (eff, norm_c1)
}

/// Fit the tau id. efficiency of the signal process
pub fn fit_tau_id_eff(
    set: &HistogramSet,
    tau_id: &str,
    fit_variable: &str,
    options: &FitOptions,
) -> Result<TauIdEffFit, FitError> {
    let signal = &options.signal_process;
    if !options.processes.contains(signal) {
        return Err(FitError::MissingSignal(signal.clone()));
    }
    debug!(
        "Fitting {tau_id} in {fit_variable}, mode {}, morphing {}",
        options.mode, options.morphing
    );

    if options.morphing != MorphingMode::None && set.sys_shifts().is_empty() {
        warn!(
            "Template morphing `{}` without systematically shifted templates",
            options.morphing
        );
    }

    let mut model = Model::new(options.morphing, options.interpolation);
    let mut process_parameters = BTreeMap::new();
    for process in &options.processes {
        let pars = match options.mode {
            FitMode::C1 => {
                c1_parameters(&mut model, set, process, tau_id, fit_variable, options)?
            }
            FitMode::Abcd => {
                abcd_parameters(&mut model, set, process, tau_id, fit_variable, options)?
            }
        };
        process_parameters.insert(process.as_str(), pars);
    }

    let channels = channel_regions(
        options.mode,
        options.fit_tau_id_eff_c2,
        &options.mt_variable,
        fit_variable,
    )?;
    let mut nuisances: BTreeMap<&str, usize> = BTreeMap::new();
    for (region, observable) in &channels {
        let key = HistogramKey::new(observable, tau_id, selection_for(region));
        let data = set.data_histogram(region.label(), &key)?.clone();
        let mut components = Vec::with_capacity(options.processes.len());
        for process in &options.processes {
            let pars = &process_parameters[process.as_str()];
            let nominal = set.template(process, region.label(), &key)?;
            let mut template = MorphedTemplate::new(nominal.clone());
            if options.morphing != MorphingMode::None {
                for sys in &options.sys_uncertainties {
                    let up = set.template(process, region.label(), &key.shifted(&sys.up()));
                    let down = set.template(process, region.label(), &key.shifted(&sys.down()));
                    let (Ok(up), Ok(down)) = (up, down) else {
                        trace!("No variations `{}` for {process} in {region}", sys.name);
                        continue;
                    };
                    let idx = match nuisances.get(sys.name.as_str()) {
                        Some(&idx) => idx,
                        None => {
                            let idx = model.add_parameter(Parameter::new(
                                format!("alpha_{}", sys.name),
                                0.,
                                NUISANCE_RANGE,
                            ));
                            model.add_constraint(Constraint::Gaussian {
                                parameter: idx,
                                mean: 0.,
                                sigma: 1.,
                            })?;
                            nuisances.insert(&sys.name, idx);
                            idx
                        }
                    };
                    template.add_variation(idx, up.clone(), down.clone())?;
                }
            }
            components.push(Component {
                process: process.clone(),
                template,
                norm: pars.norm,
                factors: pars.factors(region),
                fitted_fraction: set.fitted_fraction(process, region.label(), &key)?,
            });
        }
        model.add_channel(Channel {
            name: region.label().to_owned(),
            data,
            components,
        })?;
    }

    let fixed = match &options.fixed_parameters {
        Some(fixed) => fixed.clone(),
        None => default_fixed_parameters(options)
            .into_iter()
            .filter(|name| model.parameter_index(name).is_some())
            .collect(),
    };
    for name in &fixed {
        debug!("Fixing {name}");
        model.fix(name)?;
    }

    for constraint in &options.constraints {
        let idx = model
            .parameter_index(&constraint.parameter)
            .ok_or_else(|| ModelError::UnknownParameter(constraint.parameter.clone()))?;
        let init = model.parameters[idx].init;
        let sigma = constraint.width * init.abs();
        if !(sigma > 0.) {
            return Err(FitError::ConstraintWidth(constraint.parameter.clone()));
        }
        let mean = constraint.mean * init;
        debug!("Constraining {} to {mean} ± {sigma}", constraint.parameter);
        model.add_constraint(Constraint::Gaussian {
            parameter: idx,
            mean,
            sigma,
        })?;
    }

    let minimizer = Minimizer::new(options.minimizer.clone());
    let fit = model.fit(&minimizer)?;
    if !fit.converged {
        warn!("Fit of {tau_id} in {fit_variable} did not converge (status {})", fit.status);
    }

    let parameters: Vec<_> = model
        .parameters
        .iter()
        .enumerate()
        .map(|(i, par)| FittedParameter {
            name: par.name.clone(),
            init: par.init,
            value: fit.values[i],
            error: fit.errors[i],
            fixed: par.fixed,
        })
        .collect();
    for par in &parameters {
        debug!(
            "{} = {} ± {} (initial value {})",
            par.name, par.value, par.error, par.init
        );
    }

    let mut norm_factors = BTreeMap::new();
    for (process, pars) in &process_parameters {
        let mut norms = BTreeMap::new();
        for label in reported_regions(options.mode) {
            norms.insert(
                label.to_string(),
                pars.norm_in_region(&region(label)?, &fit.values),
            );
        }
        norm_factors.insert(process.to_string(), norms);
    }

    let mut yields = BTreeMap::new();
    for ((_, observable), channel) in channels.iter().zip(&model.channels) {
        let processes: BTreeMap<_, _> = model
            .component_yields(channel, &fit.values)
            .into_iter()
            .map(|(p, n)| (p.to_owned(), n))
            .collect();
        yields.insert(
            channel.name.clone(),
            ChannelYields {
                observable: observable.clone(),
                data: channel.data.integral(false, false),
                expected: processes.values().sum(),
                processes,
            },
        );
    }

    let signal_pars = &process_parameters[signal.as_str()];
    let eff_idx = signal_pars.probabilities[&Probability::TauId];
    let c1 = region("C1")?;
    let (efficiency_mc_expected, norm_c1_mc_expected) =
        mc_expected(set, tau_id, fit_variable, options);

    let res = TauIdEffFit {
        tau_id: tau_id.to_owned(),
        fit_variable: fit_variable.to_owned(),
        efficiency: fit.values[eff_idx],
        efficiency_error: fit.errors[eff_idx],
        converged: fit.converged,
        status: fit.status,
        nll: fit.nll,
        norm_c1: signal_pars.norm_in_region(&c1, &fit.values),
        norm_c1_error: signal_pars.norm_in_region_error(&c1, &fit),
        efficiency_mc_expected,
        norm_c1_mc_expected,
        free_parameters: fit
            .free
            .iter()
            .map(|&i| model.parameters[i].name.clone())
            .collect(),
        correlations: fit.covariance.as_ref().map(|cov| {
            let corr = correlation(cov);
            corr.row_iter()
                .map(|row| row.iter().copied().collect())
                .collect()
        }),
        parameters,
        norm_factors,
        yields,
    };
    info!(
        "{tau_id} in {fit_variable}: efficiency = {:.2} ± {:.2}% (expected: {:.2}%)",
        100. * res.efficiency,
        100. * res.efficiency_error,
        100. * res.efficiency_mc_expected
    );
    Ok(res)
}

/// Results of all fits of a measurement
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FitResults {
    pub fits: Vec<TauIdEffFit>,
    pub pseudo_experiments: Vec<PseudoExperimentResult>,
}

/// Fits the efficiency for every tau id. and fit variable
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct TauIdEffFitter {
    tau_ids: Vec<String>,
    fit_variables: Vec<String>,
    options: FitOptions,
    /// Pseudo-experiments run after the nominal fits
    #[builder(default)]
    pseudo_experiments: Option<PseudoExperiments>,
}

impl Fit for TauIdEffFitter {
    type Error = FitError;

    fn fit(&mut self, set: &HistogramSet) -> Result<FitResults, Self::Error> {
        let mut fits = Vec::with_capacity(self.tau_ids.len() * self.fit_variables.len());
        for tau_id in &self.tau_ids {
            for fit_variable in &self.fit_variables {
                for process in &self.options.processes {
                    let expected = set.mc_expectation(
                        process,
                        tau_id,
                        &self.options.mt_variable,
                        fit_variable,
                    );
                    debug!("{process} {tau_id} {fit_variable}: {expected:?}");
                }
                fits.push(fit_tau_id_eff(set, tau_id, fit_variable, &self.options)?);
            }
        }
        let pseudo_experiments = match &self.pseudo_experiments {
            Some(toys) => toys.run(set, &self.tau_ids, &self.fit_variables, &self.options)?,
            None => Vec::new(),
        };

        info!("Summary of fit results:");
        for fit in &fits {
            let status = if fit.converged { "" } else { " (not converged)" };
            info!(
                "{:>20} {:>20}: {:.2} ± {:.2}% (expected: {:.2}%){status}",
                fit.tau_id,
                fit.fit_variable,
                100. * fit.efficiency,
                100. * fit.efficiency_error,
                100. * fit.efficiency_mc_expected,
            );
        }
        Ok(FitResults {
            fits,
            pseudo_experiments,
        })
    }
}
