use itertools::zip_eq;
use log::{debug, trace};
use nalgebra::DMatrix;
use thiserror::Error;

use crate::histogram::{Histogram, HistogramError};
use crate::minimizer::{Minimizer, MinimizerError};
use crate::morphing::{Interpolation, MorphedTemplate, MorphingMode};

/// Expected event numbers below this threshold are extrapolated quadratically
const NU_MIN: f64 = 1e-9;

/// A fit parameter
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub init: f64,
    pub bounds: (f64, f64),
    pub fixed: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, init: f64, bounds: (f64, f64)) -> Self {
        Self {
            name: name.into(),
            init: init.clamp(bounds.0, bounds.1),
            bounds,
            fixed: false,
        }
    }
}

/// External constraint on a parameter
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    Gaussian {
        parameter: usize,
        mean: f64,
        sigma: f64,
    },
}

impl Constraint {
    fn nll(&self, params: &[f64]) -> f64 {
        match self {
            Self::Gaussian {
                parameter,
                mean,
                sigma,
            } => (params[*parameter] - mean).powi(2) / (2. * sigma * sigma),
        }
    }
}

/// Contribution of one process to a channel
///
/// The expected number of events in the fit range is
/// `norm × Π factors × fitted_fraction`, distributed according to the
/// template shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub process: String,
    pub template: MorphedTemplate,
    /// Index of the normalisation parameter
    pub norm: usize,
    /// Indices of probability parameters, and whether they enter as `1 - p`
    pub factors: Vec<(usize, bool)>,
    pub fitted_fraction: f64,
}

/// Product of probability factors `p` or `1 - p`
pub fn factor_product(factors: &[(usize, bool)], params: &[f64]) -> f64 {
    factors
        .iter()
        .map(|&(idx, inverted)| {
            if inverted {
                1. - params[idx]
            } else {
                params[idx]
            }
        })
        .product()
}

impl Component {
    /// Number of events in the whole region
    pub fn region_yield(&self, params: &[f64]) -> f64 {
        factor_product(&self.factors, params) * params[self.norm]
    }

    /// Number of events within the fit range
    pub fn fitted_yield(&self, params: &[f64]) -> f64 {
        self.region_yield(params) * self.fitted_fraction
    }
}

/// One fitted distribution
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    pub name: String,
    pub data: Histogram,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("Template for `{process}` in channel `{channel}` does not match data")]
    Binning {
        channel: String,
        process: String,
        source: HistogramError,
    },
    #[error("Unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("Parameter index {0} out of range")]
    ParameterIndex(usize),
    #[error(transparent)]
    Minimizer(#[from] MinimizerError),
}

/// Extended binned likelihood model
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Model {
    pub parameters: Vec<Parameter>,
    pub channels: Vec<Channel>,
    pub constraints: Vec<Constraint>,
    pub morphing: MorphingMode,
    pub interpolation: Interpolation,
}

/// Result of fitting a [Model]
#[derive(Clone, Debug)]
pub struct ModelFit {
    /// Values of all parameters, including fixed ones
    pub values: Vec<f64>,
    /// Errors of all parameters, zero for fixed ones
    pub errors: Vec<f64>,
    /// Indices of the floating parameters
    pub free: Vec<usize>,
    /// Covariance matrix of the floating parameters
    pub covariance: Option<DMatrix<f64>>,
    pub nll: f64,
    pub converged: bool,
    pub status: i32,
}

impl ModelFit {
    /// Covariance of two parameters by their index in the full parameter list
    pub fn covariance(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let i = self.free.iter().position(|&k| k == i)?;
        let j = self.free.iter().position(|&k| k == j)?;
        Some(cov[(i, j)])
    }
}

/// Negative log-likelihood for observing `n` events when `nu` are expected
fn poisson_nll(n: f64, nu: f64) -> f64 {
    if n <= 0. {
        return nu;
    }
    if nu >= NU_MIN {
        return nu - n * nu.ln();
    }
    let d = nu - NU_MIN;
    NU_MIN - n * NU_MIN.ln() + (1. - n / NU_MIN) * d + 0.5 * n / (NU_MIN * NU_MIN) * d * d
}

impl Model {
    pub fn new(morphing: MorphingMode, interpolation: Interpolation) -> Self {
        Self {
            morphing,
            interpolation,
            ..Default::default()
        }
    }

    /// Add a parameter and return its index
    pub fn add_parameter(&mut self, par: Parameter) -> usize {
        self.parameters.push(par);
        self.parameters.len() - 1
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    pub fn fix(&mut self, name: &str) -> Result<(), ModelError> {
        let idx = self
            .parameter_index(name)
            .ok_or_else(|| ModelError::UnknownParameter(name.to_owned()))?;
        self.parameters[idx].fixed = true;
        Ok(())
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<(), ModelError> {
        let Constraint::Gaussian { parameter, .. } = &constraint;
        if *parameter >= self.parameters.len() {
            return Err(ModelError::ParameterIndex(*parameter));
        }
        self.constraints.push(constraint);
        Ok(())
    }

    /// Add a channel after checking that all templates match the data binning
    pub fn add_channel(&mut self, channel: Channel) -> Result<(), ModelError> {
        for component in &channel.components {
            for template in component.template.histograms() {
                channel
                    .data
                    .same_binning(template)
                    .map_err(|source| ModelError::Binning {
                        channel: channel.name.clone(),
                        process: component.process.clone(),
                        source,
                    })?;
            }
            let indices = component
                .factors
                .iter()
                .map(|(idx, _)| *idx)
                .chain(std::iter::once(component.norm))
                .chain(component.template.nuisances());
            for idx in indices {
                if idx >= self.parameters.len() {
                    return Err(ModelError::ParameterIndex(idx));
                }
            }
        }
        self.channels.push(channel);
        Ok(())
    }

    pub fn initial_values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.init).collect()
    }

    /// Expected number of events per bin of a channel
    pub fn expected(&self, channel: &Channel, params: &[f64]) -> Vec<f64> {
        let mut res = vec![0.; channel.data.nbins()];
        for component in &channel.components {
            let norm = component.fitted_yield(params);
            let shape = component
                .template
                .shape(params, self.morphing, self.interpolation);
            for (nu, s) in zip_eq(&mut res, shape.iter()) {
                *nu += norm * s;
            }
        }
        res
    }

    /// Expected number of events in the fit range per process
    pub fn component_yields<'a>(
        &self,
        channel: &'a Channel,
        params: &[f64],
    ) -> Vec<(&'a str, f64)> {
        channel
            .components
            .iter()
            .map(|c| (c.process.as_str(), c.fitted_yield(params)))
            .collect()
    }

    fn channel_nll(&self, channel: &Channel, params: &[f64], sumw2: bool) -> f64 {
        let expected = self.expected(channel, params);
        let mut nll = 0.;
        for (bin, nu) in expected.into_iter().enumerate() {
            let n = channel.data.content(bin);
            let term = poisson_nll(n, nu);
            let weight = if sumw2 && n > 0. {
                channel.data.sumw2(bin) / n
            } else {
                1.
            };
            nll += weight * term;
        }
        nll
    }

    /// Negative log-likelihood including constraints
    pub fn nll(&self, params: &[f64]) -> f64 {
        let mut nll: f64 = self
            .channels
            .iter()
            .map(|c| self.channel_nll(c, params, false))
            .sum();
        nll += self.constraints.iter().map(|c| c.nll(params)).sum::<f64>();
        nll
    }

    /// Negative log-likelihood with every bin weighted by its mean event weight
    ///
    /// Its Hessian `W` enters the corrected covariance `V W V` for weighted data.
    pub fn nll_sumw2(&self, params: &[f64]) -> f64 {
        let mut nll: f64 = self
            .channels
            .iter()
            .map(|c| self.channel_nll(c, params, true))
            .sum();
        nll += self.constraints.iter().map(|c| c.nll(params)).sum::<f64>();
        nll
    }

    pub fn has_weighted_data(&self) -> bool {
        self.channels.iter().any(|c| c.data.is_weighted())
    }

    /// Minimise the negative log-likelihood
    ///
    /// For weighted data, the covariance matrix is corrected as `V W V`,
    /// see [nll_sumw2](Self::nll_sumw2).
    pub fn fit(&self, minimizer: &Minimizer) -> Result<ModelFit, ModelError> {
        let free: Vec<usize> = (0..self.parameters.len())
            .filter(|&i| !self.parameters[i].fixed)
            .collect();
        let base = self.initial_values();
        let expand = |x: &[f64]| {
            let mut full = base.clone();
            for (&i, &x) in zip_eq(&free, x) {
                full[i] = x;
            }
            full
        };
        let init: Vec<f64> = free.iter().map(|&i| base[i]).collect();
        let bounds: Vec<(f64, f64)> =
            free.iter().map(|&i| self.parameters[i].bounds).collect();
        debug!(
            "Fitting {} channels with {} free parameters",
            self.channels.len(),
            free.len()
        );

        let objective = |x: &[f64]| self.nll(&expand(x));
        let minimum = minimizer.minimize(&objective, &init, &bounds)?;
        let covariance = match minimum.covariance.clone() {
            Some(v) if self.has_weighted_data() => {
                trace!("Correcting covariance matrix for weighted data");
                let objective_sumw2 = |x: &[f64]| self.nll_sumw2(&expand(x));
                let w = minimizer.hessian(&objective_sumw2, &minimum.params, &bounds);
                Some(&v * w * &v)
            }
            cov => cov,
        };

        let values = expand(&minimum.params);
        let mut errors = vec![0.; values.len()];
        let free_errors = match &covariance {
            Some(cov) => (0..free.len()).map(|i| cov[(i, i)].max(0.).sqrt()).collect(),
            None => minimum.errors(),
        };
        for (&i, err) in zip_eq(&free, free_errors) {
            errors[i] = err;
        }
        Ok(ModelFit {
            values,
            errors,
            free,
            covariance,
            nll: minimum.value,
            converged: minimum.converged,
            status: minimum.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minimizer::STATUS_OK;
    use approx::assert_relative_eq;

    fn log_init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn template(contents: &[f64]) -> MorphedTemplate {
        MorphedTemplate::new(Histogram::from_contents(0., 1., contents.to_vec()).unwrap())
    }

    fn component(process: &str, contents: &[f64], norm: usize, factors: Vec<(usize, bool)>) -> Component {
        Component {
            process: process.to_owned(),
            template: template(contents),
            norm,
            factors,
            fitted_fraction: 1.,
        }
    }

    #[test]
    fn poisson() {
        assert_relative_eq!(poisson_nll(0., 2.), 2.);
        assert_relative_eq!(poisson_nll(2., 2.), 2. - 2. * 2_f64.ln());
        // continuous at the extrapolation threshold
        assert_relative_eq!(
            poisson_nll(3., NU_MIN * (1. - 1e-12)),
            poisson_nll(3., NU_MIN),
            max_relative = 1e-9
        );
        assert!(poisson_nll(3., -1.) > poisson_nll(3., NU_MIN));
    }

    #[test]
    fn two_component_fit() {
        log_init();
        // signal in the first, background in the second bin
        let mut model = Model::default();
        let sig = model.add_parameter(Parameter::new("sig", 50., (0., 1000.)));
        let bkg = model.add_parameter(Parameter::new("bkg", 50., (0., 1000.)));
        let data = Histogram::from_contents(0., 1., vec![100., 400.]).unwrap();
        model
            .add_channel(Channel {
                name: "SR".to_owned(),
                data,
                components: vec![
                    component("sig", &[1., 0.], sig, vec![]),
                    component("bkg", &[0., 1.], bkg, vec![]),
                ],
            })
            .unwrap();
        let fit = model.fit(&Minimizer::default()).unwrap();
        assert!(fit.converged);
        assert_eq!(fit.status, STATUS_OK);
        assert_relative_eq!(fit.values[sig], 100., max_relative = 1e-3);
        assert_relative_eq!(fit.values[bkg], 400., max_relative = 1e-3);
        assert_relative_eq!(fit.errors[sig], 10., max_relative = 1e-2);
        assert_relative_eq!(fit.errors[bkg], 20., max_relative = 1e-2);
    }

    #[test]
    fn efficiency_fit() {
        log_init();
        // passed and failed channels sharing one normalisation
        let mut model = Model::default();
        let norm = model.add_parameter(Parameter::new("norm", 500., (0., 2000.)));
        let eff = model.add_parameter(Parameter::new("eff", 0.5, (0., 1.)));
        let passed = Histogram::from_contents(0., 1., vec![300.]).unwrap();
        let failed = Histogram::from_contents(0., 1., vec![700.]).unwrap();
        model
            .add_channel(Channel {
                name: "passed".to_owned(),
                data: passed,
                components: vec![component("sig", &[1.], norm, vec![(eff, false)])],
            })
            .unwrap();
        model
            .add_channel(Channel {
                name: "failed".to_owned(),
                data: failed,
                components: vec![component("sig", &[1.], norm, vec![(eff, true)])],
            })
            .unwrap();
        let fit = model.fit(&Minimizer::default()).unwrap();
        assert!(fit.converged);
        assert_relative_eq!(fit.values[norm], 1000., max_relative = 1e-3);
        assert_relative_eq!(fit.values[eff], 0.3, max_relative = 1e-3);
        // binomial error
        let binomial = (0.3_f64 * 0.7 / 1000.).sqrt();
        assert_relative_eq!(fit.errors[eff], binomial, max_relative = 1e-2);
    }

    #[test]
    fn constraint_and_fixed() {
        log_init();
        let mut model = Model::default();
        let sig = model.add_parameter(Parameter::new("sig", 50., (0., 1000.)));
        let data = Histogram::from_contents(0., 1., vec![100.]).unwrap();
        model
            .add_channel(Channel {
                name: "SR".to_owned(),
                data,
                components: vec![component("sig", &[1.], sig, vec![])],
            })
            .unwrap();
        model
            .add_constraint(Constraint::Gaussian {
                parameter: sig,
                mean: 50.,
                sigma: 10.,
            })
            .unwrap();
        let fit = model.fit(&Minimizer::default()).unwrap();
        // root of nu² + 50 nu - 10000
        assert_relative_eq!(fit.values[sig], 78.078, max_relative = 1e-3);

        model.fix("sig").unwrap();
        let fit = model.fit(&Minimizer::default()).unwrap();
        assert_relative_eq!(fit.values[sig], 50.);
        assert_eq!(fit.errors[sig], 0.);
        assert!(fit.free.is_empty());
        assert!(model.fix("bkg").is_err());
    }

    #[test]
    fn weighted_data() {
        log_init();
        let mut model = Model::default();
        let sig = model.add_parameter(Parameter::new("sig", 50., (0., 1000.)));
        // 400 events with weight 0.25 each
        let data = Histogram::from_contents(0., 1., vec![100.])
            .unwrap()
            .with_sumw2(vec![25.])
            .unwrap();
        model
            .add_channel(Channel {
                name: "SR".to_owned(),
                data,
                components: vec![component("sig", &[1.], sig, vec![])],
            })
            .unwrap();
        let fit = model.fit(&Minimizer::default()).unwrap();
        assert_relative_eq!(fit.values[sig], 100., max_relative = 1e-3);
        assert_relative_eq!(fit.errors[sig], 5., max_relative = 1e-2);
    }

    #[test]
    fn binning_mismatch() {
        let mut model = Model::default();
        let sig = model.add_parameter(Parameter::new("sig", 50., (0., 1000.)));
        let data = Histogram::from_contents(0., 1., vec![100., 3.]).unwrap();
        let res = model.add_channel(Channel {
            name: "SR".to_owned(),
            data,
            components: vec![component("sig", &[1.], sig, vec![])],
        });
        assert!(matches!(res, Err(ModelError::Binning { .. })));
    }
}
