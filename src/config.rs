use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::Compression;
use crate::fit::{ConstraintSettings, FitMode, FitOptions, TauIdEffFitter, TauIdEffFitterBuilder};
use crate::key::SysUncertainty;
use crate::minimizer::MinimizerOptions;
use crate::morphing::{Interpolation, MorphingMode};
use crate::reader::{HistogramReader, HistogramReaderBuilder};
use crate::region::{Region, RegionError};
use crate::templates::{TemplateFromData, TemplatePreparer};
use crate::toys::PseudoExperimentsBuilder;
use crate::writer::{YamlWriter, YamlWriterBuilder};

/// Regions whose QCD templates are taken from data
const QCD_FROM_DATA_REGIONS: [&str; 3] = ["C1", "C1p", "C1f"];

fn to_strings(s: &[&str]) -> Vec<String> {
    s.iter().map(|s| s.to_string()).collect()
}

/// Settings for a tau id. efficiency measurement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// File with the data distributions and templates
    pub input_file: PathBuf,
    /// Directory inside the input and output files, `/`-separated
    pub directory: String,
    pub output_file: PathBuf,
    /// Regions to load
    pub regions: Vec<String>,
    pub tau_ids: Vec<String>,
    pub fit_variables: Vec<String>,
    pub mt_variable: String,
    pub processes: Vec<String>,
    pub signal_process: String,
    pub qcd_process: String,
    /// Data region from which the QCD templates are taken
    pub qcd_sideband_region: String,
    pub sys_uncertainties: Vec<SysUncertainty>,
    /// Fit the sum of all templates instead of data
    pub run_closure_test: bool,
    pub closure_test_scale: f64,
    pub take_qcd_from_data: bool,
    /// Load systematically shifted templates and run pseudo-experiments
    pub run_sys_uncertainties: bool,
    pub num_pseudo_experiments: u64,
    /// Write post-fit yields per channel
    pub make_control_plots: bool,
    pub template_morphing_mode: MorphingMode,
    pub interpolation: Interpolation,
    pub fit_mode: FitMode,
    pub fit_tau_id_eff_c2: bool,
    pub initial_signal_efficiency: f64,
    pub fixed_parameters: Option<Vec<String>>,
    pub constraints: Vec<ConstraintSettings>,
    /// Seed for the pseudo-experiments
    pub seed: u64,
    pub minimizer: MinimizerOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            directory: String::new(),
            output_file: PathBuf::from("fitTauIdEff.yaml"),
            regions: to_strings(&[
                "ABCD", "A", "B", "B1", "C", "C1", "C1p", "C1f", "C2", "C2p", "C2f", "D",
            ]),
            tau_ids: to_strings(&["tauDiscrHPSloose", "tauDiscrHPSmedium", "tauDiscrHPStight"]),
            fit_variables: to_strings(&["diTauVisMassFromJet"]),
            mt_variable: "diTauMt".to_owned(),
            processes: to_strings(&["Ztautau", "Zmumu", "QCD", "WplusJets", "TTplusJets"]),
            signal_process: "Ztautau".to_owned(),
            qcd_process: "QCD".to_owned(),
            qcd_sideband_region: "B1".to_owned(),
            sys_uncertainties: vec![
                SysUncertainty::new("SysTauJetEn"),
                SysUncertainty::new("SysJetEn"),
            ],
            run_closure_test: false,
            closure_test_scale: 1.,
            take_qcd_from_data: true,
            run_sys_uncertainties: false,
            num_pseudo_experiments: 10000,
            make_control_plots: false,
            template_morphing_mode: MorphingMode::None,
            interpolation: Interpolation::Code4p,
            fit_mode: FitMode::Abcd,
            fit_tau_id_eff_c2: false,
            initial_signal_efficiency: 0.55,
            fixed_parameters: None,
            constraints: Vec::new(),
            seed: 0,
            minimizer: MinimizerOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open configuration file {0:?}")]
    Open(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse configuration file {0:?}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("No input file given")]
    NoInput,
    #[error("Empty list of {0}")]
    Empty(&'static str),
    #[error("Signal process `{0}` is not among the processes")]
    UnknownSignal(String),
    #[error("Region `{0}` is required but not in the list of regions")]
    MissingRegion(String),
    #[error(transparent)]
    InvalidRegion(#[from] RegionError),
    #[error("Initial signal efficiency {0} outside [0, 1]")]
    InitialEfficiency(f64),
    #[error("Closure test scale {0} is not positive")]
    ClosureScale(f64),
    #[error("Constraint on `{0}` has a non-positive width")]
    ConstraintWidth(String),
    #[error("Template morphing `{0}` needs systematic uncertainties")]
    MorphingWithoutSys(MorphingMode),
    #[error("Incomplete settings: {0}")]
    Incomplete(String),
}

impl Config {
    /// Read the configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Reading configuration from {path:?}");
        let file =
            File::open(path).map_err(|err| ConfigError::Open(path.to_owned(), err))?;
        serde_yaml::from_reader(BufReader::new(file))
            .map_err(|err| ConfigError::Parse(path.to_owned(), err))
    }

    /// Regions that have to be loaded for the configured fit
    pub fn required_regions(&self) -> Vec<&str> {
        let mut regions = match self.fit_mode {
            FitMode::C1 => vec!["C1", "C1p", "C1f"],
            FitMode::Abcd => vec!["ABCD", "A", "B", "C", "C1", "C1p", "C1f", "D"],
        };
        if self.fit_mode == FitMode::Abcd {
            if self.fit_tau_id_eff_c2 {
                regions.extend(["C2p", "C2f"]);
            } else {
                regions.push("C2");
            }
        }
        if self.take_qcd_from_data {
            regions.push(&self.qcd_sideband_region);
        }
        regions
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        use ConfigError::*;
        if self.input_file.as_os_str().is_empty() {
            return Err(NoInput);
        }
        for (name, list) in [
            ("tau ids", &self.tau_ids),
            ("fit variables", &self.fit_variables),
            ("processes", &self.processes),
            ("regions", &self.regions),
        ] {
            if list.is_empty() {
                return Err(Empty(name));
            }
        }
        if !self.processes.contains(&self.signal_process) {
            return Err(UnknownSignal(self.signal_process.clone()));
        }
        for region in &self.regions {
            region.parse::<Region>()?;
        }
        for region in self.required_regions() {
            if !self.regions.iter().any(|r| r == region) {
                return Err(MissingRegion(region.to_owned()));
            }
        }
        if !(0. ..=1.).contains(&self.initial_signal_efficiency) {
            return Err(InitialEfficiency(self.initial_signal_efficiency));
        }
        if !(self.closure_test_scale > 0.) {
            return Err(ClosureScale(self.closure_test_scale));
        }
        if let Some(c) = self.constraints.iter().find(|c| !(c.width > 0.)) {
            return Err(ConstraintWidth(c.parameter.clone()));
        }
        if self.template_morphing_mode != MorphingMode::None && self.sys_uncertainties.is_empty() {
            return Err(MorphingWithoutSys(self.template_morphing_mode));
        }
        Ok(self)
    }

    /// Observables for which histograms are loaded
    pub fn observables(&self) -> Vec<String> {
        let mut observables = self.fit_variables.clone();
        if !observables.contains(&self.mt_variable) {
            observables.push(self.mt_variable.clone());
        }
        observables
    }

    /// Uncertainties whose shifted templates are loaded
    ///
    /// Needed for pseudo-experiments and for template morphing.
    fn active_sys_uncertainties(&self) -> Vec<SysUncertainty> {
        if self.run_sys_uncertainties || self.template_morphing_mode != MorphingMode::None {
            self.sys_uncertainties.clone()
        } else {
            Vec::new()
        }
    }

    pub fn histogram_reader(&self) -> Result<HistogramReader, ConfigError> {
        HistogramReaderBuilder::default()
            .file(self.input_file.clone())
            .directory(self.directory.clone())
            .processes(self.processes.clone())
            .regions(self.regions.clone())
            .tau_ids(self.tau_ids.clone())
            .observables(self.observables())
            .sys_uncertainties(self.active_sys_uncertainties())
            .build()
            .map_err(|err| ConfigError::Incomplete(err.to_string()))
    }

    pub fn template_preparer(&self) -> TemplatePreparer {
        let closure_test = self
            .run_closure_test
            .then(|| (self.processes.clone(), self.closure_test_scale));
        let from_data = self.take_qcd_from_data.then(|| TemplateFromData {
            process: self.qcd_process.clone(),
            sideband: self.qcd_sideband_region.clone(),
            regions: to_strings(&QCD_FROM_DATA_REGIONS),
            tau_ids: self.tau_ids.clone(),
            observables: self.fit_variables.clone(),
        });
        TemplatePreparer {
            sys_uncertainties: self.active_sys_uncertainties(),
            closure_test,
            from_data,
        }
    }

    pub fn fitter(&self) -> Result<TauIdEffFitter, ConfigError> {
        let pseudo_experiments = if self.run_sys_uncertainties && self.num_pseudo_experiments > 0 {
            let toys = PseudoExperimentsBuilder::default()
                .num(self.num_pseudo_experiments)
                .seed(self.seed)
                .sys_uncertainties(self.sys_uncertainties.clone())
                .build()
                .map_err(|err| ConfigError::Incomplete(err.to_string()))?;
            Some(toys)
        } else {
            None
        };
        TauIdEffFitterBuilder::default()
            .tau_ids(self.tau_ids.clone())
            .fit_variables(self.fit_variables.clone())
            .options(self.fit_options())
            .pseudo_experiments(pseudo_experiments)
            .build()
            .map_err(|err| ConfigError::Incomplete(err.to_string()))
    }

    pub fn writer(&self, compression: Option<Compression>) -> Result<YamlWriter, ConfigError> {
        YamlWriterBuilder::default()
            .filename(self.output_file.clone())
            .directory(self.directory.clone())
            .compression(compression)
            .yields(self.make_control_plots)
            .build()
            .map_err(|err| ConfigError::Incomplete(err.to_string()))
    }

    /// Settings for the individual fits
    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            mode: self.fit_mode,
            processes: self.processes.clone(),
            signal_process: self.signal_process.clone(),
            mt_variable: self.mt_variable.clone(),
            fit_tau_id_eff_c2: self.fit_tau_id_eff_c2,
            initial_signal_efficiency: self.initial_signal_efficiency,
            fixed_parameters: self.fixed_parameters.clone(),
            constraints: self.constraints.clone(),
            sys_uncertainties: self.active_sys_uncertainties(),
            morphing: self.template_morphing_mode,
            interpolation: self.interpolation,
            minimizer: self.minimizer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn log_init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn parse() {
        log_init();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "input_file: histograms.yaml.gz
directory: tauIdEffMeas
tau_ids: [tauDiscrHPSloose]
fit_variables: [diTauVisMass]
fit_mode: c1
template_morphing_mode: vertical
constraints:
  - parameter: normC1_QCD
    width: 0.5
minimizer:
  max_iters: 200
"
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap().validate().unwrap();
        assert_eq!(config.fit_mode, FitMode::C1);
        assert_eq!(config.template_morphing_mode, MorphingMode::Vertical);
        assert_eq!(config.constraints[0].mean, 1.);
        assert_eq!(config.minimizer.max_iters, 200);
        assert_eq!(config.minimizer.history, 10);
        assert_eq!(config.processes.len(), 5);
        assert_eq!(config.observables(), ["diTauVisMass", "diTauMt"]);

        let options = config.fit_options();
        assert_eq!(options.mode, FitMode::C1);
        assert_eq!(options.sys_uncertainties, config.sys_uncertainties);

        let preparer = config.template_preparer();
        assert_eq!(preparer.sys_uncertainties.len(), 2);
        assert!(preparer.closure_test.is_none());
        let from_data = preparer.from_data.unwrap();
        assert_eq!(from_data.sideband, "B1");
        assert_eq!(from_data.observables, ["diTauVisMass"]);
        assert!(config.histogram_reader().is_ok());
        assert!(config.fitter().is_ok());
        assert!(config.writer(None).is_ok());
    }

    #[test]
    fn sample() {
        log_init();
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/fitTauIdEff.yaml");
        let config = Config::from_file(path).unwrap().validate().unwrap();
        assert_eq!(config.fit_mode, FitMode::Abcd);
        assert_eq!(config.sys_uncertainties[1], SysUncertainty::new("SysJetEn"));
        assert_eq!(config.constraints[0].parameter, "normABCD_Zmumu");
    }

    #[test]
    fn invalid() {
        log_init();
        assert!(matches!(Config::default().validate(), Err(ConfigError::NoInput)));

        let config = Config {
            input_file: "in.yaml".into(),
            ..Default::default()
        };
        assert!(config.clone().validate().is_ok());

        let mut c = config.clone();
        c.regions.retain(|r| r != "C2");
        assert!(matches!(c.validate(), Err(ConfigError::MissingRegion(r)) if r == "C2"));

        let mut c = config.clone();
        c.fit_tau_id_eff_c2 = true;
        c.regions.retain(|r| r != "C2");
        assert!(c.validate().is_ok());

        let mut c = config.clone();
        c.regions.push("E1".to_owned());
        assert!(matches!(c.validate(), Err(ConfigError::InvalidRegion(_))));

        let mut c = config.clone();
        c.template_morphing_mode = MorphingMode::Horizontal;
        assert!(c.clone().validate().is_ok());
        assert_eq!(c.fit_options().sys_uncertainties.len(), 2);
        c.sys_uncertainties.clear();
        assert!(matches!(
            c.validate(),
            Err(ConfigError::MorphingWithoutSys(MorphingMode::Horizontal))
        ));
        assert!(config.fit_options().sys_uncertainties.is_empty());

        let mut c = config.clone();
        c.signal_process = "Zee".to_owned();
        assert!(matches!(c.validate(), Err(ConfigError::UnknownSignal(_))));

        let mut c = config;
        c.tau_ids.clear();
        assert!(matches!(c.validate(), Err(ConfigError::Empty("tau ids"))));

        assert!(serde_yaml::from_str::<Config>("unknown_field: 1").is_err());
    }
}
