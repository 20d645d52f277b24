use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;

use derive_builder::Builder;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::{compress_writer, Compression};
use crate::fit::{FitResults, TauIdEffFit};
use crate::histogram::Histogram;
use crate::toys::Summary;
use crate::traits::Write;

/// A measured or expected value
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueWithError {
    pub value: f64,
    pub error: f64,
}

impl ValueWithError {
    pub fn new(value: f64, error: f64) -> Self {
        Self { value, error }
    }
}

/// A directory in the output file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputDirectory {
    /// `fitResult_{var}_{tauId}`, `fitNormC1_{var}_{tauId}`,
    /// `expResult_{var}_{tauId}`, and `expNormC1_{var}_{tauId}`
    pub values: BTreeMap<String, ValueWithError>,
    /// Full fit results, keyed by `{var}_{tauId}`
    pub fits: BTreeMap<String, TauIdEffFit>,
    /// Pseudo-experiment distributions
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, Histogram>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pseudo_experiments: BTreeMap<String, Summary>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub subdirectories: BTreeMap<String, OutputDirectory>,
}

impl OutputDirectory {
    /// Collect the results into a directory
    pub fn new(results: &FitResults, with_yields: bool) -> Self {
        let mut res = Self::default();
        for fit in &results.fits {
            let suffix = format!("{}_{}", fit.fit_variable, fit.tau_id);
            res.values.insert(
                format!("fitResult_{suffix}"),
                ValueWithError::new(fit.efficiency, fit.efficiency_error),
            );
            res.values.insert(
                format!("fitNormC1_{suffix}"),
                ValueWithError::new(fit.norm_c1, fit.norm_c1_error),
            );
            res.values.insert(
                format!("expResult_{suffix}"),
                ValueWithError::new(fit.efficiency_mc_expected, 0.),
            );
            res.values.insert(
                format!("expNormC1_{suffix}"),
                ValueWithError::new(fit.norm_c1_mc_expected, 0.),
            );
            let mut fit = fit.clone();
            if !with_yields {
                fit.yields.clear();
            }
            res.fits.insert(suffix, fit);
        }
        for toys in &results.pseudo_experiments {
            let suffix = format!("{}_{}", toys.tau_id, toys.fit_variable);
            res.histograms.insert(
                format!("effDistribution_{suffix}"),
                toys.eff_distribution.clone(),
            );
            res.histograms.insert(
                format!("fitConvergenceDistribution_{suffix}"),
                toys.fit_convergence_distribution.clone(),
            );
            res.pseudo_experiments.insert(suffix, toys.summary);
        }
        res
    }

    /// Nest this directory under a `/`-separated path
    fn nested(self, path: &str) -> Self {
        path.rsplit('/')
            .filter(|p| !p.is_empty())
            .fold(self, |dir, name| OutputDirectory {
                subdirectories: BTreeMap::from([(name.to_owned(), dir)]),
                ..Default::default()
            })
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Failed to create output file {0:?}")]
    Create(PathBuf, #[source] std::io::Error),
    #[error("Failed to set up output compression")]
    Compression(#[source] std::io::Error),
    #[error("Failed to serialise results")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to write to output file")]
    Io(#[from] std::io::Error),
}

/// Writes fit results to a YAML file
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct YamlWriter {
    #[builder(setter(into))]
    filename: PathBuf,
    /// `/`-separated directory for the results
    #[builder(default, setter(into))]
    directory: String,
    #[builder(default)]
    compression: Option<Compression>,
    /// Include post-fit yields per channel
    #[builder(default)]
    yields: bool,
}

impl Write for YamlWriter {
    type Error = WriteError;

    fn write(&mut self, results: &FitResults) -> Result<(), Self::Error> {
        info!("Writing results to {:?}", self.filename);
        let out = OutputDirectory::new(results, self.yields).nested(&self.directory);
        let file = File::create(&self.filename)
            .map_err(|err| WriteError::Create(self.filename.clone(), err))?;
        let mut writer = compress_writer(BufWriter::new(file), self.compression)
            .map_err(WriteError::Compression)?;
        serde_yaml::to_writer(&mut writer, &out)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::tests::{fit_options, synthetic_set, FIT_VAR, TAU_ID};
    use crate::fit::{FitMode, TauIdEffFitterBuilder};
    use crate::toys::PseudoExperimentsBuilder;
    use crate::traits::Fit;
    use audec::auto_decompress;
    use std::io::BufReader;

    fn log_init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn results() -> FitResults {
        let set = synthetic_set();
        TauIdEffFitterBuilder::default()
            .tau_ids(vec![TAU_ID.to_owned()])
            .fit_variables(vec![FIT_VAR.to_owned()])
            .options(fit_options(FitMode::C1))
            .pseudo_experiments(Some(
                PseudoExperimentsBuilder::default().num(2).build().unwrap(),
            ))
            .build()
            .unwrap()
            .fit(&set)
            .unwrap()
    }

    #[test]
    fn write() {
        log_init();
        let results = results();
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("fitTauIdEff.yaml.bz2");
        let mut writer = YamlWriterBuilder::default()
            .filename(&filename)
            .directory("tauIdEff/fits")
            .compression(Some(Compression::Bzip2))
            .build()
            .unwrap();
        writer.write(&results).unwrap();

        let file = File::open(&filename).unwrap();
        let out: OutputDirectory =
            serde_yaml::from_reader(auto_decompress(BufReader::new(file))).unwrap();
        let out = &out.subdirectories["tauIdEff"].subdirectories["fits"];
        let suffix = format!("{FIT_VAR}_{TAU_ID}");
        let eff = out.values[&format!("fitResult_{suffix}")];
        assert_eq!(eff.value, results.fits[0].efficiency);
        assert!(out.values.contains_key(&format!("expNormC1_{suffix}")));
        assert!(out.fits[&suffix].yields.is_empty());
        assert!(out
            .histograms
            .contains_key(&format!("effDistribution_{TAU_ID}_{FIT_VAR}")));
        assert_eq!(out.pseudo_experiments[&format!("{TAU_ID}_{FIT_VAR}")].num_experiments, 2);
    }

    #[test]
    fn with_yields() {
        log_init();
        let results = results();
        let out = OutputDirectory::new(&results, true);
        let fit = out.fits.values().next().unwrap();
        assert_eq!(fit.yields.len(), 2);
        let nested = out.clone().nested("");
        assert_eq!(nested, out);
    }
}
