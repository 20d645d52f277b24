use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use audec::auto_decompress;
use derive_builder::Builder;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::histogram::{Histogram, HistogramError};
use crate::key::{HistogramKey, SysUncertainty, CENTRAL_VALUE};
use crate::region::{Region, RegionError};
use crate::templates::{selection_for, HistogramSet};
use crate::traits::Load;

/// Name of the pseudo-process holding the measured distributions
pub const DATA: &str = "Data";

/// Histograms keyed by process, region and histogram key
pub type ProcessHistograms = BTreeMap<String, BTreeMap<String, BTreeMap<String, Histogram>>>;

/// A directory in a histogram file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Directory {
    pub histograms: ProcessHistograms,
    pub subdirectories: BTreeMap<String, Directory>,
}

impl Directory {
    /// Nested subdirectory for a `/`-separated path
    ///
    /// The empty path refers to this directory.
    pub fn get(&self, path: &str) -> Option<&Directory> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |dir, name| dir.subdirectories.get(name))
    }

    /// Nested subdirectory for a `/`-separated path, created if needed
    pub fn get_or_create(&mut self, path: &str) -> &mut Directory {
        path.split('/')
            .filter(|p| !p.is_empty())
            .fold(self, |dir, name| {
                dir.subdirectories.entry(name.to_owned()).or_default()
            })
    }

    fn histogram(&self, process: &str, region: &str, key: &str) -> Option<&Histogram> {
        self.histograms.get(process)?.get(region)?.get(key)
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Failed to open histogram file {0:?}")]
    Open(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse histogram file {0:?}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("No directory `{0}` in histogram file")]
    NoDirectory(String),
    #[error("Invalid histogram `{key}` in region `{region}` for `{process}`")]
    Histogram {
        process: String,
        region: String,
        key: String,
        source: HistogramError,
    },
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Reader for data distributions and templates from a YAML histogram file
///
/// The file may be compressed with any format supported by
/// [audec](audec::auto_decompress).
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct HistogramReader {
    #[builder(setter(into))]
    file: PathBuf,
    #[builder(default, setter(into))]
    directory: String,
    processes: Vec<String>,
    regions: Vec<String>,
    tau_ids: Vec<String>,
    observables: Vec<String>,
    /// Systematic uncertainties for which `Up` and `Down` shifts are loaded
    #[builder(default)]
    sys_uncertainties: Vec<SysUncertainty>,
}

impl HistogramReader {
    fn read_file(&self) -> Result<Directory, ReadError> {
        let file = File::open(&self.file)
            .map_err(|err| ReadError::Open(self.file.clone(), err))?;
        let reader = auto_decompress(BufReader::new(file));
        serde_yaml::from_reader(reader)
            .map_err(|err| ReadError::Parse(self.file.clone(), err))
    }

    fn sys_shifts(&self) -> Vec<String> {
        let mut shifts = vec![CENTRAL_VALUE.to_owned()];
        for sys in &self.sys_uncertainties {
            shifts.push(sys.up());
            shifts.push(sys.down());
        }
        shifts
    }

    /// Copy the selected histograms of one process from `dir` into `set`
    fn load_process(
        &self,
        dir: &Directory,
        process: &str,
        regions: &[Region],
        set: &mut HistogramSet,
    ) -> Result<usize, ReadError> {
        let mut nloaded = 0;
        for shift in self.sys_shifts() {
            for region in regions {
                for tau_id in &self.tau_ids {
                    for observable in &self.observables {
                        let key = HistogramKey::new(observable, tau_id, selection_for(region))
                            .shifted(&shift);
                        let name = key.to_string();
                        let Some(hist) = dir.histogram(process, region.label(), &name) else {
                            debug!("No histogram {name} in region {region} for {process}");
                            continue;
                        };
                        hist.validate().map_err(|source| ReadError::Histogram {
                            process: process.to_owned(),
                            region: region.to_string(),
                            key: name.clone(),
                            source,
                        })?;
                        trace!("Loaded {process} {region} {name}");
                        if process == DATA {
                            set.insert_data(region.label(), key, hist.clone());
                        } else {
                            set.insert_template(process, region.label(), key, hist.clone());
                        }
                        nloaded += 1;
                    }
                }
            }
        }
        Ok(nloaded)
    }
}

impl Load for HistogramReader {
    type Error = ReadError;

    fn load(&mut self) -> Result<HistogramSet, Self::Error> {
        info!("Reading histograms from {:?}", self.file);
        let root = self.read_file()?;
        let dir = root
            .get(&self.directory)
            .ok_or_else(|| ReadError::NoDirectory(self.directory.clone()))?;
        let regions: Vec<Region> = self
            .regions
            .iter()
            .map(|r| r.parse())
            .collect::<Result<_, _>>()?;

        let mut set = HistogramSet::new();
        for process in std::iter::once(DATA).chain(self.processes.iter().map(|p| p.as_str())) {
            let nloaded = self.load_process(dir, process, &regions, &mut set)?;
            debug!("Loaded {nloaded} histograms for {process}");
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Selection;
    use std::io::Write;

    fn log_init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn hist(contents: &[f64]) -> Histogram {
        Histogram::from_contents(0., 1., contents.to_vec()).unwrap()
    }

    fn insert(dir: &mut Directory, process: &str, region: &str, key: &HistogramKey, h: Histogram) {
        dir.histograms
            .entry(process.to_owned())
            .or_default()
            .entry(region.to_owned())
            .or_default()
            .insert(key.to_string(), h);
    }

    #[test]
    fn directories() {
        let mut root = Directory::default();
        root.get_or_create("a/b").histograms.insert("x".to_owned(), BTreeMap::new());
        assert!(root.get("").is_some());
        assert!(root.get("a").is_some());
        assert!(root.get("a/b").unwrap().histograms.contains_key("x"));
        assert!(root.get("a/c").is_none());
    }

    #[test]
    fn load() {
        log_init();
        let sys = SysUncertainty::new("SysTauJetEn");
        let key = HistogramKey::new("diTauMt", "tauDiscrHPSloose", Selection::Passed);
        let mut root = Directory::default();
        let dir = root.get_or_create("tauIdEffMeas");
        insert(dir, DATA, "C1p", &key, hist(&[5., 3.]));
        insert(dir, "Ztautau", "C1p", &key, hist(&[4., 2.]));
        insert(dir, "Ztautau", "C1p", &key.shifted(&sys.up()), hist(&[5., 2.]));
        insert(dir, "Ztautau", "C1", &key, hist(&[1., 1.]));
        insert(dir, "WplusJets", "C1p", &key, hist(&[1., 1.]));

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(serde_yaml::to_string(&root).unwrap().as_bytes())
            .unwrap();

        let mut reader = HistogramReaderBuilder::default()
            .file(file.path())
            .directory("tauIdEffMeas")
            .processes(vec!["Ztautau".to_owned()])
            .regions(vec!["C1".to_owned(), "C1p".to_owned()])
            .tau_ids(vec!["tauDiscrHPSloose".to_owned()])
            .observables(vec!["diTauMt".to_owned()])
            .sys_uncertainties(vec![sys.clone()])
            .build()
            .unwrap();
        let set = reader.load().unwrap();
        assert_eq!(set.data_histogram("C1p", &key).unwrap().contents(), &[5., 3.]);
        assert!(set.template("Ztautau", "C1p", &key).is_ok());
        assert!(set.template("Ztautau", "C1p", &key.shifted(&sys.up())).is_ok());
        // `C1` only contains histograms for all events
        assert!(set.template("Ztautau", "C1", &key).is_err());
        assert_eq!(set.processes().collect::<Vec<_>>(), ["Ztautau"]);

        let mut reader = HistogramReaderBuilder::default()
            .file(file.path())
            .directory("nonexistent")
            .processes(vec![])
            .regions(vec![])
            .tau_ids(vec![])
            .observables(vec![])
            .build()
            .unwrap();
        assert!(matches!(reader.load(), Err(ReadError::NoDirectory(_))));
    }
}
