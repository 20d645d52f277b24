use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, trace};
use thiserror::Error;

use crate::histogram::{Histogram, HistogramError};
use crate::key::{HistogramKey, Selection, SysUncertainty};
use crate::region::{Region, RegionError, TauIdDecision};
use crate::traits::Prepare;

/// Pseudo-process standing for the sum over all processes
pub const SUM: &str = "sum";

/// Histograms of one process (or data), keyed by region label and histogram key
pub type RegionHistograms = BTreeMap<String, BTreeMap<HistogramKey, Histogram>>;

/// Data distributions and per-process templates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistogramSet {
    pub data: RegionHistograms,
    pub templates: BTreeMap<String, RegionHistograms>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("No histogram `{key}` in region `{region}` for process `{process}`")]
    Missing {
        process: String,
        region: String,
        key: HistogramKey,
    },
    #[error("No data histogram `{key}` in region `{region}`")]
    MissingData { region: String, key: HistogramKey },
    #[error("Histogram `{key}` in region `{region}` for process `{process}`")]
    Histogram {
        process: String,
        region: String,
        key: HistogramKey,
        source: HistogramError,
    },
}

/// Probabilities for a process to end up in the various regions, as predicted by the MC
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct McExpectation {
    pub a_over_b: f64,
    pub c_over_d: f64,
    pub c_over_ac: f64,
    pub d_over_bd: f64,
    pub c1_over_c: f64,
    pub c1p_over_c1: f64,
    pub c2p_over_c2: f64,
}

/// Ratio of event counts, zero for an empty denominator
pub(crate) fn ratio(num: f64, den: f64) -> f64 {
    if den > 0. {
        num / den
    } else {
        0.
    }
}

/// Histogram selection matching the tau id. decision of a region
pub fn selection_for(region: &Region) -> Selection {
    match region.tau_id {
        Some(TauIdDecision::Passed) => Selection::Passed,
        Some(TauIdDecision::Failed) => Selection::Failed,
        None => Selection::All,
    }
}

impl HistogramSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_data(&mut self, region: &str, key: HistogramKey, hist: Histogram) {
        self.data
            .entry(region.to_owned())
            .or_default()
            .insert(key, hist);
    }

    pub fn insert_template(
        &mut self,
        process: &str,
        region: &str,
        key: HistogramKey,
        hist: Histogram,
    ) {
        self.templates
            .entry(process.to_owned())
            .or_default()
            .entry(region.to_owned())
            .or_default()
            .insert(key, hist);
    }

    pub fn processes(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(|p| p.as_str())
    }

    pub fn template(
        &self,
        process: &str,
        region: &str,
        key: &HistogramKey,
    ) -> Result<&Histogram, TemplateError> {
        self.templates
            .get(process)
            .and_then(|r| r.get(region))
            .and_then(|k| k.get(key))
            .ok_or_else(|| TemplateError::Missing {
                process: process.to_owned(),
                region: region.to_owned(),
                key: key.clone(),
            })
    }

    pub fn template_mut(
        &mut self,
        process: &str,
        region: &str,
        key: &HistogramKey,
    ) -> Result<&mut Histogram, TemplateError> {
        self.templates
            .get_mut(process)
            .and_then(|r| r.get_mut(region))
            .and_then(|k| k.get_mut(key))
            .ok_or_else(|| TemplateError::Missing {
                process: process.to_owned(),
                region: region.to_owned(),
                key: key.clone(),
            })
    }

    pub fn data_histogram(
        &self,
        region: &str,
        key: &HistogramKey,
    ) -> Result<&Histogram, TemplateError> {
        self.data
            .get(region)
            .and_then(|k| k.get(key))
            .ok_or_else(|| TemplateError::MissingData {
                region: region.to_owned(),
                key: key.clone(),
            })
    }

    /// Number of events, including underflow and overflow
    ///
    /// For the [SUM] pseudo-process, the numbers of all processes are added.
    pub fn num_events(
        &self,
        process: &str,
        region: &str,
        key: &HistogramKey,
    ) -> Result<f64, TemplateError> {
        if process == SUM {
            let mut sum = 0.;
            for process in self.processes() {
                sum += self.num_events(process, region, key)?;
            }
            return Ok(sum);
        }
        Ok(self.template(process, region, key)?.integral(true, true))
    }

    /// Fraction of events within the histogram range
    pub fn fitted_fraction(
        &self,
        process: &str,
        region: &str,
        key: &HistogramKey,
    ) -> Result<f64, TemplateError> {
        let template = self.template(process, region, key)?;
        Ok(ratio(
            template.integral(false, false),
            template.integral(true, true),
        ))
    }

    /// Number of events within the histogram range
    pub fn fitted_events(
        &self,
        process: &str,
        region: &str,
        key: &HistogramKey,
    ) -> Result<f64, TemplateError> {
        Ok(self.template(process, region, key)?.integral(false, false))
    }

    /// Replace the data by the sum of the given process templates
    ///
    /// Used for closure tests. The sum is multiplied by `scale` to
    /// emulate higher or lower event statistics.
    pub fn sum_templates(
        &mut self,
        processes: &[String],
        scale: f64,
    ) -> Result<(), TemplateError> {
        info!("Replacing data by the sum of {} templates, scaled by {scale}", processes.len());
        let mut sum = RegionHistograms::new();
        for process in processes {
            let Some(regions) = self.templates.get(process) else {
                continue;
            };
            for (region, hists) in regions {
                for (key, hist) in hists {
                    let target = sum
                        .entry(region.clone())
                        .or_default()
                        .entry(key.clone())
                        .or_insert_with(|| hist.empty_clone());
                    target.add_scaled(hist, scale).map_err(|source| {
                        TemplateError::Histogram {
                            process: process.clone(),
                            region: region.clone(),
                            key: key.clone(),
                            source,
                        }
                    })?;
                }
            }
        }
        self.data = sum;
        Ok(())
    }

    /// Add histograms with half the difference between up and down shifts
    ///
    /// For every template with both an `Up` and a `Down` variation of
    /// `sys`, a `Diff` variation `(Up - Down) / 2` is added.
    pub fn compute_sys_histograms(
        &mut self,
        sys: &SysUncertainty,
    ) -> Result<(), TemplateError> {
        let (up, down, diff) = (sys.up(), sys.down(), sys.diff());
        for (process, regions) in self.templates.iter_mut() {
            for (region, hists) in regions.iter_mut() {
                let mut new = Vec::new();
                for (key, hist_up) in hists.iter() {
                    if key.sys_shift.as_deref() != Some(up.as_str()) {
                        continue;
                    }
                    let Some(hist_down) = hists.get(&key.shifted(&down)) else {
                        debug!("No `{down}` variation for {process} {region} {key}");
                        continue;
                    };
                    let mut hist_diff = hist_up.clone();
                    hist_diff.scale(0.5);
                    hist_diff.add_scaled(hist_down, -0.5).map_err(|source| {
                        TemplateError::Histogram {
                            process: process.clone(),
                            region: region.clone(),
                            key: key.clone(),
                            source,
                        }
                    })?;
                    trace!("{process} {region} {key}: adding `{diff}`");
                    new.push((key.shifted(&diff), hist_diff));
                }
                hists.extend(new);
            }
        }
        Ok(())
    }

    /// Replace the templates of a process by the data distribution in a sideband
    ///
    /// For each target region, tau id. and observable the template is
    /// replaced by the inclusive data distribution in `sideband`,
    /// normalised to the number of events in the replaced template.
    pub fn take_template_from_data(
        &mut self,
        process: &str,
        sideband: &str,
        target_regions: &[Region],
        tau_ids: &[String],
        observables: &[String],
    ) -> Result<(), TemplateError> {
        for tau_id in tau_ids {
            for observable in observables {
                let key_all = HistogramKey::new(observable, tau_id, Selection::All);
                let sideband_hist = self.data_histogram(sideband, &key_all)?.clone();
                for region in target_regions {
                    let key = HistogramKey::new(observable, tau_id, selection_for(region));
                    let template = self.template_mut(process, region.label(), &key)?;
                    let norm = template.integral(true, true);
                    debug!(
                        "{process} {region} {key}: taking template from data in {sideband}, norm = {norm}"
                    );
                    *template = sideband_hist.normalized_to(norm);
                }
            }
        }
        Ok(())
    }

    /// Region probabilities predicted by the MC for one process
    ///
    /// Missing histograms lead to `NaN` entries.
    pub fn mc_expectation(
        &self,
        process: &str,
        tau_id: &str,
        mt_variable: &str,
        fit_variable: &str,
    ) -> McExpectation {
        let key = HistogramKey::new(mt_variable, tau_id, Selection::All);
        let n = |region: &str, key: &HistogramKey| {
            self.num_events(process, region, key).unwrap_or(f64::NAN)
        };
        let [a, b, c, c1, c2, d] =
            ["A", "B", "C", "C1", "C2", "D"].map(|region| n(region, &key));
        let c1p = n(
            "C1p",
            &HistogramKey::new(fit_variable, tau_id, Selection::Passed),
        );
        let c2p = n(
            "C2p",
            &HistogramKey::new(mt_variable, tau_id, Selection::Passed),
        );
        McExpectation {
            a_over_b: a / b,
            c_over_d: c / d,
            c_over_ac: c / (a + c),
            d_over_bd: d / (b + d),
            c1_over_c: c1 / c,
            c1p_over_c1: c1p / c1,
            c2p_over_c2: c2p / c2,
        }
    }

    /// Copy containing only unshifted histograms
    pub fn central(&self) -> Self {
        let strip = |regions: &RegionHistograms| -> RegionHistograms {
            regions
                .iter()
                .map(|(region, hists)| {
                    let hists = hists
                        .iter()
                        .filter(|(key, _)| key.sys_shift.is_none())
                        .map(|(k, h)| (k.clone(), h.clone()))
                        .collect();
                    (region.clone(), hists)
                })
                .collect()
        };
        Self {
            data: strip(&self.data),
            templates: self
                .templates
                .iter()
                .map(|(p, r)| (p.clone(), strip(r)))
                .collect(),
        }
    }

    /// All systematic shift names appearing in the templates
    pub fn sys_shifts(&self) -> BTreeSet<&str> {
        self.templates
            .values()
            .flat_map(|r| r.values())
            .flat_map(|k| k.keys())
            .filter_map(|k| k.sys_shift.as_deref())
            .collect()
    }
}

/// Take the templates of a process from a data sideband
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateFromData {
    pub process: String,
    pub sideband: String,
    /// Regions whose templates are replaced
    pub regions: Vec<String>,
    pub tau_ids: Vec<String>,
    pub observables: Vec<String>,
}

/// Preparation of the templates before fitting
///
/// The steps are applied in order:
/// 1. Add `Diff` histograms for each systematic uncertainty
/// 2. For a closure test, replace the data by the sum of the templates
/// 3. Take templates from data
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemplatePreparer {
    pub sys_uncertainties: Vec<SysUncertainty>,
    /// Processes summed up for a closure test, together with the scale factor
    pub closure_test: Option<(Vec<String>, f64)>,
    pub from_data: Option<TemplateFromData>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PrepareError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Region(#[from] RegionError),
}

impl Prepare for TemplatePreparer {
    type Error = PrepareError;

    fn prepare(&mut self, mut set: HistogramSet) -> Result<HistogramSet, Self::Error> {
        for sys in &self.sys_uncertainties {
            debug!("Computing `{}` histograms", sys.diff());
            set.compute_sys_histograms(sys)?;
        }
        if let Some((processes, scale)) = &self.closure_test {
            set.sum_templates(processes, *scale)?;
        }
        if let Some(from_data) = &self.from_data {
            info!(
                "Taking {} templates from data in {}",
                from_data.process, from_data.sideband
            );
            let regions: Vec<Region> = from_data
                .regions
                .iter()
                .map(|r| r.parse())
                .collect::<Result<_, _>>()?;
            set.take_template_from_data(
                &from_data.process,
                &from_data.sideband,
                &regions,
                &from_data.tau_ids,
                &from_data.observables,
            )?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn log_init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn hist(contents: &[f64], underflow: f64, overflow: f64) -> Histogram {
        Histogram::from_contents(0., 1., contents.to_vec())
            .unwrap()
            .with_flow(underflow, overflow)
    }

    fn key(selection: Selection) -> HistogramKey {
        HistogramKey::new("diTauMt", "tauDiscrHPSloose", selection)
    }

    fn example() -> HistogramSet {
        let mut set = HistogramSet::new();
        set.insert_template("Ztautau", "C1", key(Selection::All), hist(&[2., 4.], 1., 1.));
        set.insert_template("QCD", "C1", key(Selection::All), hist(&[1., 1.], 0., 0.));
        set.insert_template("QCD", "C1p", key(Selection::Passed), hist(&[1., 0.], 0., 0.));
        set.insert_data("B1", key(Selection::All), hist(&[3., 1.], 0., 0.));
        set
    }

    #[test]
    fn num_events() {
        log_init();
        let set = example();
        assert_relative_eq!(set.num_events("Ztautau", "C1", &key(Selection::All)).unwrap(), 8.);
        assert_relative_eq!(set.fitted_fraction("Ztautau", "C1", &key(Selection::All)).unwrap(), 0.75);
        assert_relative_eq!(set.fitted_events("Ztautau", "C1", &key(Selection::All)).unwrap(), 6.);
        assert_relative_eq!(set.num_events(SUM, "C1", &key(Selection::All)).unwrap(), 10.);
        assert!(set.num_events("Zmumu", "C1", &key(Selection::All)).is_err());
        assert!(set.num_events(SUM, "C1p", &key(Selection::Passed)).is_err());
    }

    #[test]
    fn closure_data() {
        log_init();
        let mut set = example();
        set.sum_templates(&["Ztautau".to_owned(), "QCD".to_owned()], 2.)
            .unwrap();
        let data = set.data_histogram("C1", &key(Selection::All)).unwrap();
        assert_eq!(data.contents(), &[6., 10.]);
        assert_relative_eq!(data.overflow(), 2.);
        assert!(set.data_histogram("B1", &key(Selection::All)).is_err());
    }

    #[test]
    fn sys_histograms() {
        log_init();
        let mut set = example();
        let sys = SysUncertainty::new("SysTauJetEn");
        let k = key(Selection::All);
        set.insert_template("Ztautau", "C1", k.shifted(&sys.up()), hist(&[3., 6.], 0., 0.));
        set.insert_template("Ztautau", "C1", k.shifted(&sys.down()), hist(&[1., 2.], 0., 0.));
        set.compute_sys_histograms(&sys).unwrap();
        let diff = set.template("Ztautau", "C1", &k.shifted(&sys.diff())).unwrap();
        assert_eq!(diff.contents(), &[1., 2.]);
        assert!(set.template("QCD", "C1", &k.shifted(&sys.diff())).is_err());
        assert_eq!(set.central().sys_shifts().len(), 0);
        assert_eq!(set.sys_shifts().len(), 3);
    }

    #[test]
    fn template_from_data() {
        log_init();
        let mut set = example();
        let regions: Vec<Region> = ["C1", "C1p"].iter().map(|r| r.parse().unwrap()).collect();
        set.take_template_from_data(
            "QCD",
            "B1",
            &regions,
            &["tauDiscrHPSloose".to_owned()],
            &["diTauMt".to_owned()],
        )
        .unwrap();
        let c1 = set.template("QCD", "C1", &key(Selection::All)).unwrap();
        assert_relative_eq!(c1.content(0), 1.5);
        assert_relative_eq!(c1.content(1), 0.5);
        let c1p = set.template("QCD", "C1p", &key(Selection::Passed)).unwrap();
        assert_relative_eq!(c1p.content(0), 0.75);
        assert_relative_eq!(c1p.content(1), 0.25);
    }

    #[test]
    fn mc_expectation() {
        use crate::fit::tests::{synthetic_set, FIT_VAR, TAU_ID};
        log_init();
        let set = synthetic_set();
        let exp = set.mc_expectation("Ztautau", TAU_ID, "diTauMt", FIT_VAR);
        assert_relative_eq!(exp.a_over_b, 9., max_relative = 1e-12);
        assert_relative_eq!(exp.c_over_ac, 0.8, max_relative = 1e-12);
        assert_relative_eq!(exp.d_over_bd, 0.8, max_relative = 1e-12);
        assert_relative_eq!(exp.c1_over_c, 0.7, max_relative = 1e-12);
        assert_relative_eq!(exp.c1p_over_c1, 0.6, max_relative = 1e-12);
        assert_relative_eq!(exp.c2p_over_c2, 0.6, max_relative = 1e-12);
        let exp = set.mc_expectation("Ztautau", "tauDiscrHPStight", "diTauMt", FIT_VAR);
        assert!(exp.c1p_over_c1.is_nan());
    }

    #[test]
    fn prepare() {
        log_init();
        let sys = SysUncertainty::new("SysJetEn");
        let k = key(Selection::All);
        let mut set = example();
        set.insert_template("QCD", "C1", k.shifted(&sys.up()), hist(&[2., 2.], 0., 0.));
        set.insert_template("QCD", "C1", k.shifted(&sys.down()), hist(&[0., 0.], 0., 0.));
        let mut preparer = TemplatePreparer {
            sys_uncertainties: vec![sys.clone()],
            closure_test: None,
            from_data: Some(TemplateFromData {
                process: "QCD".to_owned(),
                sideband: "B1".to_owned(),
                regions: vec!["C1".to_owned()],
                tau_ids: vec!["tauDiscrHPSloose".to_owned()],
                observables: vec!["diTauMt".to_owned()],
            }),
        };
        let set = preparer.prepare(set).unwrap();
        let diff = set.template("QCD", "C1", &k.shifted(&sys.diff())).unwrap();
        assert_eq!(diff.contents(), &[1., 1.]);
        assert_relative_eq!(set.template("QCD", "C1", &k).unwrap().content(0), 1.5);

        preparer.from_data.as_mut().unwrap().sideband = "A1".to_owned();
        assert!(matches!(
            preparer.prepare(example()),
            Err(PrepareError::Template(TemplateError::MissingData { .. }))
        ));
    }
}
