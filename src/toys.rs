use std::collections::BTreeMap;

use derive_builder::Builder;
use itertools::iproduct;
use log::{debug, info, trace, warn};
use noisy_float::prelude::*;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::fit::{fit_tau_id_eff, FitOptions};
use crate::histogram::{Histogram, HistogramError};
use crate::key::SysUncertainty;
use crate::progress_bar::{Progress, ProgressBar};
use crate::templates::HistogramSet;

/// Maximum absolute shift in units of the systematic uncertainty
const MAX_SYS_SHIFT: f64 = 3.;

/// Fluctuate every bin within its uncertainty
///
/// Contents are drawn from a Gaussian with the bin error as width and
/// clipped at zero.
pub fn sample_stat<R: Rng>(hist: &Histogram, rng: &mut R) -> Histogram {
    let mut res = hist.clone();
    for bin in 0..hist.nbins() {
        let err = hist.bin_error(bin);
        if !(err > 0.) {
            continue;
        }
        let content = match Normal::new(hist.content(bin), err) {
            Ok(distr) => distr.sample(rng),
            Err(_) => hist.content(bin),
        };
        res.set_content(bin, content.max(0.));
        res.set_bin_error(bin, err);
    }
    res
}

/// Draw the templates of a pseudo-experiment
///
/// The central templates are fluctuated statistically. Then, for each
/// systematic uncertainty, a single shift `x` drawn from a normal
/// distribution and clipped to `[-3, 3]` adds `x` times the
/// corresponding `Diff` histogram to every template. Up and down shifted
/// templates are moved along with their central template, so that
/// morphing sees the same variations as in the nominal fit. Data are kept.
pub fn sample_templates<R: Rng>(
    set: &HistogramSet,
    sys_uncertainties: &[SysUncertainty],
    rng: &mut R,
) -> Result<HistogramSet, HistogramError> {
    let central = set.central();
    let shifts: Vec<f64> = sys_uncertainties
        .iter()
        .map(|_| {
            let x: f64 = StandardNormal.sample(rng);
            x.clamp(-MAX_SYS_SHIFT, MAX_SYS_SHIFT)
        })
        .collect();
    let mut templates = BTreeMap::new();
    for (process, regions) in &central.templates {
        for (region, hists) in regions {
            let target = templates
                .entry(process.clone())
                .or_insert_with(BTreeMap::new)
                .entry(region.clone())
                .or_insert_with(BTreeMap::new);
            for (key, hist) in hists {
                let mut fluct = sample_stat(hist, rng);
                for (sys, &x) in sys_uncertainties.iter().zip(&shifts) {
                    let Ok(diff) = set.template(process, region, &key.shifted(&sys.diff())) else {
                        trace!("No `{}` for {process} {region} {key}", sys.diff());
                        continue;
                    };
                    fluct.add_scaled(diff, x)?;
                    clip_negative(&mut fluct);
                }
                let mut change = fluct.clone();
                change.add_scaled(hist, -1.)?;
                for sys in sys_uncertainties {
                    for shift in [sys.up(), sys.down()] {
                        let shifted_key = key.shifted(&shift);
                        let Ok(shifted) = set.template(process, region, &shifted_key) else {
                            continue;
                        };
                        let mut shifted = shifted.clone();
                        shifted.add_scaled(&change, 1.)?;
                        clip_negative(&mut shifted);
                        target.insert(shifted_key, shifted);
                    }
                }
                target.insert(key.clone(), fluct);
            }
        }
    }
    Ok(HistogramSet {
        data: central.data,
        templates,
    })
}

fn clip_negative(hist: &mut Histogram) {
    hist.contents_mut().iter_mut().for_each(|c| *c = c.max(0.));
}

/// Settings for pseudo-experiments
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct PseudoExperiments {
    num: u64,
    /// Experiment `i` uses a generator seeded with `seed + i`
    #[builder(default)]
    seed: u64,
    #[builder(default)]
    sys_uncertainties: Vec<SysUncertainty>,
}

/// Statistics of the efficiencies obtained in pseudo-experiments
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub num_experiments: u64,
    pub num_converged: u64,
    pub mean: f64,
    pub rms: f64,
    pub median: f64,
    pub quantile_16: f64,
    pub quantile_84: f64,
}

impl Summary {
    pub fn convergence_rate(&self) -> f64 {
        if self.num_experiments == 0 {
            return 0.;
        }
        self.num_converged as f64 / self.num_experiments as f64
    }
}

/// Outcome of all pseudo-experiments for one tau id. and fit variable
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PseudoExperimentResult {
    pub tau_id: String,
    pub fit_variable: String,
    pub eff_distribution: Histogram,
    /// First bin: failed fits, second bin: converged fits
    pub fit_convergence_distribution: Histogram,
    pub summary: Summary,
}

/// Outcome of a single fit: the efficiency, if any, and whether it converged
type Outcome = (Option<f64>, bool);

fn summarise(outcomes: &[Outcome]) -> Summary {
    let mut effs: Vec<N64> = outcomes
        .iter()
        .filter_map(|(eff, _)| *eff)
        .filter(|eff| eff.is_finite())
        .map(n64)
        .collect();
    let num_converged = outcomes.iter().filter(|(_, converged)| *converged).count();
    let mut res = Summary {
        num_experiments: outcomes.len() as u64,
        num_converged: num_converged as u64,
        ..Default::default()
    };
    if effs.is_empty() {
        return res;
    }
    effs.sort_unstable();
    let n = effs.len() as f64;
    let mean = effs.iter().copied().sum::<N64>() / n;
    let var = effs.iter().map(|&e| (e - mean) * (e - mean)).sum::<N64>() / n;
    let quantile = |p: f64| -> f64 {
        let idx = ((n - 1.) * p).round() as usize;
        effs[idx].into()
    };
    res.mean = mean.into();
    res.rms = var.sqrt().into();
    res.median = quantile(0.5);
    res.quantile_16 = quantile(0.16);
    res.quantile_84 = quantile(0.84);
    res
}

impl PseudoExperiments {
    /// Run pseudo-experiments for all combinations of tau ids. and fit variables
    ///
    /// Results are independent of the number of threads.
    pub fn run(
        &self,
        set: &HistogramSet,
        tau_ids: &[String],
        fit_variables: &[String],
        options: &FitOptions,
    ) -> Result<Vec<PseudoExperimentResult>, HistogramError> {
        info!("Running {} pseudo-experiments", self.num);
        let combinations: Vec<_> = iproduct!(tau_ids, fit_variables).collect();
        let progress = ProgressBar::new(self.num, "pseudo-experiments:");
        let outcomes: Vec<Vec<Outcome>> = (0..self.num)
            .into_par_iter()
            .map(|i| -> Result<Vec<Outcome>, HistogramError> {
                let mut rng = Xoshiro256Plus::seed_from_u64(self.seed.wrapping_add(i));
                let toy = sample_templates(set, &self.sys_uncertainties, &mut rng)?;
                let res = combinations
                    .iter()
                    .map(|(tau_id, var)| match fit_tau_id_eff(&toy, tau_id, var, options) {
                        Ok(fit) => (Some(fit.efficiency), fit.converged),
                        Err(err) => {
                            debug!("Pseudo-experiment {i} for {tau_id} in {var} failed: {err}");
                            (None, false)
                        }
                    })
                    .collect();
                progress.inc(1);
                Ok(res)
            })
            .collect::<Result<_, _>>()?;
        progress.finish();

        let mut results = Vec::with_capacity(combinations.len());
        for (n, (tau_id, var)) in combinations.into_iter().enumerate() {
            let outcomes: Vec<Outcome> = outcomes.iter().map(|o| o[n]).collect();
            let mut eff_distribution = Histogram::new(101, -0.005, 1.005)?;
            let mut fit_convergence_distribution = Histogram::new(2, -0.005, 1.005)?;
            for &(eff, converged) in &outcomes {
                if let Some(eff) = eff {
                    eff_distribution.fill(eff, 1.);
                }
                fit_convergence_distribution.fill(if converged { 1. } else { 0. }, 1.);
            }
            let summary = summarise(&outcomes);
            info!(
                "{tau_id} in {var}: efficiency = {:.2} ± {:.2}% (median {:.2}%, 68% interval [{:.2}, {:.2}]%)",
                100. * summary.mean,
                100. * summary.rms,
                100. * summary.median,
                100. * summary.quantile_16,
                100. * summary.quantile_84,
            );
            if summary.num_converged < summary.num_experiments {
                warn!(
                    "{tau_id} in {var}: {} of {} fits converged",
                    summary.num_converged, summary.num_experiments
                );
            }
            results.push(PseudoExperimentResult {
                tau_id: tau_id.clone(),
                fit_variable: var.clone(),
                eff_distribution,
                fit_convergence_distribution,
                summary,
            });
        }
        Ok(results)
    }
}
