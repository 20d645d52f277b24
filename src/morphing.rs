use std::borrow::Cow;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::histogram::{Histogram, HistogramError};

/// How systematically shifted templates enter the fit
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MorphingMode {
    /// Only nominal templates
    #[default]
    None,
    /// Bin-by-bin interpolation of the template contents
    Vertical,
    /// Interpolation of the cumulative distributions
    Horizontal,
}

/// Interpolation scheme for vertical morphing
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Interpolation {
    /// Piecewise linear
    Code0,
    /// Polynomial for |α| ≤ 1, linear beyond
    #[default]
    Code4p,
}

/// Shift of a nominal value for nuisance parameter `alpha`
///
/// `up` and `down` are the values for `alpha = 1` and `alpha = -1`.
pub fn vertical_delta(
    alpha: f64,
    nominal: f64,
    up: f64,
    down: f64,
    interpolation: Interpolation,
) -> f64 {
    let delta_up = up - nominal;
    let delta_dn = nominal - down;
    if interpolation == Interpolation::Code0 || alpha.abs() > 1. {
        return if alpha >= 0. {
            alpha * delta_up
        } else {
            alpha * delta_dn
        };
    }
    let s = 0.5 * (delta_up + delta_dn);
    let a = 0.0625 * (delta_up - delta_dn);
    let asq = alpha * alpha;
    alpha * s + asq * (asq * (asq * 3. - 10.) + 15.) * a
}

/// A template together with its systematic variations
#[derive(Clone, Debug, PartialEq)]
pub struct MorphedTemplate {
    nominal: Histogram,
    nominal_shape: Vec<f64>,
    /// Index of the nuisance parameter and the up/down shifted templates
    variations: Vec<(usize, Histogram, Histogram)>,
}

impl MorphedTemplate {
    pub fn new(nominal: Histogram) -> Self {
        Self {
            nominal_shape: nominal.shape(),
            nominal,
            variations: Vec::new(),
        }
    }

    /// Add up and down shifted templates, which must have the nominal binning
    pub fn add_variation(
        &mut self,
        nuisance: usize,
        up: Histogram,
        down: Histogram,
    ) -> Result<(), HistogramError> {
        self.nominal.same_binning(&up)?;
        self.nominal.same_binning(&down)?;
        self.variations.push((nuisance, up, down));
        Ok(())
    }

    /// The nominal template followed by all shifted templates
    pub fn histograms(&self) -> impl Iterator<Item = &Histogram> + '_ {
        std::iter::once(&self.nominal)
            .chain(self.variations.iter().flat_map(|(_, up, down)| [up, down]))
    }

    pub fn nuisances(&self) -> impl Iterator<Item = usize> + '_ {
        self.variations.iter().map(|(n, _, _)| *n)
    }

    /// Normalised shape for the given nuisance parameter values
    pub fn shape(
        &self,
        nuisances: &[f64],
        mode: MorphingMode,
        interpolation: Interpolation,
    ) -> Cow<'_, [f64]> {
        if self.variations.is_empty() {
            return Cow::Borrowed(&self.nominal_shape);
        }
        match mode {
            MorphingMode::None => Cow::Borrowed(&self.nominal_shape),
            MorphingMode::Vertical => {
                let mut contents = self.nominal.contents().to_vec();
                for (nuisance, up, down) in &self.variations {
                    let alpha = nuisances[*nuisance];
                    for (bin, c) in contents.iter_mut().enumerate() {
                        *c += vertical_delta(
                            alpha,
                            self.nominal.content(bin),
                            up.content(bin),
                            down.content(bin),
                            interpolation,
                        );
                    }
                }
                Cow::Owned(normalise(contents))
            }
            MorphingMode::Horizontal => {
                let mut shape = self.nominal_shape.clone();
                for (nuisance, up, down) in &self.variations {
                    let alpha = nuisances[*nuisance];
                    let shifted = if alpha >= 0. { up } else { down };
                    shape = horizontal_morph(
                        &shape,
                        &shifted.shape(),
                        alpha.abs().min(1.),
                    );
                }
                Cow::Owned(shape)
            }
        }
    }
}

fn normalise(mut contents: Vec<f64>) -> Vec<f64> {
    contents.iter_mut().for_each(|c| *c = c.max(0.));
    let sum: f64 = contents.iter().sum();
    if sum > 0. {
        contents.iter_mut().for_each(|c| *c /= sum);
    } else {
        let n = contents.len() as f64;
        contents.iter_mut().for_each(|c| *c = 1. / n);
    }
    contents
}

/// Cumulative distribution at the bin edges, in units of the bin index
fn cdf(shape: &[f64]) -> Vec<f64> {
    let mut res = Vec::with_capacity(shape.len() + 1);
    res.push(0.);
    let mut sum = 0.;
    for c in shape {
        sum += c;
        res.push(sum);
    }
    res
}

/// Position, in units of the bin index, below which a fraction `p` of the distribution lies
fn quantile(cdf: &[f64], p: f64) -> f64 {
    let nbins = cdf.len() - 1;
    for bin in 0..nbins {
        let (lo, hi) = (cdf[bin], cdf[bin + 1]);
        if hi > lo && hi >= p {
            return bin as f64 + ((p - lo) / (hi - lo)).clamp(0., 1.);
        }
    }
    nbins as f64
}

/// Quantile interpolation between two normalised shapes with the same binning
///
/// The quantile function of the result is `(1 - w) Q_nominal + w Q_shifted`.
pub fn horizontal_morph(nominal: &[f64], shifted: &[f64], w: f64) -> Vec<f64> {
    let nbins = nominal.len();
    let cdf_nom = cdf(nominal);
    let cdf_shift = cdf(shifted);

    // the interpolated quantile function is linear between these points
    let ps: Vec<f64> = cdf_nom
        .iter()
        .chain(cdf_shift.iter())
        .map(|p| p.clamp(0., 1.))
        .sorted_by(|a, b| a.total_cmp(b))
        .dedup()
        .collect();
    let xs: Vec<f64> = ps
        .iter()
        .map(|&p| (1. - w) * quantile(&cdf_nom, p) + w * quantile(&cdf_shift, p))
        .collect();

    let morphed_cdf = |x: f64| -> f64 {
        if x <= xs[0] {
            return 0.;
        }
        for (j, (x0, x1)) in xs.iter().tuple_windows().enumerate() {
            if x <= *x1 {
                if x1 > x0 {
                    return ps[j] + (x - x0) / (x1 - x0) * (ps[j + 1] - ps[j]);
                }
                return ps[j + 1];
            }
        }
        1.
    };
    let edges: Vec<f64> = (0..=nbins).map(|k| morphed_cdf(k as f64)).collect();
    let contents = edges.iter().tuple_windows().map(|(lo, hi)| hi - lo).collect();
    normalise(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn code0_and_code4p() {
        for interp in [Interpolation::Code0, Interpolation::Code4p] {
            assert_relative_eq!(vertical_delta(0., 10., 12., 9., interp), 0.);
            assert_relative_eq!(vertical_delta(1., 10., 12., 9., interp), 2.);
            assert_relative_eq!(vertical_delta(-1., 10., 12., 9., interp), -1.);
            assert_relative_eq!(vertical_delta(2., 10., 12., 9., interp), 4.);
            assert_relative_eq!(vertical_delta(-2., 10., 12., 9., interp), -2.);
        }
        assert_relative_eq!(
            vertical_delta(0.5, 10., 12., 9., Interpolation::Code0),
            1.
        );
        // smooth at zero: the slope is the mean of up and down slopes
        let eps = 1e-6;
        let slope = vertical_delta(eps, 10., 12., 9., Interpolation::Code4p) / eps;
        assert_relative_eq!(slope, 1.5, epsilon = 1e-4);
    }

    #[test]
    fn vertical() {
        let nominal = Histogram::from_contents(0., 4., vec![1., 1., 1., 1.]).unwrap();
        let up = Histogram::from_contents(0., 4., vec![2., 1., 1., 0.]).unwrap();
        let down = Histogram::from_contents(0., 4., vec![0., 1., 1., 2.]).unwrap();
        let mut t = MorphedTemplate::new(nominal);
        t.add_variation(0, up, down).unwrap();

        let shape = t.shape(&[0.], MorphingMode::Vertical, Interpolation::Code0);
        assert_relative_eq!(&shape[..], [0.25; 4].as_slice());
        let shape = t.shape(&[1.], MorphingMode::Vertical, Interpolation::Code0);
        assert_relative_eq!(&shape[..], [0.5, 0.25, 0.25, 0.].as_slice());
        let shape = t.shape(&[1.], MorphingMode::None, Interpolation::Code0);
        assert_relative_eq!(&shape[..], [0.25; 4].as_slice());
    }

    #[test]
    fn variation_binning() {
        let nominal = Histogram::from_contents(0., 4., vec![1., 1., 1., 1.]).unwrap();
        let up = Histogram::from_contents(0., 4., vec![2., 2.]).unwrap();
        let down = Histogram::from_contents(0., 2., vec![1., 1., 1., 1.]).unwrap();
        let mut t = MorphedTemplate::new(nominal.clone());
        assert!(matches!(
            t.add_variation(0, up, nominal.clone()),
            Err(HistogramError::Binning(..))
        ));
        assert!(t.add_variation(0, nominal.clone(), down).is_err());
        assert_eq!(t.nuisances().count(), 0);
        let shape = t.shape(&[1.], MorphingMode::Vertical, Interpolation::Code0);
        assert_relative_eq!(&shape[..], [0.25; 4].as_slice());
    }

    #[test]
    fn horizontal_capped() {
        let nominal = Histogram::from_contents(0., 5., vec![0., 1., 0., 0., 0.]).unwrap();
        let up = Histogram::from_contents(0., 5., vec![0., 0., 0., 1., 0.]).unwrap();
        let down = Histogram::from_contents(0., 5., vec![1., 0., 0., 0., 0.]).unwrap();
        let mut t = MorphedTemplate::new(nominal);
        t.add_variation(0, up, down).unwrap();
        let at_one = t.shape(&[1.], MorphingMode::Horizontal, Interpolation::Code4p);
        let at_two = t.shape(&[2.], MorphingMode::Horizontal, Interpolation::Code4p);
        assert_relative_eq!(&at_two[..], &at_one[..], epsilon = 1e-12);
        assert_relative_eq!(&at_two[..], [0., 0., 0., 1., 0.].as_slice(), epsilon = 1e-12);
        let at_minus_two = t.shape(&[-2.], MorphingMode::Horizontal, Interpolation::Code4p);
        assert_relative_eq!(&at_minus_two[..], [1., 0., 0., 0., 0.].as_slice(), epsilon = 1e-12);
        let half = t.shape(&[0.5], MorphingMode::Horizontal, Interpolation::Code4p);
        assert_relative_eq!(&half[..], [0., 0., 1., 0., 0.].as_slice(), epsilon = 1e-12);
    }

    #[test]
    fn horizontal() {
        let nominal = [0., 1., 0., 0., 0.];
        let shifted = [0., 0., 0., 1., 0.];
        let morphed = horizontal_morph(&nominal, &shifted, 0.5);
        assert_relative_eq!(morphed.as_slice(), [0., 0., 1., 0., 0.].as_slice(), epsilon = 1e-12);
        let morphed = horizontal_morph(&nominal, &shifted, 0.);
        assert_relative_eq!(morphed.as_slice(), nominal.as_slice(), epsilon = 1e-12);
        let morphed = horizontal_morph(&nominal, &shifted, 1.);
        assert_relative_eq!(morphed.as_slice(), shifted.as_slice(), epsilon = 1e-12);
        let morphed = horizontal_morph(&nominal, &shifted, 0.25);
        assert_relative_eq!(morphed.iter().sum::<f64>(), 1., epsilon = 1e-12);
        assert_relative_eq!(morphed[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(morphed[2], 0.5, epsilon = 1e-12);
    }
}
