use itertools::zip_eq;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A one-dimensional histogram with uniform binning
///
/// Bin contents and the sums of squared weights are stored for the
/// `nbins` bins in `[xmin, xmax)`. Entries outside the axis range go
/// into the underflow and overflow bins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    xmin: f64,
    xmax: f64,
    contents: Vec<f64>,
    #[serde(default)]
    sumw2: Option<Vec<f64>>,
    #[serde(default)]
    underflow: f64,
    #[serde(default)]
    overflow: f64,
    #[serde(default)]
    underflow_sumw2: f64,
    #[serde(default)]
    overflow_sumw2: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HistogramError {
    #[error("Invalid axis range [{0}, {1})")]
    InvalidRange(f64, f64),
    #[error("Histogram needs at least one bin")]
    NoBins,
    #[error("Got {0} bin contents but {1} squared weights")]
    SumW2Length(usize, usize),
    #[error("Incompatible binning: {0} bins on [{1}, {2}) vs. {3} bins on [{4}, {5})")]
    Binning(usize, f64, f64, usize, f64, f64),
}

impl Histogram {
    /// Empty histogram with `nbins` bins on `[xmin, xmax)`
    pub fn new(nbins: usize, xmin: f64, xmax: f64) -> Result<Self, HistogramError> {
        if nbins == 0 {
            return Err(HistogramError::NoBins);
        }
        if !(xmin < xmax) {
            return Err(HistogramError::InvalidRange(xmin, xmax));
        }
        Ok(Self {
            xmin,
            xmax,
            contents: vec![0.; nbins],
            sumw2: Some(vec![0.; nbins]),
            underflow: 0.,
            overflow: 0.,
            underflow_sumw2: 0.,
            overflow_sumw2: 0.,
        })
    }

    /// Histogram with the given bin contents
    ///
    /// Without explicit squared weights, entries are assumed to be
    /// unweighted, i.e. the squared weights equal the contents.
    pub fn from_contents(
        xmin: f64,
        xmax: f64,
        contents: Vec<f64>,
    ) -> Result<Self, HistogramError> {
        let mut res = Self::new(contents.len(), xmin, xmax)?;
        res.sumw2 = None;
        res.contents = contents;
        Ok(res)
    }

    pub fn with_sumw2(mut self, sumw2: Vec<f64>) -> Result<Self, HistogramError> {
        if sumw2.len() != self.contents.len() {
            return Err(HistogramError::SumW2Length(
                self.contents.len(),
                sumw2.len(),
            ));
        }
        self.sumw2 = Some(sumw2);
        Ok(self)
    }

    pub fn with_flow(mut self, underflow: f64, overflow: f64) -> Self {
        self.underflow = underflow;
        self.overflow = overflow;
        self.underflow_sumw2 = underflow.abs();
        self.overflow_sumw2 = overflow.abs();
        self
    }

    /// Check that a histogram read from a file is consistent
    pub fn validate(&self) -> Result<(), HistogramError> {
        if self.contents.is_empty() {
            return Err(HistogramError::NoBins);
        }
        if !(self.xmin < self.xmax) {
            return Err(HistogramError::InvalidRange(self.xmin, self.xmax));
        }
        if let Some(sumw2) = &self.sumw2 {
            if sumw2.len() != self.contents.len() {
                return Err(HistogramError::SumW2Length(
                    self.contents.len(),
                    sumw2.len(),
                ));
            }
        }
        Ok(())
    }

    pub fn nbins(&self) -> usize {
        self.contents.len()
    }

    pub fn xmin(&self) -> f64 {
        self.xmin
    }

    pub fn xmax(&self) -> f64 {
        self.xmax
    }

    pub fn bin_width(&self) -> f64 {
        (self.xmax - self.xmin) / self.nbins() as f64
    }

    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut [f64] {
        &mut self.contents
    }

    pub fn content(&self, bin: usize) -> f64 {
        self.contents[bin]
    }

    pub fn set_content(&mut self, bin: usize, content: f64) {
        self.contents[bin] = content;
    }

    /// Sum of squared weights in the given bin
    pub fn sumw2(&self, bin: usize) -> f64 {
        match &self.sumw2 {
            Some(sumw2) => sumw2[bin],
            None => self.contents[bin].abs(),
        }
    }

    pub fn bin_error(&self, bin: usize) -> f64 {
        self.sumw2(bin).sqrt()
    }

    pub fn set_bin_error(&mut self, bin: usize, err: f64) {
        self.sumw2_mut()[bin] = err * err;
    }

    fn sumw2_mut(&mut self) -> &mut Vec<f64> {
        let contents = &self.contents;
        self.sumw2
            .get_or_insert_with(|| contents.iter().map(|c| c.abs()).collect())
    }

    pub fn underflow(&self) -> f64 {
        self.underflow
    }

    pub fn overflow(&self) -> f64 {
        self.overflow
    }

    /// Index of the bin containing `x`, `None` for underflow and overflow
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.xmin) || x >= self.xmax {
            return None;
        }
        let bin = ((x - self.xmin) / self.bin_width()) as usize;
        Some(bin.min(self.nbins() - 1))
    }

    pub fn fill(&mut self, x: f64, weight: f64) {
        match self.find_bin(x) {
            Some(bin) => {
                self.sumw2_mut()[bin] += weight * weight;
                self.contents[bin] += weight;
            }
            None if x < self.xmin => {
                self.underflow += weight;
                self.underflow_sumw2 += weight * weight;
            }
            None => {
                self.overflow += weight;
                self.overflow_sumw2 += weight * weight;
            }
        }
    }

    /// Sum of bin contents in the axis range, optionally including underflow and overflow
    pub fn integral(&self, include_underflow: bool, include_overflow: bool) -> f64 {
        let mut res: f64 = self.contents.iter().sum();
        if include_underflow {
            res += self.underflow;
        }
        if include_overflow {
            res += self.overflow;
        }
        res
    }

    /// Total number of entries, including underflow and overflow
    pub fn total(&self) -> f64 {
        self.integral(true, true)
    }

    pub fn scale(&mut self, factor: f64) {
        let sqr = factor * factor;
        for s in self.sumw2_mut().iter_mut() {
            *s *= sqr;
        }
        for c in self.contents.iter_mut() {
            *c *= factor;
        }
        self.underflow *= factor;
        self.overflow *= factor;
        self.underflow_sumw2 *= sqr;
        self.overflow_sumw2 *= sqr;
    }

    /// Copy scaled such that the total number of entries is `norm`
    ///
    /// Histograms without entries are returned unchanged.
    pub fn normalized_to(&self, norm: f64) -> Self {
        let mut res = self.clone();
        let total = self.total();
        if total != 0. {
            res.scale(norm / total);
        }
        res
    }

    pub fn same_binning(&self, other: &Self) -> Result<(), HistogramError> {
        if self.nbins() == other.nbins()
            && self.xmin == other.xmin
            && self.xmax == other.xmax
        {
            Ok(())
        } else {
            Err(HistogramError::Binning(
                self.nbins(),
                self.xmin,
                self.xmax,
                other.nbins(),
                other.xmin,
                other.xmax,
            ))
        }
    }

    /// Add `factor` times `other` to this histogram
    pub fn add_scaled(&mut self, other: &Self, factor: f64) -> Result<(), HistogramError> {
        self.same_binning(other)?;
        let nbins = self.nbins();
        let mut sumw2: Vec<_> = (0..nbins).map(|bin| self.sumw2(bin)).collect();
        for (bin, (c, s)) in zip_eq(&mut self.contents, &mut sumw2).enumerate() {
            *c += factor * other.contents[bin];
            *s += factor * factor * other.sumw2(bin);
        }
        self.sumw2 = Some(sumw2);
        self.underflow += factor * other.underflow;
        self.overflow += factor * other.overflow;
        self.underflow_sumw2 += factor * factor * other.underflow_sumw2;
        self.overflow_sumw2 += factor * factor * other.overflow_sumw2;
        Ok(())
    }

    /// Bin contents normalised to unit sum over the axis range
    ///
    /// Negative contents are treated as zero. If nothing remains, a
    /// flat shape is returned.
    pub fn shape(&self) -> Vec<f64> {
        let clipped = self.contents.iter().map(|c| c.max(0.));
        let sum: f64 = clipped.clone().sum();
        if sum > 0. {
            clipped.map(|c| c / sum).collect()
        } else {
            vec![1. / self.nbins() as f64; self.nbins()]
        }
    }

    /// Whether any bin carries weights different from one
    pub fn is_weighted(&self) -> bool {
        match &self.sumw2 {
            None => false,
            Some(sumw2) => zip_eq(&self.contents, sumw2)
                .any(|(c, s)| (c - s).abs() > 1e-9 * c.abs().max(1.)),
        }
    }

    /// Copy with all entries set to zero
    pub fn empty_clone(&self) -> Self {
        let mut res = self.clone();
        res.contents.iter_mut().for_each(|c| *c = 0.);
        res.sumw2 = Some(vec![0.; self.nbins()]);
        res.underflow = 0.;
        res.overflow = 0.;
        res.underflow_sumw2 = 0.;
        res.overflow_sumw2 = 0.;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn histogram() -> Histogram {
        Histogram::from_contents(0., 4., vec![1., 2., 3., 4.])
            .unwrap()
            .with_flow(2., 3.)
    }

    #[test]
    fn integral() {
        let h = histogram();
        assert_relative_eq!(h.integral(false, false), 10.);
        assert_relative_eq!(h.integral(true, false), 12.);
        assert_relative_eq!(h.integral(true, true), 15.);
    }

    #[test]
    fn normalize() {
        let h = histogram().normalized_to(30.);
        assert_relative_eq!(h.total(), 30.);
        assert_relative_eq!(h.content(3), 8.);
        // unweighted entries scaled by 2 -> sumw2 scaled by 4
        assert_relative_eq!(h.sumw2(3), 16.);

        let empty = Histogram::new(3, 0., 1.).unwrap();
        assert_eq!(empty.normalized_to(5.), empty);
    }

    #[test]
    fn shape_clips_negative_bins() {
        let h = Histogram::from_contents(0., 3., vec![-1., 1., 3.]).unwrap();
        assert_eq!(h.shape(), vec![0., 0.25, 0.75]);
        let h = Histogram::from_contents(0., 2., vec![-1., 0.]).unwrap();
        assert_eq!(h.shape(), vec![0.5, 0.5]);
    }

    #[test]
    fn fill_and_find() {
        let mut h = Histogram::new(101, -0.005, 1.005).unwrap();
        h.fill(0.5, 1.);
        h.fill(0., 1.);
        h.fill(2., 1.);
        assert_eq!(h.find_bin(0.5), Some(50));
        assert_relative_eq!(h.content(50), 1.);
        assert_relative_eq!(h.content(0), 1.);
        assert_relative_eq!(h.overflow(), 1.);
        assert_eq!(h.find_bin(f64::NAN), None);
    }

    #[test]
    fn add_scaled() {
        let mut h = histogram();
        let other = histogram();
        h.add_scaled(&other, -0.5).unwrap();
        assert_relative_eq!(h.content(1), 1.);
        assert_relative_eq!(h.sumw2(1), 2. + 0.25 * 2.);
        assert_relative_eq!(h.overflow(), 1.5);

        let wrong = Histogram::new(3, 0., 4.).unwrap();
        assert!(h.add_scaled(&wrong, 1.).is_err());
    }

    #[test]
    fn weights() {
        let h = histogram();
        assert!(!h.is_weighted());
        let h = h.with_sumw2(vec![1., 4., 3., 4.]).unwrap();
        assert!(h.is_weighted());
        assert_relative_eq!(h.bin_error(1), 2.);
    }

    #[test]
    fn invalid() {
        assert_eq!(Histogram::new(0, 0., 1.), Err(HistogramError::NoBins));
        assert!(matches!(
            Histogram::new(1, 1., 1.),
            Err(HistogramError::InvalidRange(_, _))
        ));
    }
}
