use crate::fit::FitResults;
use crate::templates::HistogramSet;

/// Obtain data distributions and templates
pub trait Load {
    type Error;

    fn load(&mut self) -> Result<HistogramSet, Self::Error>;
}

/// Transform the loaded histograms before fitting
pub trait Prepare {
    type Error;

    fn prepare(&mut self, set: HistogramSet) -> Result<HistogramSet, Self::Error>;
}

pub trait Fit {
    type Error;

    fn fit(&mut self, set: &HistogramSet) -> Result<FitResults, Self::Error>;
}

pub trait Write {
    type Error;

    fn write(&mut self, results: &FitResults) -> Result<(), Self::Error>;
}

pub trait Progress {
    fn inc(&self, i: u64);
    fn finish(&self);
}
