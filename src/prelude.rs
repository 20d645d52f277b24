pub use crate::{
    config::Config,
    fit::{fit_tau_id_eff, FitMode, FitOptions, FitResults, TauIdEffFit, TauIdEffFitter},
    histogram::Histogram,
    measurement::{Measurement, MeasurementBuilder},
    reader::HistogramReader,
    templates::{HistogramSet, TemplatePreparer},
    toys::PseudoExperiments,
    traits::*,
    writer::YamlWriter,
};
