use std::convert::From;

use log::info;
use thiserror::Error;

use crate::fit::FitResults;
use crate::traits::*;

/// Stages of a tau id. efficiency measurement
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MeasurementBuilder<L, P, F, W> {
    pub loader: L,
    pub preparer: P,
    pub fitter: F,
    pub writer: W,
}

impl<L, P, F, W> MeasurementBuilder<L, P, F, W> {
    pub fn build(self) -> Measurement<L, P, F, W> {
        Measurement {
            loader: self.loader,
            preparer: self.preparer,
            fitter: self.fitter,
            writer: self.writer,
        }
    }
}

impl<L, P, F, W> From<Measurement<L, P, F, W>> for MeasurementBuilder<L, P, F, W> {
    fn from(m: Measurement<L, P, F, W>) -> Self {
        MeasurementBuilder {
            loader: m.loader,
            preparer: m.preparer,
            fitter: m.fitter,
            writer: m.writer,
        }
    }
}

/// Load histograms, prepare templates, fit, and write the results
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Measurement<L, P, F, W> {
    loader: L,
    preparer: P,
    fitter: F,
    writer: W,
}

impl<L, P, F, W> From<MeasurementBuilder<L, P, F, W>> for Measurement<L, P, F, W> {
    fn from(b: MeasurementBuilder<L, P, F, W>) -> Self {
        b.build()
    }
}

#[derive(Debug, Error)]
pub enum MeasurementError<E1, E2, E3, E4> {
    #[error("Failed to load histograms")]
    LoadErr(#[source] E1),
    #[error("Failed to prepare templates")]
    PrepareErr(#[source] E2),
    #[error("Fit failed")]
    FitErr(#[source] E3),
    #[error("Failed to write results")]
    WriteErr(#[source] E4),
}

impl<L, P, F, W> Measurement<L, P, F, W>
where
    L: Load,
    P: Prepare,
    F: Fit,
    W: Write,
{
    pub fn run(
        &mut self,
    ) -> Result<FitResults, MeasurementError<L::Error, P::Error, F::Error, W::Error>> {
        use MeasurementError::*;

        let set = self.loader.load().map_err(LoadErr)?;
        info!(
            "Loaded templates for {} processes in {} regions",
            set.templates.len(),
            set.data.len()
        );

        let set = self.preparer.prepare(set).map_err(PrepareErr)?;

        let results = self.fitter.fit(&set).map_err(FitErr)?;
        info!("Finished {} fits", results.fits.len());

        self.writer.write(&results).map_err(WriteErr)?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::tests::{fit_options, synthetic_set, FIT_VAR, TAU_ID};
    use crate::fit::{FitMode, TauIdEffFitterBuilder};
    use crate::templates::{HistogramSet, TemplatePreparer};
    use std::convert::Infallible;

    fn log_init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct Synthetic;

    impl Load for Synthetic {
        type Error = Infallible;

        fn load(&mut self) -> Result<HistogramSet, Self::Error> {
            Ok(synthetic_set())
        }
    }

    #[derive(Default)]
    struct Collect(Vec<f64>);

    impl Write for Collect {
        type Error = Infallible;

        fn write(&mut self, results: &FitResults) -> Result<(), Self::Error> {
            self.0.extend(results.fits.iter().map(|f| f.efficiency));
            Ok(())
        }
    }

    #[test]
    fn run() {
        log_init();
        let fitter = TauIdEffFitterBuilder::default()
            .tau_ids(vec![TAU_ID.to_owned()])
            .fit_variables(vec![FIT_VAR.to_owned()])
            .options(fit_options(FitMode::Abcd))
            .build()
            .unwrap();
        let mut measurement = MeasurementBuilder {
            loader: Synthetic,
            preparer: TemplatePreparer::default(),
            fitter,
            writer: Collect::default(),
        }
        .build();
        let res = measurement.run().unwrap();
        assert_eq!(res.fits.len(), 1);
        let builder = MeasurementBuilder::from(measurement);
        assert_eq!(builder.writer.0.len(), 1);
        assert!((builder.writer.0[0] - 0.6).abs() < 2e-3);
    }

    #[test]
    fn fit_error() {
        log_init();
        let fitter = TauIdEffFitterBuilder::default()
            .tau_ids(vec!["tauDiscrHPStight".to_owned()])
            .fit_variables(vec![FIT_VAR.to_owned()])
            .options(fit_options(FitMode::Abcd))
            .build()
            .unwrap();
        let mut measurement = MeasurementBuilder {
            loader: Synthetic,
            preparer: TemplatePreparer::default(),
            fitter,
            writer: Collect::default(),
        }
        .build();
        assert!(matches!(measurement.run(), Err(MeasurementError::FitErr(_))));
    }
}
