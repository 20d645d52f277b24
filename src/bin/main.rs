mod opt;

use crate::opt::Opt;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{debug, info};
use tau_id_eff::prelude::*;
use tau_id_eff::{GIT_BRANCH, GIT_REV, VERSION};

fn main() -> Result<()> {
    let args = argfile::expand_args_from(
        std::env::args_os(),
        argfile::parse_fromfile,
        argfile::PREFIX,
    )
    .with_context(|| "Failed to read argument file")?;
    let opt = Opt::parse_from(args);

    let env = Env::default().filter_or("TAU_ID_EFF_LOG", &opt.loglevel);
    env_logger::init_from_env(env);

    rayon::ThreadPoolBuilder::new()
        .num_threads(opt.threads)
        .build_global()?;

    if let (Some(rev), Some(branch)) = (GIT_REV, GIT_BRANCH) {
        info!("fit-tau-id-eff {VERSION} rev {rev} ({branch})");
    } else {
        info!("fit-tau-id-eff {VERSION}");
    }

    debug!("settings: {:#?}", opt);

    let mut config = Config::from_file(&opt.config)?;
    if let Some(outfile) = opt.outfile {
        config.output_file = outfile;
    }
    let config = config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", opt.config))?;
    debug!("configuration: {:#?}", config);

    let mut measurement = MeasurementBuilder {
        loader: config.histogram_reader()?,
        preparer: config.template_preparer(),
        fitter: config.fitter()?,
        writer: config.writer(opt.compression)?,
    }
    .build();
    measurement.run()?;

    info!("done");
    Ok(())
}
