use std::path::PathBuf;

use clap::Parser;
use tau_id_eff::compression::Compression;

fn parse_compr(s: &str) -> Result<Compression, String> {
    s.parse().map_err(|err| format!("{err}"))
}

#[derive(Debug, Parser)]
#[clap(about, author, version)]
pub(crate) struct Opt {
    /// Output file
    #[clap(
        long,
        short,
        value_parser,
        help = "Output file.\n\nOverrides the `output_file` entry of the configuration."
    )]
    pub(crate) outfile: Option<PathBuf>,

    #[clap(
        long,
        value_parser = parse_compr,
        help = "Compress the output file.
Possible settings are 'bzip2', 'gzip', 'zstd', 'lz4'.
Compression levels can be set with algorithm_level e.g. 'zstd_5'.
Maximum levels are 'gzip_9', 'zstd_19', 'lz4_16'."
    )]
    pub(crate) compression: Option<Compression>,

    /// Verbosity level
    #[clap(
        short,
        long,
        default_value = "Info",
        help = "Verbosity level.
Possible values with increasing amount of output are
'off', 'error', 'warn', 'info', 'debug', 'trace'.\n"
    )]
    pub(crate) loglevel: String,

    /// Number of threads
    ///
    /// If set to 0, a default number of threads is chosen.
    /// The default can be set with the `RAYON_NUM_THREADS` environment
    /// variable.
    #[clap(short, long, default_value_t)]
    pub(crate) threads: usize,

    /// Configuration file
    #[clap(name = "CONFIG", value_parser)]
    pub(crate) config: PathBuf,
}
