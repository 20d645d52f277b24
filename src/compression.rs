use std::fmt::{self, Display};
use std::io::Write;
use std::str::FromStr;

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

const GZIP_DEFAULT_LEVEL: u8 = 6;
const LZ4_DEFAULT_LEVEL: u8 = 0;
const ZSTD_DEFAULT_LEVEL: u8 = 0;

lazy_static! {
    static ref COMPRESSION_RE: Regex =
        Regex::new(r"^(?P<algo>[[:alnum:]]+)(_(?P<lvl>\d+))?$").unwrap();
}

/// Compression of the output file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compression {
    Bzip2,
    /// gzip with compression level
    Gzip(u8),
    /// lz4 with compression level
    Lz4(u8),
    /// zstd with compression level
    Zstd(u8),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseCompressionErr {
    #[error("Unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("Level {1} not supported for {0} compression")]
    UnsupportedLevel(String, String),
}

impl FromStr for Compression {
    type Err = ParseCompressionErr;

    /// Parse `algorithm[_level]`, e.g. `bzip2`, `gzip_9`, or `zstd_19`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Compression::*;
        use ParseCompressionErr::*;

        let lower_case = s.to_ascii_lowercase();
        let Some(captures) = COMPRESSION_RE.captures(&lower_case) else {
            return Err(UnknownAlgorithm(s.to_owned()));
        };
        let algo = &captures["algo"];
        let lvl = captures.name("lvl").map(|l| l.as_str());
        let parse_lvl = |max: u8, default: u8| -> Result<u8, ParseCompressionErr> {
            let Some(lvl) = lvl else {
                return Ok(default);
            };
            match lvl.parse::<u8>() {
                Ok(l) if l <= max => Ok(l),
                _ => Err(UnsupportedLevel(algo.to_owned(), lvl.to_owned())),
            }
        };
        match algo {
            "bzip2" | "bz2" => match lvl {
                Some(lvl) => Err(UnsupportedLevel(algo.to_owned(), lvl.to_owned())),
                None => Ok(Bzip2),
            },
            "gzip" | "gz" => Ok(Gzip(parse_lvl(9, GZIP_DEFAULT_LEVEL)?)),
            "lz4" => Ok(Lz4(parse_lvl(16, LZ4_DEFAULT_LEVEL)?)),
            "zstd" | "zstandard" => Ok(Zstd(parse_lvl(19, ZSTD_DEFAULT_LEVEL)?)),
            _ => Err(UnknownAlgorithm(s.to_owned())),
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Bzip2 => write!(f, "bzip2"),
            Compression::Gzip(lvl) => write!(f, "gzip_{lvl}"),
            Compression::Lz4(lvl) => write!(f, "lz4_{lvl}"),
            Compression::Zstd(lvl) => write!(f, "zstd_{lvl}"),
        }
    }
}

/// Convert into a writer that compresses to the given format
pub fn compress_writer<'a, W: 'a + Write>(
    writer: W,
    compression: Option<Compression>,
) -> Result<Box<dyn Write + 'a>, std::io::Error> {
    match compression {
        Some(Compression::Bzip2) => {
            let encoder = BzEncoder::new(writer, bzip2::Compression::best());
            Ok(Box::new(encoder))
        }
        Some(Compression::Gzip(lvl)) => {
            let encoder = GzEncoder::new(writer, flate2::Compression::new(lvl.into()));
            Ok(Box::new(encoder))
        }
        Some(Compression::Lz4(lvl)) => {
            let encoder = lz4::EncoderBuilder::new()
                .auto_flush(true)
                .level(lvl.into())
                .build(writer)?;
            Ok(Box::new(encoder))
        }
        Some(Compression::Zstd(lvl)) => {
            let encoder = zstd::Encoder::new(writer, lvl.into())?;
            Ok(Box::new(encoder.auto_finish()))
        }
        None => Ok(Box::new(writer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!("bzip2".parse(), Ok(Compression::Bzip2));
        assert_eq!("GZ".parse(), Ok(Compression::Gzip(6)));
        assert_eq!("gzip_9".parse(), Ok(Compression::Gzip(9)));
        assert_eq!("zstd_19".parse(), Ok(Compression::Zstd(19)));
        assert_eq!("lz4".parse(), Ok(Compression::Lz4(0)));
        assert!(matches!(
            "gzip_10".parse::<Compression>(),
            Err(ParseCompressionErr::UnsupportedLevel(..))
        ));
        assert!(matches!(
            "bzip2_3".parse::<Compression>(),
            Err(ParseCompressionErr::UnsupportedLevel(..))
        ));
        assert!(matches!(
            "xz".parse::<Compression>(),
            Err(ParseCompressionErr::UnknownAlgorithm(_))
        ));
        assert_eq!(Compression::Zstd(3).to_string(), "zstd_3");
    }
}
