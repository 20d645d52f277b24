use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

/// Name of the unshifted systematic variation
pub const CENTRAL_VALUE: &str = "CENTRAL_VALUE";

/// Which events enter a histogram, depending on the tau id. decision
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, StrumDisplay, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Selection {
    #[default]
    All,
    Passed,
    Failed,
}

/// Key identifying a histogram within a region
///
/// The string form is `{observable}_{tauId}`, followed by `_passed` or
/// `_failed` if the histogram only contains events passing or failing
/// the tau id. discriminator, and by `_{sysShift}` for systematically
/// shifted histograms.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistogramKey {
    pub observable: String,
    pub tau_id: String,
    pub selection: Selection,
    pub sys_shift: Option<String>,
}

impl HistogramKey {
    pub fn new(observable: &str, tau_id: &str, selection: Selection) -> Self {
        Self {
            observable: observable.to_owned(),
            tau_id: tau_id.to_owned(),
            selection,
            sys_shift: None,
        }
    }

    /// Same key for the given systematic shift
    ///
    /// [CENTRAL_VALUE] refers to the unshifted histogram.
    pub fn shifted(&self, sys_shift: &str) -> Self {
        let sys_shift = if sys_shift == CENTRAL_VALUE {
            None
        } else {
            Some(sys_shift.to_owned())
        };
        Self {
            sys_shift,
            ..self.clone()
        }
    }
}

impl Display for HistogramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.observable, self.tau_id)?;
        if self.selection != Selection::All {
            write!(f, "_{}", self.selection)?;
        }
        if let Some(shift) = &self.sys_shift {
            write!(f, "_{shift}")?;
        }
        Ok(())
    }
}

/// A source of systematic uncertainty
///
/// Each uncertainty comes with histograms shifted up and down by one
/// standard deviation. Half their difference is stored as `{name}Diff`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SysUncertainty {
    pub name: String,
}

impl SysUncertainty {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn up(&self) -> String {
        format!("{}Up", self.name)
    }

    pub fn down(&self) -> String {
        format!("{}Down", self.name)
    }

    pub fn diff(&self) -> String {
        format!("{}Diff", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format() {
        let key = HistogramKey::new("diTauVisMass", "tauDiscrHPSloose", Selection::Passed);
        assert_eq!(key.to_string(), "diTauVisMass_tauDiscrHPSloose_passed");
        let key = HistogramKey::new("diTauMt", "tauDiscrHPSloose", Selection::All);
        assert_eq!(key.to_string(), "diTauMt_tauDiscrHPSloose");
        assert_eq!(
            key.shifted("SysJetEnUp").to_string(),
            "diTauMt_tauDiscrHPSloose_SysJetEnUp"
        );
        assert_eq!(key.shifted(CENTRAL_VALUE), key);
    }
}
