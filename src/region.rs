use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use strum::{Display, EnumString};
use thiserror::Error;

lazy_static! {
    static ref REGION_RE: Regex =
        Regex::new(r"^(?P<abcd>ABCD|[ABCD])(?P<kine>[12])?(?P<tauid>[pf])?(?P<suffix>_\w+|Wj)?$")
            .unwrap();
}

/// Region in the plane of di-tau charge and muon isolation
///
/// ```text
///   /-------\ /-------\
///   |   A   | |   B   |   loose muon isolation
///   \-------/ \-------/
///   /-------\ /-------\
///   |   C   | |   D   |   tight muon isolation
///   \-------/ \-------/
///       OS        SS
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quadrant {
    All,
    A,
    B,
    C,
    D,
}

/// Split by di-tau kinematics
///
/// `Signal` corresponds to `Mt < 40 GeV && Pzeta - 1.5 PzetaVis > -20 GeV`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kinematics {
    Signal,
    Background,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TauIdDecision {
    Passed,
    Failed,
}

/// An event region such as `C1p`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region {
    label: String,
    pub quadrant: Quadrant,
    pub kinematics: Option<Kinematics>,
    pub tau_id: Option<TauIdDecision>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("Undefined region: `{0}`")]
    Undefined(String),
}

/// Probability for a process to end up on the "regular" side of a region boundary
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString,
)]
pub enum Probability {
    /// Opposite-sign di-tau charge
    #[strum(serialize = "pDiTauCharge_OS_SS")]
    DiTauCharge,
    /// Tightly isolated muon
    #[strum(serialize = "pMuonIso_tight_loose")]
    MuonIso,
    /// Signal-like di-tau kinematics
    #[strum(serialize = "pDiTauKine_Sig_Bgr")]
    DiTauKine,
    /// Passed tau id. discriminator
    #[strum(serialize = "pTauId_passed_failed")]
    TauId,
}

/// One factor `p` (or `1 - p` if inverted) of the event yield in a region
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Factor {
    pub probability: Probability,
    pub inverted: bool,
}

impl Factor {
    fn new(probability: Probability, inverted: bool) -> Self {
        Self {
            probability,
            inverted,
        }
    }

    pub fn eval(&self, p: f64) -> f64 {
        if self.inverted {
            1. - p
        } else {
            p
        }
    }
}

/// Values of the region probabilities for one process
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RegionProbabilities {
    pub charge_os: f64,
    pub muon_iso_tight: f64,
    pub kine_signal: f64,
    pub tau_id_passed: f64,
}

impl RegionProbabilities {
    pub fn get(&self, probability: Probability) -> f64 {
        match probability {
            Probability::DiTauCharge => self.charge_os,
            Probability::MuonIso => self.muon_iso_tight,
            Probability::DiTauKine => self.kine_signal,
            Probability::TauId => self.tau_id_passed,
        }
    }
}

impl Region {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Factors relating the yield in this region to the yield in `ABCD`
    pub fn factors(&self) -> Vec<Factor> {
        use Probability::*;
        let mut res = match self.quadrant {
            Quadrant::All => vec![],
            Quadrant::A => vec![Factor::new(DiTauCharge, false), Factor::new(MuonIso, true)],
            Quadrant::B => vec![Factor::new(DiTauCharge, true), Factor::new(MuonIso, true)],
            Quadrant::C => vec![Factor::new(DiTauCharge, false), Factor::new(MuonIso, false)],
            Quadrant::D => vec![Factor::new(DiTauCharge, true), Factor::new(MuonIso, false)],
        };
        if let Some(kine) = self.kinematics {
            res.push(Factor::new(DiTauKine, kine == Kinematics::Background));
        }
        if let Some(tau_id) = self.tau_id {
            res.push(Factor::new(TauId, tau_id == TauIdDecision::Failed));
        }
        res
    }

    /// Fraction of all `ABCD` events of a process that fall into this region
    pub fn yield_fraction(&self, p: &RegionProbabilities) -> f64 {
        self.factors()
            .iter()
            .map(|f| f.eval(p.get(f.probability)))
            .product()
    }
}

impl FromStr for Region {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(captures) = REGION_RE.captures(s) else {
            return Err(RegionError::Undefined(s.to_owned()));
        };
        let quadrant = match &captures["abcd"] {
            "ABCD" => Quadrant::All,
            "A" => Quadrant::A,
            "B" => Quadrant::B,
            "C" => Quadrant::C,
            "D" => Quadrant::D,
            _ => unreachable!(),
        };
        let kinematics = captures.name("kine").map(|k| match k.as_str() {
            "1" => Kinematics::Signal,
            _ => Kinematics::Background,
        });
        let tau_id = captures.name("tauid").map(|t| match t.as_str() {
            "p" => TauIdDecision::Passed,
            _ => TauIdDecision::Failed,
        });
        Ok(Self {
            label: s.to_owned(),
            quadrant,
            kinematics,
            tau_id,
        })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.label.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const PROBS: RegionProbabilities = RegionProbabilities {
        charge_os: 0.8,
        muon_iso_tight: 0.6,
        kine_signal: 0.7,
        tau_id_passed: 0.4,
    };

    fn region(label: &str) -> Region {
        label.parse().unwrap()
    }

    #[test]
    fn parse() {
        let r = region("C1p");
        assert_eq!(r.quadrant, Quadrant::C);
        assert_eq!(r.kinematics, Some(Kinematics::Signal));
        assert_eq!(r.tau_id, Some(TauIdDecision::Passed));

        let r = region("ABCD");
        assert_eq!(r.quadrant, Quadrant::All);
        assert_eq!(r.kinematics, None);

        let r = region("B1_mW");
        assert_eq!(r.quadrant, Quadrant::B);
        assert_eq!(r.kinematics, Some(Kinematics::Signal));
        assert_eq!(r.label(), "B1_mW");

        assert!("E".parse::<Region>().is_err());
        assert!("C3".parse::<Region>().is_err());
        assert!("Cat".parse::<Region>().is_err());
        assert!("C1p_".parse::<Region>().is_err());
        assert_eq!(region("C1pWj").kinematics, Some(Kinematics::Signal));
        assert!("".parse::<Region>().is_err());
    }

    #[test]
    fn fractions() {
        assert_relative_eq!(region("ABCD").yield_fraction(&PROBS), 1.);
        assert_relative_eq!(region("A").yield_fraction(&PROBS), 0.8 * 0.4);
        assert_relative_eq!(region("D").yield_fraction(&PROBS), 0.2 * 0.6);
        assert_relative_eq!(region("C1p").yield_fraction(&PROBS), 0.8 * 0.6 * 0.7 * 0.4);
        assert_relative_eq!(region("C2f").yield_fraction(&PROBS), 0.8 * 0.6 * 0.3 * 0.6);

        let sum: f64 = ["A", "B", "C1p", "C1f", "C2p", "C2f", "D"]
            .iter()
            .map(|r| region(r).yield_fraction(&PROBS))
            .sum();
        assert_relative_eq!(sum, 1., epsilon = 1e-12);
    }

    #[test]
    fn factors() {
        let factors = region("C1f").factors();
        assert_eq!(factors.len(), 4);
        assert_eq!(factors[3].probability, Probability::TauId);
        assert!(factors[3].inverted);
        assert!(region("ABCD").factors().is_empty());
        assert_eq!(Probability::DiTauKine.to_string(), "pDiTauKine_Sig_Bgr");
        assert_eq!(
            "pTauId_passed_failed".parse::<Probability>().unwrap(),
            Probability::TauId
        );
    }
}
