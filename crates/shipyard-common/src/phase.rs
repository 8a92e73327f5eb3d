//! Workflow phases and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One state of a task's workflow, in workflow order.
///
/// The derived `Ord` follows declaration order and is what "phase order"
/// means everywhere else (history monotonicity, loop-back detection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    WorkspaceCheck,
    EnvProbe,
    Analyzing,
    Confirmed,
    Developing,
    Testing,
    Submitted,
    EnvVerified,
    Released,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::WorkspaceCheck,
        Phase::EnvProbe,
        Phase::Analyzing,
        Phase::Confirmed,
        Phase::Developing,
        Phase::Testing,
        Phase::Submitted,
        Phase::EnvVerified,
        Phase::Released,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::WorkspaceCheck => "workspace-check",
            Phase::EnvProbe => "env-probe",
            Phase::Analyzing => "analyzing",
            Phase::Confirmed => "confirmed",
            Phase::Developing => "developing",
            Phase::Testing => "testing",
            Phase::Submitted => "submitted",
            Phase::EnvVerified => "env-verified",
            Phase::Released => "released",
        }
    }

    /// Phases reachable from `self` in one step.
    ///
    /// `Released` is reachable from every non-terminal phase because release
    /// doubles as cancellation.
    pub fn successors(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            WorkspaceCheck => &[EnvProbe, Analyzing, Released],
            EnvProbe => &[EnvProbe, Analyzing, Released],
            Analyzing => &[Analyzing, Confirmed, Released],
            Confirmed => &[Developing, Released],
            Developing => &[Developing, Testing, Released],
            Testing => &[Testing, Submitted, Released],
            Submitted => &[EnvVerified, Developing, Released],
            EnvVerified => &[EnvVerified, Developing, Released],
            Released => &[],
        }
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        self.successors().contains(&next)
    }

    /// A transition that moves backwards in phase order starts a new round.
    pub fn is_loop_back(&self, next: Phase) -> bool {
        next < *self && self.can_transition_to(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Released)
    }

    /// Phases during which a feature plan may exist.
    pub fn in_feature_loop(&self) -> bool {
        matches!(
            self,
            Phase::Analyzing
                | Phase::Confirmed
                | Phase::Developing
                | Phase::Testing
                | Phase::Submitted
                | Phase::EnvVerified
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown phase '{0}'")]
pub struct PhaseParseError(pub String);

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s.to_lowercase())
            .ok_or_else(|| PhaseParseError(s.to_string()))
    }
}

/// Task classification produced by the analysis phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Auto-advances past confirmation.
    Trivial,
    /// Needs an explicit confirmation signal.
    Standard,
    /// Handed to the feature plan loop.
    Complex,
}

impl Complexity {
    pub fn needs_confirmation(&self) -> bool {
        !matches!(self, Complexity::Trivial)
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Trivial => write!(f, "trivial"),
            Complexity::Standard => write!(f, "standard"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

impl FromStr for Complexity {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trivial" => Ok(Complexity::Trivial),
            "standard" => Ok(Complexity::Standard),
            "complex" => Ok(Complexity::Complex),
            other => Err(PhaseParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_matches_workflow() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
        assert!(Phase::WorkspaceCheck < Phase::Analyzing);
        assert!(Phase::Submitted < Phase::EnvVerified);
    }

    #[test]
    fn env_probe_is_optional() {
        assert!(Phase::WorkspaceCheck.can_transition_to(Phase::EnvProbe));
        assert!(Phase::WorkspaceCheck.can_transition_to(Phase::Analyzing));
        assert!(!Phase::WorkspaceCheck.can_transition_to(Phase::Developing));
    }

    #[test]
    fn release_reachable_from_every_live_phase() {
        for phase in Phase::ALL.iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_transition_to(Phase::Released), "{phase}");
        }
        assert!(Phase::Released.successors().is_empty());
    }

    #[test]
    fn loop_backs_only_return_to_developing() {
        for from in Phase::ALL {
            for to in Phase::ALL {
                if from.is_loop_back(to) {
                    assert_eq!(to, Phase::Developing, "{from} -> {to}");
                }
            }
        }
        assert!(Phase::Submitted.is_loop_back(Phase::Developing));
        assert!(Phase::EnvVerified.is_loop_back(Phase::Developing));
        assert!(!Phase::Testing.is_loop_back(Phase::Developing));
    }

    #[test]
    fn phase_serializes_kebab_case() {
        let json = serde_json::to_string(&Phase::WorkspaceCheck).unwrap();
        assert_eq!(json, "\"workspace-check\"");
        let parsed: Phase = serde_json::from_str("\"env-verified\"").unwrap();
        assert_eq!(parsed, Phase::EnvVerified);
        assert_eq!("Testing".parse::<Phase>().unwrap(), Phase::Testing);
        assert!("bogus".parse::<Phase>().is_err());
    }

    #[test]
    fn complexity_confirmation_rules() {
        assert!(!Complexity::Trivial.needs_confirmation());
        assert!(Complexity::Standard.needs_confirmation());
        assert!(Complexity::Complex.needs_confirmation());
        assert_eq!(" Complex ".parse::<Complexity>().unwrap(), Complexity::Complex);
    }
}
