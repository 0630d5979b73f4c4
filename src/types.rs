use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

use crate::solver::selection::SelectionOptions;

/// Which selector outputs are applied before the final solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoMode {
    /// Use the configured `(M, τ)` as given.
    #[default]
    Off,
    /// Run the selector and log its recommendation without applying it.
    Recommend,
    /// Apply the selected control-point count.
    ControlPoints,
    /// Apply the selected regularization strength.
    Tau,
    /// Apply both.
    Both,
}

impl AutoMode {
    pub fn runs_selector(self) -> bool {
        self != AutoMode::Off
    }

    pub fn applies_control_points(self) -> bool {
        matches!(self, AutoMode::ControlPoints | AutoMode::Both)
    }

    pub fn applies_tau(self) -> bool {
        matches!(self, AutoMode::Tau | AutoMode::Both)
    }
}

impl TryFrom<u8> for AutoMode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(AutoMode::Off),
            1 => Ok(AutoMode::Recommend),
            2 => Ok(AutoMode::ControlPoints),
            3 => Ok(AutoMode::Tau),
            4 => Ok(AutoMode::Both),
            other => Err(other),
        }
    }
}

impl From<AutoMode> for u8 {
    fn from(mode: AutoMode) -> Self {
        match mode {
            AutoMode::Off => 0,
            AutoMode::Recommend => 1,
            AutoMode::ControlPoints => 2,
            AutoMode::Tau => 3,
            AutoMode::Both => 4,
        }
    }
}

/// How much the solver reports through the `log` facade.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Quiet,
    #[default]
    Summary,
    /// Also runs the eigenbasis cross-check and logs per-mode vectors.
    Diagnostics,
}

impl Verbosity {
    /// Maps a numeric level: 0 is quiet, 1 summary, anything higher diagnostics.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verbosity::Quiet,
            1 => Verbosity::Summary,
            _ => Verbosity::Diagnostics,
        }
    }

    pub fn summary(self) -> bool {
        self >= Verbosity::Summary
    }

    pub fn diagnostics(self) -> bool {
        self >= Verbosity::Diagnostics
    }
}

pub fn default_tau() -> f64 {
    1e-5
}

/// User-facing unfolding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnfoldConfig {
    /// Regularization strength used unless the selector overrides it.
    pub tau: f64,
    /// Control-point count; `0` uses the number of truth bins.
    pub control_points: usize,
    pub auto_mode: AutoMode,
    pub verbosity: Verbosity,
    pub selection: SelectionOptions,
}

impl Default for UnfoldConfig {
    fn default() -> Self {
        Self {
            tau: default_tau(),
            control_points: 0,
            auto_mode: AutoMode::Off,
            verbosity: Verbosity::Summary,
            selection: SelectionOptions::default(),
        }
    }
}

#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct ControlPointValues(pub Array1<f64>);

impl ControlPointValues {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }
}

impl Deref for ControlPointValues {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ControlPointValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for ControlPointValues {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<ControlPointValues> for Array1<f64> {
    fn from(values: ControlPointValues) -> Self {
        values.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_numeric_codes_round_trip() {
        for code in 0u8..=4 {
            let mode = AutoMode::try_from(code).expect("codes 0..=4 are valid");
            assert_eq!(u8::from(mode), code);
        }
        assert_eq!(AutoMode::try_from(5), Err(5));
    }

    #[test]
    fn auto_mode_flags() {
        assert!(!AutoMode::Off.runs_selector());
        assert!(AutoMode::Recommend.runs_selector());
        assert!(!AutoMode::Recommend.applies_tau());
        assert!(!AutoMode::Recommend.applies_control_points());
        assert!(AutoMode::ControlPoints.applies_control_points());
        assert!(!AutoMode::ControlPoints.applies_tau());
        assert!(AutoMode::Tau.applies_tau());
        assert!(AutoMode::Both.applies_tau() && AutoMode::Both.applies_control_points());
    }

    #[test]
    fn verbosity_levels_are_ordered() {
        assert_eq!(Verbosity::from_level(0), Verbosity::Quiet);
        assert_eq!(Verbosity::from_level(1), Verbosity::Summary);
        assert_eq!(Verbosity::from_level(7), Verbosity::Diagnostics);
        assert!(Verbosity::Diagnostics.summary());
        assert!(!Verbosity::Summary.diagnostics());
        assert!(!Verbosity::Quiet.summary());
    }

    #[test]
    fn default_config_uses_truth_binning() {
        let config = UnfoldConfig::default();
        assert_eq!(config.control_points, 0);
        assert_eq!(config.auto_mode, AutoMode::Off);
        assert_eq!(config.tau, default_tau());
    }
}
