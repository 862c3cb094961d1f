//! Global threat level derived from the ledger.

use crate::logger::Severity;
use crate::monitor::config::ThreatBands;
use crate::monitor::ledger::Ledger;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    Nominal,
    Low,
    Caution,
    Elevated,
    Critical,
}

impl ThreatLevel {
    pub fn from_risk(risk: f32, bands: &ThreatBands) -> Self {
        if risk < bands.nominal {
            ThreatLevel::Nominal
        } else if risk < bands.low {
            ThreatLevel::Low
        } else if risk < bands.caution {
            ThreatLevel::Caution
        } else if risk < bands.elevated {
            ThreatLevel::Elevated
        } else {
            ThreatLevel::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreatLevel::Nominal  => "NOMINAL",
            ThreatLevel::Low      => "LOW",
            ThreatLevel::Caution  => "CAUTION",
            ThreatLevel::Elevated => "ELEVATED",
            ThreatLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest per-device risk, or 0 for an empty ledger.
pub fn global_risk(ledger: &Ledger) -> f32 {
    ledger.risks().into_iter().fold(0.0, f32::max)
}

/// Colour band for a single device's risk.
pub fn device_tag(risk: f32) -> Severity {
    if risk < 0.25 {
        Severity::Safe
    } else if risk < 0.75 {
        Severity::Warning
    } else {
        Severity::Danger
    }
}

/// Colour band for one recorded activity label.
pub fn activity_tag(activity: &str) -> Severity {
    if activity.contains("Unsecured") || activity.contains("CRITICAL") {
        Severity::Danger
    } else if activity.contains("Browsing") || activity.contains("Domain") {
        Severity::Warning
    } else if activity.contains("Identity") || activity.contains("Broadcasting") {
        Severity::Safe
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ledger_is_zero() {
        assert_eq!(global_risk(&Ledger::new()), 0.0);
    }

    #[test]
    fn global_is_max_of_devices() {
        let ledger = Ledger::new();
        ledger.record("a", "x", 0.2, None);
        ledger.record("b", "x", 0.05, None);
        assert!((global_risk(&ledger) - 0.2).abs() < 1e-6);

        ledger.record("c", "x", 0.6, None);
        assert!((global_risk(&ledger) - 0.6).abs() < 1e-6);

        ledger.clear();
        assert_eq!(global_risk(&ledger), 0.0);
    }

    #[test]
    fn bands_match_thresholds() {
        let b = ThreatBands::default();
        assert_eq!(ThreatLevel::from_risk(0.0, &b), ThreatLevel::Nominal);
        assert_eq!(ThreatLevel::from_risk(0.1, &b), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_risk(0.5, &b), ThreatLevel::Caution);
        assert_eq!(ThreatLevel::from_risk(0.85, &b), ThreatLevel::Elevated);
        assert_eq!(ThreatLevel::from_risk(1.0, &b), ThreatLevel::Critical);
    }

    #[test]
    fn tags_follow_content() {
        assert_eq!(device_tag(0.1), Severity::Safe);
        assert_eq!(device_tag(0.5), Severity::Warning);
        assert_eq!(device_tag(0.8), Severity::Danger);
        assert_eq!(activity_tag("Unsecured Traffic: x"), Severity::Danger);
        assert_eq!(activity_tag("Browsing a.com"), Severity::Warning);
        assert_eq!(activity_tag("mDNS Identity Leak"), Severity::Safe);
        assert_eq!(activity_tag("something"), Severity::Info);
    }
}
