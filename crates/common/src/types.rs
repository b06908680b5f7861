//! Common types for Image Recognizer
//!
//! This module defines small value types used throughout the recognition workspace.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Display bucket for a confidence value
///
/// Mirrors the colour scale result cells are rendered with: one band per
/// tenth between 0.2 and 0.9, with open-ended bands at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// Below 0.2
    Negligible,
    /// 0.2 up to 0.3
    VeryLow,
    /// 0.3 up to 0.4
    Low,
    /// 0.4 up to 0.5
    Weak,
    /// 0.5 up to 0.6
    Moderate,
    /// 0.6 up to 0.7
    Fair,
    /// 0.7 up to 0.8
    Good,
    /// 0.8 up to 0.9
    High,
    /// 0.9 and above
    VeryHigh,
}

impl ConfidenceBand {
    /// Buckets a confidence value
    pub fn from_confidence(confidence: f32) -> Self {
        match confidence {
            c if c >= 0.9 => ConfidenceBand::VeryHigh,
            c if c >= 0.8 => ConfidenceBand::High,
            c if c >= 0.7 => ConfidenceBand::Good,
            c if c >= 0.6 => ConfidenceBand::Fair,
            c if c >= 0.5 => ConfidenceBand::Moderate,
            c if c >= 0.4 => ConfidenceBand::Weak,
            c if c >= 0.3 => ConfidenceBand::Low,
            c if c >= 0.2 => ConfidenceBand::VeryLow,
            _ => ConfidenceBand::Negligible,
        }
    }
}

impl fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfidenceBand::Negligible => "negligible",
            ConfidenceBand::VeryLow => "very low",
            ConfidenceBand::Low => "low",
            ConfidenceBand::Weak => "weak",
            ConfidenceBand::Moderate => "moderate",
            ConfidenceBand::Fair => "fair",
            ConfidenceBand::Good => "good",
            ConfidenceBand::High => "high",
            ConfidenceBand::VeryHigh => "very high",
        };
        f.write_str(name)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}
