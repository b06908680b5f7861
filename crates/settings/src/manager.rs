//! Settings loading and validation
//!
//! Sources are layered in order: built-in defaults, an optional settings file
//! (format chosen by extension) and `IMAGE_RECOGNIZER__*` environment variables.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use thiserror::Error;
use tracing::{debug, info};

use common::{ModelIdentifier, ModelSource};

use crate::schema::{BackendKind, RecognitionSettings};

/// Environment variable prefix, e.g. `IMAGE_RECOGNIZER__MODEL__IDENTIFIER`
pub const ENV_PREFIX: &str = "IMAGE_RECOGNIZER";

/// Errors raised while loading or validating settings
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A source could not be read or deserialized
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is outside its allowed range
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Loads and validates recognition settings
pub struct SettingsManager;

impl SettingsManager {
    /// Loads settings from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<RecognitionSettings, SettingsError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading settings from {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: RecognitionSettings = builder.build()?.try_deserialize()?;
        Self::validate(&settings)?;

        debug!("Settings loaded: {:?}", settings);

        Ok(settings)
    }

    /// Parses settings from a TOML document without consulting the environment
    pub fn from_toml_str(document: &str) -> Result<RecognitionSettings, SettingsError> {
        let settings: RecognitionSettings = Config::builder()
            .add_source(File::from_str(document, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        Self::validate(&settings)?;

        Ok(settings)
    }

    /// Checks value ranges and cross-field requirements
    pub fn validate(settings: &RecognitionSettings) -> Result<(), SettingsError> {
        Self::model_identifier(settings)?;

        check_unit_interval("model.detection_threshold", settings.model.detection_threshold)?;
        check_unit_interval("model.local_confidence_floor", settings.model.local_confidence_floor)?;
        check_unit_interval("aggregation.hysteresis", settings.aggregation.hysteresis)?;
        check_unit_interval("aggregation.auto_stop_threshold", settings.aggregation.auto_stop_threshold)?;

        check_positive("aggregation.retention_window_secs", settings.aggregation.retention_window_secs)?;
        check_non_negative("cadence.min_push_interval_secs", settings.cadence.min_push_interval_secs)?;
        check_non_negative("cadence.frame_interval_secs", settings.cadence.frame_interval_secs)?;

        if let Some(digest) = &settings.fetch.expected_sha256 {
            let valid = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(SettingsError::Invalid {
                    key: "fetch.expected_sha256",
                    reason: "expected 64 hex characters".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Gets the validated model identifier
    pub fn model_identifier(settings: &RecognitionSettings) -> Result<ModelIdentifier, SettingsError> {
        ModelIdentifier::new(settings.model.identifier.clone()).map_err(|e| SettingsError::Invalid {
            key: "model.identifier",
            reason: e.to_string(),
        })
    }

    /// Derives the model source for the configured backend
    ///
    /// For the local backend a remote URL takes precedence over a bundled path,
    /// since a bundle is the fallback shipped with the application.
    pub fn model_source(settings: &RecognitionSettings) -> Result<ModelSource, SettingsError> {
        match settings.model.backend {
            BackendKind::RemoteLabeler => Ok(ModelSource::RemoteLabeler {
                confidence_threshold: settings.model.detection_threshold,
            }),
            BackendKind::Local => {
                if let Some(url) = &settings.model.remote_url {
                    Ok(ModelSource::Remote { url: url.clone() })
                } else if let Some(path) = &settings.model.bundled_path {
                    Ok(ModelSource::Bundled(path.clone()))
                } else {
                    Err(SettingsError::Invalid {
                        key: "model",
                        reason: "local backend needs `remote_url` or `bundled_path`".to_string(),
                    })
                }
            }
        }
    }
}

fn check_unit_interval(key: &'static str, value: f32) -> Result<(), SettingsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            key,
            reason: format!("{} is outside [0, 1]", value),
        })
    }
}

fn check_positive(key: &'static str, value: f64) -> Result<(), SettingsError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            key,
            reason: format!("{} must be positive", value),
        })
    }
}

fn check_non_negative(key: &'static str, value: f64) -> Result<(), SettingsError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            key,
            reason: format!("{} must not be negative", value),
        })
    }
}
