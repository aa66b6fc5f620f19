//! Configuration loading via `ortho-config`.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::accessor::Scope;
use crate::tags::{EnvironTag, MachineTag, Tag};

/// Agent configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SILO")]
pub struct ProvisionerConfig {
    /// Environment identifier this agent serves.
    pub environ: String,
    /// Machine whose storage this agent manages. Unset for the
    /// environment-wide provisioner.
    pub machine: Option<String>,
    /// Directory managed filesystem mounts live under.
    #[ortho_config(default = "/var/lib/silo/storage".to_owned())]
    pub storage_dir: String,
}

impl ProvisionerConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI
    /// flags in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty or a tag
    /// does not parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environ.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("SILO_ENVIRON")));
        }
        if self.storage_dir.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("SILO_STORAGE_DIR")));
        }
        self.scope().map(|_| ())
    }

    /// Resolves the worker scope this agent was configured for.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTag`] when the environ or machine
    /// value does not parse.
    pub fn scope(&self) -> Result<Scope, ConfigError> {
        match &self.machine {
            Some(machine) => MachineTag::parse(machine)
                .map(Scope::Machine)
                .map_err(|err| ConfigError::InvalidTag(err.to_string())),
            None => EnvironTag::parse(&self.environ)
                .map(Scope::Environ)
                .map_err(|err| ConfigError::InvalidTag(err.to_string())),
        }
    }

    /// Returns the storage directory as a path.
    #[must_use]
    pub fn storage_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.storage_dir)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Indicates a scope tag that does not parse.
    #[error("invalid scope: {0}")]
    InvalidTag(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(environ: &str, machine: Option<&str>) -> ProvisionerConfig {
        ProvisionerConfig {
            environ: environ.to_owned(),
            machine: machine.map(str::to_owned),
            storage_dir: String::from("/var/lib/silo/storage"),
        }
    }

    #[rstest]
    fn validates_a_machine_scoped_agent() {
        let config = config("environment-uuid", Some("0/lxc/1"));
        config.validate().expect("config should validate");
        assert_eq!(
            config.scope().expect("scope should resolve"),
            Scope::Machine(MachineTag::parse("0/lxc/1").expect("machine tag"))
        );
    }

    #[rstest]
    fn defaults_to_the_environment_scope() {
        let config = config("environment-uuid", None);
        assert_eq!(
            config.scope().expect("scope should resolve"),
            Scope::Environ(EnvironTag::parse("environment-uuid").expect("environ tag"))
        );
    }

    #[rstest]
    #[case("", None)]
    #[case("environment-uuid", Some("not-a-machine"))]
    fn rejects_invalid_configurations(#[case] environ: &str, #[case] machine: Option<&str>) {
        assert!(config(environ, machine).validate().is_err());
    }
}
