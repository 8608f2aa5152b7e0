//! Fleet contract errors.

use fahmon_common::SettingsError;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("client '{0}' already exists")]
    DuplicateClient(String),

    #[error("client '{0}' not found")]
    ClientNotFound(String),

    #[error("cannot rename to '{0}': name already in use")]
    NameInUse(String),

    #[error(transparent)]
    InvalidSettings(#[from] SettingsError),
}
