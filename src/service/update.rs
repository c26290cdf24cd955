//! # Built-in `update` action.
//!
//! Parameters: `package`, `version`. Sets `packages[package] = version` in the record file,
//! then asks the supervisor for a restart so a fresh generation picks the new version up.
//! Any failure exits nonzero without requesting the restart.

use tracing::info;

use crate::error::ServiceError;
use crate::message::ControlMessage;
use crate::process::{ENV_RECORD, link::ParentSender};
use crate::record::RecordFile;

/// Parameters of one update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateParams {
    pub package: String,
    pub version: String,
}

impl UpdateParams {
    /// Reads the parameters from the action's environment.
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServiceError> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ServiceError::Param {
                    name: name.to_string(),
                    reason: "missing".to_string(),
                })
        };
        Ok(Self {
            package: required("package")?,
            version: required("version")?,
        })
    }
}

/// Record file named by the supervisor, `data.json` otherwise.
pub fn record_from_env() -> RecordFile {
    RecordFile::new(std::env::var_os(ENV_RECORD).unwrap_or_else(|| "data.json".into()))
}

/// Applies one update and requests a restart.
pub async fn run(
    params: &UpdateParams,
    record: &RecordFile,
    parent: &ParentSender,
) -> Result<(), ServiceError> {
    record.set_version(&params.package, &params.version).await?;
    info!(
        package = %params.package,
        version = %params.version,
        record = ?record.path(),
        "record updated"
    );
    parent.message(ControlMessage::restart()).await?;
    Ok(())
}
