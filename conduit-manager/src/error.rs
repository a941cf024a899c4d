use serde::Serialize;
use std::fmt;

/// Codes carried by published error and notification events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoticeCode {
    DefineProvider,
    ProviderError,
    ProviderNotification,
    InvalidProvider,
    MissingConnector,
    ProvideNotPossible,
    NameTrimmed,
    SaveFailed,
    LoadFailed,
    CommandFailed,
}

impl NoticeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeCode::DefineProvider => "DEFINE_PROVIDER",
            NoticeCode::ProviderError => "PROVIDER_ERROR",
            NoticeCode::ProviderNotification => "PROVIDER_NOTIFICATION",
            NoticeCode::InvalidProvider => "INVALID_PROVIDER",
            NoticeCode::MissingConnector => "MISSING_CONNECTOR",
            NoticeCode::ProvideNotPossible => "PROVIDE_NOT_POSSIBLE",
            NoticeCode::NameTrimmed => "NAME_TRIMMED",
            NoticeCode::SaveFailed => "SAVE_FAILED",
            NoticeCode::LoadFailed => "LOAD_FAILED",
            NoticeCode::CommandFailed => "COMMAND_FAILED",
        }
    }
}

impl fmt::Display for NoticeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures local to one provider, configuration or stream.
///
/// None of these abort a batch operation; they are reported through the
/// lifecycle publisher while siblings proceed.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerError {
    /// A provider plugin could not be instantiated.
    ProviderLoad { provider_id: String, cause: String },
    /// The configuration references a provider that is not loaded.
    InvalidProvider { config_id: String, provider_id: String },
    /// The stream references a connector that is not indexed.
    MissingConnector {
        config_id: String,
        connector_id: Option<String>,
    },
    /// The configuration kind has no deep view (providers).
    Unresolvable { config_id: String },
    /// The provider could not create or connect the instance.
    Provide { stream_id: String, cause: String },
    /// Storage rejected or failed a save.
    ConfigSave(String),
}

impl ManagerError {
    pub fn code(&self) -> NoticeCode {
        match self {
            ManagerError::ProviderLoad { .. } => NoticeCode::DefineProvider,
            ManagerError::InvalidProvider { .. } => NoticeCode::InvalidProvider,
            ManagerError::MissingConnector { .. } => NoticeCode::MissingConnector,
            ManagerError::Unresolvable { .. } => NoticeCode::LoadFailed,
            ManagerError::Provide { .. } => NoticeCode::ProvideNotPossible,
            ManagerError::ConfigSave(_) => NoticeCode::SaveFailed,
        }
    }
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::ProviderLoad { provider_id, cause } => {
                write!(f, "failed to define provider '{}': {}", provider_id, cause)
            }
            ManagerError::InvalidProvider {
                config_id,
                provider_id,
            } => write!(
                f,
                "configuration '{}' references unknown provider '{}'",
                config_id, provider_id
            ),
            ManagerError::MissingConnector {
                config_id,
                connector_id: Some(connector_id),
            } => write!(
                f,
                "configuration '{}' references unknown connector '{}'",
                config_id, connector_id
            ),
            ManagerError::MissingConnector {
                config_id,
                connector_id: None,
            } => write!(f, "configuration '{}' has no connector reference", config_id),
            ManagerError::Unresolvable { config_id } => {
                write!(f, "configuration '{}' cannot be resolved to a stream", config_id)
            }
            ManagerError::Provide { stream_id, cause } => {
                write!(f, "provide not possible for '{}': {}", stream_id, cause)
            }
            ManagerError::ConfigSave(message) => write!(f, "save failed: {}", message),
        }
    }
}

impl std::error::Error for ManagerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(NoticeCode::ProvideNotPossible).unwrap(),
            "PROVIDE_NOT_POSSIBLE"
        );
        assert_eq!(NoticeCode::NameTrimmed.as_str(), "NAME_TRIMMED");
    }

    #[test]
    fn test_error_codes_and_messages() {
        let err = ManagerError::InvalidProvider {
            config_id: "c1".to_string(),
            provider_id: "mqtt".to_string(),
        };
        assert_eq!(err.code(), NoticeCode::InvalidProvider);
        assert!(err.to_string().contains("mqtt"));

        let err = ManagerError::ProviderLoad {
            provider_id: "kafka".to_string(),
            cause: "unknown provider".to_string(),
        };
        assert_eq!(err.code().as_str(), "DEFINE_PROVIDER");
    }
}
