use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentNextRequest {
    pub device_type: String,
    pub artifact_name: String,
    #[serde(rename = "rootfs-image.checksum", skip_serializing_if = "String::is_empty")]
    pub rootfs_checksum: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeploymentInstructions {
    pub id: String,
    pub artifact: Option<ArtifactInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactInfo {
    #[serde(rename = "artifact_name", alias = "name")]
    pub name: Option<String>,
    pub source: Option<ArtifactSource>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactSource {
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPhase {
    Downloading,
    Installing,
    Rebooting,
    Success,
    Failure,
}

impl DeploymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentPhase::Downloading => "downloading",
            DeploymentPhase::Installing => "installing",
            DeploymentPhase::Rebooting => "rebooting",
            DeploymentPhase::Success => "success",
            DeploymentPhase::Failure => "failure",
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentPhase::Success | DeploymentPhase::Failure)
    }

    /// What a real device would be running while in this phase.
    pub fn substate(&self) -> Option<&'static str> {
        match self {
            DeploymentPhase::Downloading => Some("running predownload script"),
            DeploymentPhase::Installing => Some("running preinstalling script"),
            DeploymentPhase::Rebooting => Some("running prerebooting script"),
            _ => None,
        }
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: DeploymentPhase,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub substate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentLog {
    pub messages: Vec<LogMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_a_deployment_with_artifact() -> Result<(), serde_json::Error> {
        let json = include_str!("../../../tests/resources/deployment_next_response.json");

        let result = serde_json::from_str::<DeploymentInstructions>(json)?;

        assert_eq!(
            result,
            DeploymentInstructions {
                id: "w81s4fae-7dec-11d0-a765-00a0c91e6bf6".to_string(),
                artifact: Some(ArtifactInfo {
                    name: Some("release-2".to_string()),
                    source: Some(ArtifactSource {
                        uri: "https://artifacts.example.com/release-2.mender".to_string(),
                    }),
                }),
            }
        );
        Ok(())
    }

    #[test]
    fn deserializes_the_short_artifact_name_field() -> Result<(), serde_json::Error> {
        let result = serde_json::from_str::<DeploymentInstructions>(r#"{"id": "42", "artifact": {"name": "v2"}}"#)?;

        assert_eq!(result.artifact.and_then(|artifact| artifact.name), Some("v2".to_string()));
        Ok(())
    }

    #[test]
    fn deserializes_a_deployment_without_artifact() -> Result<(), serde_json::Error> {
        let result = serde_json::from_str::<DeploymentInstructions>(r#"{"id": "42"}"#)?;

        assert_eq!(result.artifact, None);
        Ok(())
    }

    #[test]
    fn omits_an_empty_checksum() -> Result<(), serde_json::Error> {
        let request = DeploymentNextRequest {
            device_type: "qemux86-64".to_string(),
            artifact_name: "v1".to_string(),
            rootfs_checksum: String::new(),
        };

        assert_eq!(serde_json::to_string(&request)?, r#"{"device_type":"qemux86-64","artifact_name":"v1"}"#);
        Ok(())
    }

    #[test]
    fn status_reports_carry_the_substate_only_when_set() -> Result<(), serde_json::Error> {
        let plain = StatusReport {
            status: DeploymentPhase::Installing,
            substate: None,
        };
        let detailed = StatusReport {
            status: DeploymentPhase::Installing,
            substate: DeploymentPhase::Installing.substate().map(str::to_string),
        };

        assert_eq!(serde_json::to_string(&plain)?, r#"{"status":"installing"}"#);
        assert_eq!(serde_json::to_string(&detailed)?, r#"{"status":"installing","substate":"running preinstalling script"}"#);
        Ok(())
    }
}
