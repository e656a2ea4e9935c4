use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::digest::DescriptorDigest;
use crate::image::HistoryEntry;

/// The container configuration blob, shared by the Docker and OCI formats.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfigurationTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: ConfigurationObjectTemplate,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub rootfs: RootFilesystemObjectTemplate,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationObjectTemplate {
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, Value>>,
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFilesystemObjectTemplate {
    #[serde(rename = "type")]
    pub type_field: String,
    #[serde(rename = "diff_ids", default)]
    pub diff_ids: Vec<DescriptorDigest>,
}

impl Default for RootFilesystemObjectTemplate {
    fn default() -> Self {
        RootFilesystemObjectTemplate {
            type_field: "layers".to_string(),
            diff_ids: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_docker_field_names() {
        let mut template = ContainerConfigurationTemplate {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            ..Default::default()
        };
        template.config.env = Some(vec!["A=1".to_string()]);
        template.config.exposed_ports = Some(BTreeMap::from([("8080/tcp".to_string(), json!({}))]));

        let value = serde_json::to_value(&template).unwrap();
        assert_eq!(value["config"]["Env"], json!(["A=1"]));
        assert_eq!(value["config"]["ExposedPorts"], json!({"8080/tcp": {}}));
        assert_eq!(value["rootfs"], json!({"type": "layers", "diff_ids": []}));
        assert!(value["config"].get("Cmd").is_none());
    }
}
