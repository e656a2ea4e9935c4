use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::digest::{BlobDescriptor, DescriptorDigest};
use crate::image::RegContentType;

/// A `{mediaType, size, digest}` reference to a blob inside a manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentDescriptorTemplate {
    pub media_type: String,
    pub size: i64,
    pub digest: DescriptorDigest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

impl ContentDescriptorTemplate {
    pub fn new(media_type: &str, descriptor: &BlobDescriptor) -> ContentDescriptorTemplate {
        ContentDescriptorTemplate {
            media_type: media_type.to_string(),
            size: descriptor.size(),
            digest: descriptor.digest().clone(),
            urls: None,
        }
    }

    pub fn blob_descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::new(self.size, self.digest.clone())
    }
}

/// Docker image manifest v2, schema 2.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct V22ManifestTemplate {
    pub schema_version: u32,
    pub media_type: String,
    pub config: ContentDescriptorTemplate,
    pub layers: Vec<ContentDescriptorTemplate>,
}

impl V22ManifestTemplate {
    pub fn new(config: ContentDescriptorTemplate, layers: Vec<ContentDescriptorTemplate>) -> V22ManifestTemplate {
        V22ManifestTemplate {
            schema_version: 2,
            media_type: RegContentType::DOCKER_MANIFEST.val().to_string(),
            config,
            layers,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OciManifestTemplate {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: ContentDescriptorTemplate,
    pub layers: Vec<ContentDescriptorTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<serde_json::Map<String, Value>>,
}

impl OciManifestTemplate {
    pub fn new(config: ContentDescriptorTemplate, layers: Vec<ContentDescriptorTemplate>) -> OciManifestTemplate {
        OciManifestTemplate {
            schema_version: 2,
            media_type: Some(RegContentType::OCI_MANIFEST.val().to_string()),
            config,
            layers,
            annotations: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FsLayerTemplate {
    pub blob_sum: DescriptorDigest,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct V1CompatibilityTemplate {
    pub v1_compatibility: String,
}

/// Legacy Docker manifest v2, schema 1. Only read, never written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct V21ManifestTemplate {
    pub schema_version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    pub fs_layers: Vec<FsLayerTemplate>,
    #[serde(default)]
    pub history: Vec<V1CompatibilityTemplate>,
}

impl V21ManifestTemplate {
    /// Layer digests from the bottom layer up; schema 1 lists them top first.
    pub fn layer_digests(&self) -> Vec<DescriptorDigest> {
        self.fs_layers.iter().rev().map(|layer| layer.blob_sum.clone()).collect()
    }

    /// The container configuration embedded in the topmost history entry.
    pub fn container_configuration(&self) -> Result<Option<Value>> {
        match self.history.first() {
            None => Ok(None),
            Some(history) => Ok(Some(serde_json::from_str(&history.v1_compatibility)?)),
        }
    }
}

/// Implemented by every manifest template that can be requested by type.
pub trait ManifestTemplateType: Serialize + DeserializeOwned + Sized {
    fn schema_version() -> u32;
    fn accepted_media_types() -> &'static [&'static str];
    fn manifest_media_type(&self) -> &str;
    fn into_manifest(self) -> ManifestTemplate;
}

impl ManifestTemplateType for V21ManifestTemplate {
    fn schema_version() -> u32 {
        1
    }

    fn accepted_media_types() -> &'static [&'static str] {
        &[RegContentType::DOCKER_MANIFEST_V1.0, RegContentType::DOCKER_MANIFEST_V1_SIGNED.0]
    }

    fn manifest_media_type(&self) -> &str {
        RegContentType::DOCKER_MANIFEST_V1.val()
    }

    fn into_manifest(self) -> ManifestTemplate {
        ManifestTemplate::V21(self)
    }
}

impl ManifestTemplateType for V22ManifestTemplate {
    fn schema_version() -> u32 {
        2
    }

    fn accepted_media_types() -> &'static [&'static str] {
        &[RegContentType::DOCKER_MANIFEST.0]
    }

    fn manifest_media_type(&self) -> &str {
        &self.media_type
    }

    fn into_manifest(self) -> ManifestTemplate {
        ManifestTemplate::V22(self)
    }
}

impl ManifestTemplateType for OciManifestTemplate {
    fn schema_version() -> u32 {
        2
    }

    fn accepted_media_types() -> &'static [&'static str] {
        &[RegContentType::OCI_MANIFEST.0]
    }

    fn manifest_media_type(&self) -> &str {
        RegContentType::OCI_MANIFEST.val()
    }

    fn into_manifest(self) -> ManifestTemplate {
        ManifestTemplate::Oci(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestTemplate {
    V21(V21ManifestTemplate),
    V22(V22ManifestTemplate),
    Oci(OciManifestTemplate),
}

impl ManifestTemplate {
    /// Every media type `pull_any_manifest` asks for.
    pub const ACCEPTED_MEDIA_TYPES: [&'static str; 4] = [
        RegContentType::OCI_MANIFEST.0,
        RegContentType::DOCKER_MANIFEST.0,
        RegContentType::DOCKER_MANIFEST_V1_SIGNED.0,
        RegContentType::DOCKER_MANIFEST_V1.0,
    ];

    /// Picks the template from the response media type, falling back to the
    /// `schemaVersion`/`mediaType` fields of the body.
    pub fn from_json(content_type: Option<&str>, body: &[u8]) -> Result<ManifestTemplate> {
        let value = serde_json::from_slice::<Value>(body)?;
        let media_type = content_type
            .map(|content_type| content_type.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|content_type| ManifestTemplate::ACCEPTED_MEDIA_TYPES.contains(&content_type.as_str()))
            .or_else(|| value.get("mediaType").and_then(Value::as_str).map(str::to_string));
        let schema_version = value.get("schemaVersion").and_then(Value::as_u64);

        match (schema_version, media_type.as_deref()) {
            (Some(1), _) => Ok(ManifestTemplate::V21(serde_json::from_value(value)?)),
            (Some(2), Some(media_type)) if media_type == RegContentType::DOCKER_MANIFEST.val() => {
                Ok(ManifestTemplate::V22(serde_json::from_value(value)?))
            }
            (Some(2), Some(media_type)) if media_type == RegContentType::OCI_MANIFEST.val() => {
                Ok(ManifestTemplate::Oci(serde_json::from_value(value)?))
            }
            (Some(2), None) => Ok(ManifestTemplate::Oci(serde_json::from_value(value)?)),
            (Some(2), Some(media_type))
                if media_type == RegContentType::DOCKER_MANIFEST_LIST.val() || media_type == RegContentType::OCI_INDEX.val() =>
            {
                Err(anyhow!("manifest lists are not supported: {}", media_type))
            }
            (version, media_type) => Err(anyhow!(
                "unknown manifest: schemaVersion={:?}, mediaType={:?}",
                version,
                media_type
            )),
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            ManifestTemplate::V21(manifest) => manifest.schema_version,
            ManifestTemplate::V22(manifest) => manifest.schema_version,
            ManifestTemplate::Oci(manifest) => manifest.schema_version,
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            ManifestTemplate::V21(manifest) => manifest.manifest_media_type(),
            ManifestTemplate::V22(manifest) => manifest.manifest_media_type(),
            ManifestTemplate::Oci(manifest) => manifest.manifest_media_type(),
        }
    }

    pub fn config(&self) -> Option<&ContentDescriptorTemplate> {
        match self {
            ManifestTemplate::V21(_) => None,
            ManifestTemplate::V22(manifest) => Some(&manifest.config),
            ManifestTemplate::Oci(manifest) => Some(&manifest.config),
        }
    }

    /// Layer digests from the bottom layer up, with sizes where known.
    pub fn layers(&self) -> Vec<BlobDescriptor> {
        match self {
            ManifestTemplate::V21(manifest) => manifest.layer_digests().into_iter().map(BlobDescriptor::with_unknown_size).collect(),
            ManifestTemplate::V22(manifest) => manifest.layers.iter().map(ContentDescriptorTemplate::blob_descriptor).collect(),
            ManifestTemplate::Oci(manifest) => manifest.layers.iter().map(ContentDescriptorTemplate::blob_descriptor).collect(),
        }
    }

    pub fn to_json_value(&self) -> Result<Value> {
        Ok(match self {
            ManifestTemplate::V21(manifest) => serde_json::to_value(manifest)?,
            ManifestTemplate::V22(manifest) => serde_json::to_value(manifest)?,
            ManifestTemplate::Oci(manifest) => serde_json::to_value(manifest)?,
        })
    }

    pub fn manifest_type(&self) -> &str {
        match self {
            ManifestTemplate::V21(_) => "Docker V2,Schema1",
            ManifestTemplate::V22(_) => "Docker V2,Schema2",
            ManifestTemplate::Oci(_) => "OCI",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    #[test]
    fn v22_round_trips_with_camel_case_fields() {
        let body = json!({
            "schemaVersion": 2,
            "mediaType": RegContentType::DOCKER_MANIFEST.val(),
            "config": {"mediaType": RegContentType::DOCKER_CONTAINER_IMAGE.val(), "size": 7, "digest": digest('a')},
            "layers": [{"mediaType": RegContentType::DOCKER_LAYER_TGZ.val(), "size": 9, "digest": digest('b')}]
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let manifest = ManifestTemplate::from_json(Some(RegContentType::DOCKER_MANIFEST.val()), &bytes).unwrap();
        assert!(matches!(manifest, ManifestTemplate::V22(_)));
        assert_eq!(manifest.layers()[0].size(), 9);
        assert_eq!(manifest.config().unwrap().digest.to_string(), digest('a'));
        assert_eq!(manifest.to_json_value().unwrap(), body);
    }

    #[test]
    fn v21_layers_are_reversed() {
        let body = json!({
            "schemaVersion": 1,
            "fsLayers": [{"blobSum": digest('c')}, {"blobSum": digest('d')}],
            "history": [{"v1Compatibility": "{\"os\":\"linux\"}"}]
        });
        let manifest = ManifestTemplate::from_json(None, &serde_json::to_vec(&body).unwrap()).unwrap();
        let layers = manifest.layers();
        assert_eq!(layers[0].digest().to_string(), digest('d'));
        assert!(!layers[0].has_size());
        assert!(manifest.config().is_none());
    }

    #[test]
    fn manifest_lists_are_rejected() {
        let body = json!({"schemaVersion": 2, "mediaType": RegContentType::OCI_INDEX.val(), "manifests": []});
        let err = ManifestTemplate::from_json(None, &serde_json::to_vec(&body).unwrap()).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
