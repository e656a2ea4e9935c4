use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::builder::containerizer::{Containerizer, DEFAULT_CONNECTION_TIMEOUT_SECONDS};
use crate::builder::plan::{FibContainerBuilder, FileEntriesLayer};
use crate::config::cmd::BuildTarget;
use crate::credential::Credential;
use crate::docker::client::DEFAULT_DOCKER_EXECUTABLE;
use crate::docker::DockerClient;
use crate::event::EventHandlers;
use crate::image::reference::ImageReference;
use crate::image::ImageFormat;
use crate::layer::entry::{AbsoluteUnixPath, LayerEntry};

/// The JSON build file given with `--config-file`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct FibCliConfiguration {
    pub base_image: Option<String>,
    pub base_image_credential: Option<CredentialConfig>,
    pub target_image: Option<String>,
    #[serde(default)]
    pub target_tags: Vec<String>,
    pub target_image_credential: Option<CredentialConfig>,
    #[serde(default)]
    pub image_layers: Vec<LayerConfig>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    pub working_directory: Option<String>,
    pub user: Option<String>,
    #[serde(default)]
    pub image_format: ImageFormat,
    /// When false the image gets the current time as its creation time.
    pub reproducible_build: Option<bool>,
    #[serde(default)]
    pub allow_insecure_registries: bool,
    #[serde(default)]
    pub offline_mode: bool,
    pub application_layers_cache_directory: Option<PathBuf>,
    pub base_layers_cache_directory: Option<PathBuf>,
    pub docker_executable: Option<PathBuf>,
    #[serde(default)]
    pub docker_environment: HashMap<String, String>,
    pub connection_timeout_seconds: Option<u64>,
    /// Path or name of a `docker-credential-*` executable to ask first.
    pub credential_helper: Option<PathBuf>,
}

/// `Username`/`Password`, either may be `${ENV_NAME}` to read it from the environment.
#[derive(Deserialize, Clone)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct CredentialConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig").field("username", &self.username).finish_non_exhaustive()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LayerConfig {
    pub name: String,
    #[serde(default)]
    pub layer_entries: Vec<LayerEntryConfig>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LayerEntryConfig {
    pub source_file: PathBuf,
    pub extraction_path: String,
    /// Octal, e.g. `"755"`.
    pub permissions: Option<String>,
    /// RFC 3339, e.g. `"2020-01-01T00:00:00Z"`.
    pub modification_time: Option<String>,
}

impl FibCliConfiguration {
    pub fn read(path: &Path) -> Result<FibCliConfiguration> {
        let file = File::open(path).with_context(|| format!("can not open build configuration {}", path.display()))?;
        serde_json::from_reader::<_, FibCliConfiguration>(BufReader::new(file))
            .with_context(|| format!("invalid build configuration {}", path.display()))
    }

    /// Validates the image part of the configuration. Relative source files
    /// are resolved against `base_directory`.
    pub fn to_builder(&self, base_directory: &Path) -> Result<FibContainerBuilder> {
        let base_image = self.base_image.as_deref().ok_or_else(|| anyhow!("'BaseImage' is required, use \"scratch\" for an empty base"))?;
        let base_image = ImageReference::parse(base_image).context("invalid 'BaseImage'")?;
        let mut builder = FibContainerBuilder::from(base_image)
            .set_base_image_credential(resolve_credential(self.base_image_credential.as_ref(), "BaseImageCredential")?)
            .set_format(self.image_format)
            .set_entrypoint(self.entrypoint.clone())
            .set_program_arguments(self.cmd.clone())
            .set_working_directory(self.working_directory.clone())
            .set_user(self.user.clone());
        if self.reproducible_build == Some(false) {
            builder = builder.set_creation_time(Utc::now());
        }

        for (name, value) in &self.environment {
            builder = builder.add_environment_variable(name, value);
        }
        for port in &self.exposed_ports {
            builder = builder.add_exposed_port(port).context("invalid 'ExposedPorts'")?;
        }
        for (key, value) in &self.labels {
            builder = builder.add_label(key, value);
        }
        for volume in &self.volumes {
            let volume = AbsoluteUnixPath::parse(volume).context("invalid 'Volumes'")?;
            builder = builder.add_volume(volume.as_str());
        }
        if let Some(working_directory) = &self.working_directory {
            AbsoluteUnixPath::parse(working_directory).context("invalid 'WorkingDirectory'")?;
        }

        for (index, layer) in self.image_layers.iter().enumerate() {
            if layer.name.trim().is_empty() {
                return Err(anyhow!("'ImageLayers[{}].Name' must not be empty", index));
            }
            let entries = layer
                .layer_entries
                .iter()
                .enumerate()
                .map(|(entry_index, entry)| {
                    layer_entry(entry, base_directory).with_context(|| format!("invalid 'ImageLayers[{}].LayerEntries[{}]'", index, entry_index))
                })
                .collect::<Result<Vec<LayerEntry>>>()?;
            builder = builder.add_layer(FileEntriesLayer::new(layer.name.as_str(), entries));
        }
        Ok(builder)
    }

    /// Validates the publishing part of the configuration for `target`.
    pub fn to_containerizer(&self, target: BuildTarget, tool_name: &str, event_handlers: EventHandlers) -> Result<Containerizer> {
        let target_image = self.target_image.as_deref().ok_or_else(|| anyhow!("'TargetImage' is required"))?;
        let target_image = ImageReference::parse(target_image).context("invalid 'TargetImage'")?;
        if target_image.is_scratch() {
            return Err(anyhow!("'TargetImage' can not be scratch"));
        }

        let mut containerizer = match target {
            BuildTarget::Tar(path) => Containerizer::to_tar(target_image, path),
            BuildTarget::Daemon => {
                let executable = self.docker_executable.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKER_EXECUTABLE));
                Containerizer::to_docker_daemon(target_image, DockerClient::new(executable, self.docker_environment.clone()))
            }
            BuildTarget::Push => Containerizer::to_registry(
                target_image,
                resolve_credential(self.target_image_credential.as_ref(), "TargetImageCredential")?,
            ),
        };
        for tag in &self.target_tags {
            containerizer = containerizer.with_additional_tag(tag.as_str()).context("invalid 'TargetTags'")?;
        }
        if let Some(directory) = &self.base_layers_cache_directory {
            containerizer = containerizer.set_base_image_layers_cache(directory);
        }
        if let Some(directory) = &self.application_layers_cache_directory {
            containerizer = containerizer.set_application_layers_cache(directory);
        }
        if let Some(helper) = &self.credential_helper {
            containerizer = containerizer.set_credential_helper(helper);
        }
        Ok(containerizer
            .set_offline_mode(self.offline_mode)?
            .set_allow_insecure_registries(self.allow_insecure_registries)
            .set_connection_timeout_seconds(Some(self.connection_timeout_seconds.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECONDS)))
            .set_tool_name(tool_name)
            .set_event_handlers(event_handlers))
    }
}

fn layer_entry(entry: &LayerEntryConfig, base_directory: &Path) -> Result<LayerEntry> {
    let source_file = if entry.source_file.is_absolute() {
        entry.source_file.clone()
    } else {
        base_directory.join(&entry.source_file)
    };
    if !source_file.exists() {
        return Err(anyhow!("'SourceFile' {} does not exist", source_file.display()));
    }
    let extraction_path = AbsoluteUnixPath::parse(&entry.extraction_path)?;
    let permissions = match &entry.permissions {
        Some(permissions) => Some(u32::from_str_radix(permissions, 8).map_err(|_| anyhow!("'Permissions' {} is not an octal number", permissions))?),
        None => None,
    };
    let modification_time = match &entry.modification_time {
        Some(time) => Some(
            DateTime::parse_from_rfc3339(time)
                .map_err(|err| anyhow!("'ModificationTime' {} is not an RFC 3339 time: {}", time, err))?
                .timestamp(),
        ),
        None => None,
    };
    Ok(LayerEntry::new(source_file, extraction_path, permissions, modification_time)?)
}

fn resolve_credential(credential: Option<&CredentialConfig>, field: &str) -> Result<Option<Credential>> {
    match credential {
        None => Ok(None),
        Some(credential) => Ok(Some(Credential::new(
            value_or_env(&credential.username).with_context(|| format!("invalid '{}.Username'", field))?,
            value_or_env(&credential.password).with_context(|| format!("invalid '{}.Password'", field))?,
        ))),
    }
}

/// `${NAME}` reads the environment variable `NAME`, anything else is literal.
fn value_or_env(param: &str) -> Result<String> {
    match param.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        Some(name) => env::var(name).map_err(|_| anyhow!("environment variable {} is not set", name)),
        None => Ok(param.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::builder::ImageTarget;

    fn parse(json: &str) -> FibCliConfiguration {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn builds_the_image_plan() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.jar"), b"jar").unwrap();
        let config = parse(
            r#"{
                "BaseImage": "gcr.io/distroless/java:11",
                "TargetImage": "r.example/app:1",
                "ImageLayers": [{"Name": "jar", "LayerEntries": [
                    {"SourceFile": "app.jar", "ExtractionPath": "/app/app.jar", "Permissions": "600", "ModificationTime": "1970-01-01T00:01:40Z"}
                ]}],
                "Entrypoint": ["java", "-jar", "/app/app.jar"],
                "Environment": {"JAVA_OPTS": "-Xmx1g"},
                "ExposedPorts": ["8080"],
                "ImageFormat": "OCI"
            }"#,
        );
        let builder = config.to_builder(dir.path()).unwrap();
        assert_eq!(builder.base_image().registry(), "gcr.io");
        let entry = &builder.layers()[0].entries()[0];
        assert_eq!(entry.source_file(), dir.path().join("app.jar"));
        assert_eq!(entry.permissions(), 0o600);
        assert_eq!(entry.modification_time(), 100);
        assert_eq!(builder.format, ImageFormat::Oci);
        assert!(builder.exposed_ports.contains("8080/tcp"));
    }

    #[test]
    fn field_errors_name_the_field() {
        let dir = tempfile::tempdir().unwrap();
        let missing_base = parse(r#"{"TargetImage": "app"}"#).to_builder(dir.path()).unwrap_err();
        assert!(missing_base.to_string().contains("'BaseImage'"));

        fs::write(dir.path().join("a"), b"a").unwrap();
        let relative = parse(r#"{"BaseImage": "scratch", "ImageLayers": [{"Name": "l", "LayerEntries": [{"SourceFile": "a", "ExtractionPath": "app/a"}]}]}"#)
            .to_builder(dir.path())
            .unwrap_err();
        assert!(format!("{:#}", relative).contains("absolute"), "{:#}", relative);

        let missing_file = parse(r#"{"BaseImage": "scratch", "ImageLayers": [{"Name": "l", "LayerEntries": [{"SourceFile": "nope", "ExtractionPath": "/a"}]}]}"#)
            .to_builder(dir.path())
            .unwrap_err();
        assert!(format!("{:#}", missing_file).contains("does not exist"));

        assert!(serde_json::from_str::<FibCliConfiguration>(r#"{"BaseImg": "scratch"}"#).is_err());
    }

    #[test]
    fn containerizer_follows_the_target() {
        let config = parse(
            r#"{"TargetImage": "r.example/app:1", "TargetTags": ["latest"], "DockerExecutable": "/usr/local/bin/docker", "OfflineMode": true}"#,
        );
        let containerizer = config.to_containerizer(BuildTarget::Daemon, "fibpack", EventHandlers::none()).unwrap();
        match containerizer.target() {
            ImageTarget::DockerDaemon { client } => assert_eq!(client.executable(), Path::new("/usr/local/bin/docker")),
            target => panic!("unexpected target {}", target),
        }
        assert_eq!(containerizer.all_tags().len(), 2);
        assert_eq!(containerizer.credential_helper, None);
        let with_helper = parse(r#"{"TargetImage": "r.example/app:1", "CredentialHelper": "docker-credential-corp"}"#)
            .to_containerizer(BuildTarget::Push, "fibpack", EventHandlers::none())
            .unwrap();
        assert_eq!(with_helper.credential_helper, Some(PathBuf::from("docker-credential-corp")));
        assert!(config.to_containerizer(BuildTarget::Push, "fibpack", EventHandlers::none()).is_err());
        assert!(parse("{}").to_containerizer(BuildTarget::Push, "fibpack", EventHandlers::none()).is_err());
    }

    #[test]
    fn credentials_can_come_from_the_environment() {
        assert_eq!(value_or_env("plain").unwrap(), "plain");
        assert!(value_or_env("${FIBPACK_TEST_SURELY_UNSET_VARIABLE}").is_err());
        let path = env::var("PATH").unwrap();
        assert_eq!(value_or_env("${PATH}").unwrap(), path);
    }
}
