use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use crate::credential::helper::{CredentialHelperError, DockerCredentialHelper};
use crate::credential::{Credential, CredentialRetriever};
use crate::event::{EventHandlers, LogEvent};
use crate::image::reference::{DEFAULT_IMAGE_HOST, DOCKER_IO_HOST};

/// Key `docker login` uses for Docker Hub.
pub const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";

/// `~/.docker/config.json`
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfigTemplate {
    #[serde(default)]
    pub auths: HashMap<String, DockerConfigAuthTemplate>,
    #[serde(default)]
    pub cred_helpers: HashMap<String, String>,
    #[serde(default)]
    pub creds_store: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct DockerConfigAuthTemplate {
    #[serde(default)]
    pub auth: Option<String>,
}

impl DockerConfigTemplate {
    pub fn read(path: &Path) -> Result<Option<DockerConfigTemplate>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("failed to open docker config {}", path.display())),
        };
        let config = serde_json::from_reader::<_, DockerConfigTemplate>(BufReader::new(file))
            .with_context(|| format!("failed to parse docker config {}", path.display()))?;
        Ok(Some(config))
    }

    /// The `auths` entry for `registry` and the key it was found under.
    pub fn find_auth(&self, registry: &str) -> Option<(&str, &DockerConfigAuthTemplate)> {
        find_by_registry(&self.auths, registry)
    }
}

/// Finds the entry for `registry`: an exact key first, then a key that is the
/// registry behind a scheme and optional path, then the longest key whose host
/// is a dot-separated suffix of the registry.
fn find_by_registry<'a, V>(entries: &'a HashMap<String, V>, registry: &str) -> Option<(&'a str, &'a V)> {
    if let Some((key, value)) = entries.get_key_value(registry) {
        return Some((key.as_str(), value));
    }
    let mut keys = entries.keys().collect::<Vec<&String>>();
    keys.sort();
    if let Some(key) = keys.iter().find(|key| host_of(key) == registry) {
        return entries.get_key_value(key.as_str()).map(|(key, value)| (key.as_str(), value));
    }
    keys.iter()
        .filter(|key| {
            let host = host_of(key);
            !host.is_empty() && registry.ends_with(&format!(".{}", host))
        })
        .max_by_key(|key| host_of(key).len())
        .and_then(|key| entries.get_key_value(key.as_str()))
        .map(|(key, value)| (key.as_str(), value))
}

fn host_of(key: &str) -> &str {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

/// Docker Hub is stored under several names depending on the tool that wrote
/// the config.
fn registry_aliases(registry: &str) -> Vec<&str> {
    match registry {
        DEFAULT_IMAGE_HOST | DOCKER_IO_HOST | "index.docker.io" => {
            vec![DOCKER_HUB_CONFIG_KEY, "index.docker.io", DEFAULT_IMAGE_HOST, DOCKER_IO_HOST]
        }
        registry => vec![registry],
    }
}

fn decode_auth(key: &str, auth: &str) -> Result<Credential> {
    let decoded = STANDARD
        .decode(auth.trim())
        .with_context(|| format!("invalid base64 auth for {} in docker config", key))?;
    let decoded = String::from_utf8(decoded).with_context(|| format!("invalid auth for {} in docker config", key))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| anyhow!("auth for {} in docker config is not 'username:password'", key))?;
    Ok(Credential::new(username, password))
}

pub struct DockerConfigCredentialRetriever {
    registry: String,
    config_path: PathBuf,
    helper_directory: Option<PathBuf>,
    helper_environment: HashMap<String, String>,
    event_handlers: EventHandlers,
}

impl DockerConfigCredentialRetriever {
    pub fn new(registry: impl Into<String>, config_path: impl Into<PathBuf>, event_handlers: EventHandlers) -> DockerConfigCredentialRetriever {
        DockerConfigCredentialRetriever {
            registry: registry.into(),
            config_path: config_path.into(),
            helper_directory: None,
            helper_environment: HashMap::new(),
            event_handlers,
        }
    }

    pub fn with_helpers(mut self, helper_directory: Option<PathBuf>, helper_environment: HashMap<String, String>) -> DockerConfigCredentialRetriever {
        self.helper_directory = helper_directory;
        self.helper_environment = helper_environment;
        self
    }

    /// The helper to ask and the server url to ask it for. `credHelpers` is
    /// searched under every alias first; `credsStore` is then asked once, for
    /// the key `docker login` recorded in `auths` if there is one.
    fn helper_for<'a>(&self, config: &'a DockerConfigTemplate, aliases: &[&'a str]) -> Option<(&'a str, &'a str)> {
        for alias in aliases {
            if let Some((_, helper)) = find_by_registry(&config.cred_helpers, alias) {
                return Some((helper.as_str(), *alias));
            }
        }
        let creds_store = config.creds_store.as_deref()?;
        let server_url = aliases
            .iter()
            .find_map(|alias| config.find_auth(alias).map(|(key, _)| key))
            .or_else(|| aliases.first().copied())?;
        Some((creds_store, server_url))
    }

    fn retrieve_from(&self, config: &DockerConfigTemplate) -> Result<Option<Credential>> {
        let aliases = registry_aliases(&self.registry);
        if let Some((helper, server_url)) = self.helper_for(config, &aliases) {
            let helper = DockerCredentialHelper::from_suffix(server_url, helper, self.helper_directory.as_deref())
                .with_environment(self.helper_environment.clone());
            match helper.retrieve() {
                Ok(credential) => {
                    self.event_handlers.dispatch(LogEvent::info(format!(
                        "Using credential helper {} for {}",
                        helper.helper().display(),
                        self.registry
                    )));
                    return Ok(Some(credential));
                }
                Err(err) => match err.downcast_ref::<CredentialHelperError>() {
                    Some(helper_err) if helper_err.is_soft() => {
                        self.event_handlers.dispatch(LogEvent::warn(helper_err.to_string()));
                    }
                    _ => return Err(err),
                },
            }
        }

        for alias in &aliases {
            if let Some((key, auth)) = config.find_auth(alias) {
                if let Some(encoded) = auth.auth.as_deref().filter(|encoded| !encoded.is_empty()) {
                    self.event_handlers.dispatch(LogEvent::info(format!(
                        "Using credentials from {} for {}",
                        self.config_path.display(),
                        self.registry
                    )));
                    return decode_auth(key, encoded).map(Some);
                }
            }
        }
        Ok(None)
    }
}

impl CredentialRetriever for DockerConfigCredentialRetriever {
    fn retrieve(&self) -> Result<Option<Credential>> {
        match DockerConfigTemplate::read(&self.config_path)? {
            None => Ok(None),
            Some(config) => self.retrieve_from(&config),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::credential::helper::tests::{echo_helper, write_script};

    fn config(json: &str) -> DockerConfigTemplate {
        serde_json::from_str(json).unwrap()
    }

    fn basic(user_pass: &str) -> String {
        STANDARD.encode(user_pass)
    }

    #[test]
    fn matches_exact_scheme_prefixed_and_suffix_keys() {
        let config = config(&format!(
            r#"{{"auths": {{
                "exact.example": {{"auth": "{}"}},
                "https://prefixed.example/v2/": {{"auth": "{}"}},
                "example.com": {{"auth": "{}"}},
                "eu.example.com": {{"auth": "{}"}}
            }}}}"#,
            basic("a:1"),
            basic("b:2"),
            basic("c:3"),
            basic("d:4")
        ));
        assert_eq!(config.find_auth("exact.example").unwrap().0, "exact.example");
        assert_eq!(config.find_auth("prefixed.example").unwrap().0, "https://prefixed.example/v2/");
        assert_eq!(config.find_auth("registry.eu.example.com").unwrap().0, "eu.example.com");
        assert_eq!(config.find_auth("other.example.com").unwrap().0, "example.com");
        assert!(config.find_auth("notexample.com").is_none());
        assert!(config.find_auth("unknown.io").is_none());
    }

    #[test]
    fn cred_helpers_take_precedence_over_creds_store() {
        let config = config(r#"{"credHelpers": {"gcr.io": "gcr"}, "credsStore": "desktop"}"#);
        let retriever = |registry: &str| DockerConfigCredentialRetriever::new(registry, "unused", EventHandlers::none());
        assert_eq!(retriever("gcr.io").helper_for(&config, &["gcr.io"]), Some(("gcr", "gcr.io")));
        assert_eq!(retriever("quay.io").helper_for(&config, &["quay.io"]), Some(("desktop", "quay.io")));
    }

    #[test]
    fn missing_config_is_a_clean_miss() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = DockerConfigCredentialRetriever::new("r.example", dir.path().join("config.json"), EventHandlers::none());
        assert!(retriever.retrieve().unwrap().is_none());
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let retriever = DockerConfigCredentialRetriever::new("r.example", &path, EventHandlers::none());
        assert!(retriever.retrieve().is_err());
    }

    #[test]
    fn helper_wins_over_inline_auth() {
        let dir = tempfile::tempdir().unwrap();
        echo_helper(dir.path(), "docker-credential-fake", "from-helper");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            format!(
                r#"{{"auths": {{"r.example": {{"auth": "{}"}}}}, "credHelpers": {{"r.example": "fake"}}}}"#,
                basic("inline:pw")
            ),
        )
        .unwrap();

        let retriever = DockerConfigCredentialRetriever::new("r.example", &path, EventHandlers::none())
            .with_helpers(Some(dir.path().to_path_buf()), HashMap::new());
        let credential = retriever.retrieve().unwrap().unwrap();
        assert_eq!(credential.username(), "from-helper");
        assert_eq!(credential.password(), "secret-for-r.example");
    }

    #[test]
    fn missing_helper_falls_back_to_inline_auth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            format!(r#"{{"auths": {{"r.example": {{"auth": "{}"}}}}, "credsStore": "absent"}}"#, basic("inline:pw:with:colons")),
        )
        .unwrap();

        let retriever = DockerConfigCredentialRetriever::new("r.example", &path, EventHandlers::none())
            .with_helpers(Some(dir.path().to_path_buf()), HashMap::new());
        let credential = retriever.retrieve().unwrap().unwrap();
        assert_eq!(credential.username(), "inline");
        assert_eq!(credential.password(), "pw:with:colons");
    }

    #[test]
    fn docker_hub_uses_index_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            format!(r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{}"}}}}}}"#, basic("hub:pw")),
        )
        .unwrap();
        let retriever = DockerConfigCredentialRetriever::new(DEFAULT_IMAGE_HOST, &path, EventHandlers::none());
        assert_eq!(retriever.retrieve().unwrap().unwrap().username(), "hub");
    }

    #[test]
    fn creds_store_runs_once_for_docker_hub() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");
        write_script(
            dir.path(),
            "docker-credential-desktop",
            &format!("read server_url\necho \"$server_url\" >> {}\necho 'credentials not found in native keychain'\nexit 1", calls.display()),
        );
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            format!(r#"{{"auths": {{"docker.io": {{"auth": "{}"}}}}, "credsStore": "desktop"}}"#, basic("hub:pw")),
        )
        .unwrap();

        let retriever = DockerConfigCredentialRetriever::new(DEFAULT_IMAGE_HOST, &path, EventHandlers::none())
            .with_helpers(Some(dir.path().to_path_buf()), HashMap::new());
        assert_eq!(retriever.retrieve().unwrap().unwrap().username(), "hub");
        assert_eq!(fs::read_to_string(&calls).unwrap(), "docker.io\n");
    }
}
