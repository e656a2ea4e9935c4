use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::credential::Credential;

pub const CREDENTIAL_HELPER_PREFIX: &str = "docker-credential-";

#[derive(Debug, Error)]
pub enum CredentialHelperError {
    #[error("credential helper {helper} is not installed")]
    NotFound { helper: String },
    #[error("credential helper {helper} has no credentials for {server_url}")]
    CredentialsNotFound { helper: String, server_url: String },
    #[error("credential helper {helper} failed: {message}")]
    Failed { helper: String, message: String },
}

impl CredentialHelperError {
    /// A soft failure lets the next credential source be tried.
    pub fn is_soft(&self) -> bool {
        !matches!(self, CredentialHelperError::Failed { .. })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialHelperResponse {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

/// Runs `docker-credential-<name> get` with the server url on stdin and reads
/// `{"ServerURL", "Username", "Secret"}` from stdout.
#[derive(Debug, Clone)]
pub struct DockerCredentialHelper {
    server_url: String,
    helper: PathBuf,
    environment: HashMap<String, String>,
}

impl DockerCredentialHelper {
    pub fn new(server_url: impl Into<String>, helper: impl Into<PathBuf>) -> DockerCredentialHelper {
        DockerCredentialHelper {
            server_url: server_url.into(),
            helper: helper.into(),
            environment: HashMap::new(),
        }
    }

    /// Resolves a helper by its suffix, e.g. `gcr` becomes `docker-credential-gcr`,
    /// looked up in `directory` when given and on `PATH` otherwise.
    pub fn from_suffix(server_url: impl Into<String>, suffix: &str, directory: Option<&Path>) -> DockerCredentialHelper {
        let name = format!("{}{}", CREDENTIAL_HELPER_PREFIX, suffix);
        let helper = match directory {
            Some(directory) => directory.join(name),
            None => PathBuf::from(name),
        };
        DockerCredentialHelper::new(server_url, helper)
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> DockerCredentialHelper {
        self.environment = environment;
        self
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Errors are [`CredentialHelperError`]s, except for I/O failures talking
    /// to a helper that did start.
    pub fn retrieve(&self) -> Result<Credential> {
        let helper_name = self.helper.display().to_string();
        debug!("Calling credential helper {} for {}", helper_name, self.server_url);
        let mut child = match Command::new(&self.helper)
            .arg("get")
            .envs(&self.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(CredentialHelperError::NotFound { helper: helper_name }.into()),
            Err(err) => return Err(err).with_context(|| format!("failed to start credential helper {}", helper_name)),
        };
        if let Some(mut stdin) = child.stdin.take() {
            // Helpers that ignore stdin may exit before reading it.
            match stdin.write_all(self.server_url.as_bytes()) {
                Err(err) if err.kind() != ErrorKind::BrokenPipe => {
                    return Err(err).with_context(|| format!("failed to write to credential helper {}", helper_name))
                }
                _ => {}
            }
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to read from credential helper {}", helper_name))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("credentials not found") || stderr.contains("credentials not found") {
                return Err(self.credentials_not_found(helper_name).into());
            }
            return Err(CredentialHelperError::Failed {
                helper: helper_name,
                message: format!("exited with {}: {}", output.status, first_non_empty(&stderr, &stdout)),
            }
            .into());
        }

        let response = serde_json::from_str::<CredentialHelperResponse>(&stdout)
            .map_err(|err| anyhow!("credential helper {} returned invalid JSON: {}", helper_name, err))?;
        match (response.username, response.secret) {
            (Some(username), Some(secret)) if !username.is_empty() || !secret.is_empty() => Ok(Credential::new(username, secret)),
            _ => Err(self.credentials_not_found(helper_name).into()),
        }
    }

    fn credentials_not_found(&self, helper: String) -> CredentialHelperError {
        CredentialHelperError::CredentialsNotFound {
            helper,
            server_url: self.server_url.clone(),
        }
    }
}

fn first_non_empty<'a>(first: &'a str, second: &'a str) -> &'a str {
    if first.trim().is_empty() {
        second.trim()
    } else {
        first.trim()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// Writes an executable shell script into `directory`.
    pub(crate) fn write_script(directory: &Path, name: &str, body: &str) -> PathBuf {
        let path = directory.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn echo_helper(directory: &Path, name: &str, username: &str) -> PathBuf {
        write_script(
            directory,
            name,
            &format!(
                "read server_url\necho \"{{\\\"ServerURL\\\":\\\"$server_url\\\",\\\"Username\\\":\\\"{}\\\",\\\"Secret\\\":\\\"secret-for-$server_url\\\"}}\"",
                username
            ),
        )
    }

    #[test]
    fn reads_credentials_from_helper_output() {
        let dir = tempfile::tempdir().unwrap();
        let helper = echo_helper(dir.path(), "docker-credential-test", "user");
        let credential = DockerCredentialHelper::new("registry.example", helper).retrieve().unwrap();
        assert_eq!(credential.username(), "user");
        assert_eq!(credential.password(), "secret-for-registry.example");
    }

    #[test]
    fn helper_environment_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_script(
            dir.path(),
            "docker-credential-env",
            "echo \"{\\\"Username\\\":\\\"$HELPER_USER\\\",\\\"Secret\\\":\\\"s\\\"}\"",
        );
        let environment = HashMap::from([("HELPER_USER".to_string(), "from-env".to_string())]);
        let credential = DockerCredentialHelper::new("r", helper).with_environment(environment).retrieve().unwrap();
        assert_eq!(credential.username(), "from-env");
    }

    #[test]
    fn missing_helper_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DockerCredentialHelper::from_suffix("r", "absent", Some(dir.path())).retrieve().unwrap_err();
        let helper_err = err.downcast_ref::<CredentialHelperError>().unwrap();
        assert!(matches!(helper_err, CredentialHelperError::NotFound { .. }));
        assert!(helper_err.is_soft());
    }

    #[test]
    fn unknown_server_is_credentials_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_script(dir.path(), "docker-credential-none", "echo 'credentials not found in native keychain'\nexit 1");
        let err = DockerCredentialHelper::new("r", helper).retrieve().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CredentialHelperError>(),
            Some(CredentialHelperError::CredentialsNotFound { .. })
        ));
    }

    #[test]
    fn other_failures_are_hard() {
        let dir = tempfile::tempdir().unwrap();
        let helper = write_script(dir.path(), "docker-credential-broken", "echo 'keychain locked' >&2\nexit 3");
        let err = DockerCredentialHelper::new("r", helper).retrieve().unwrap_err();
        let helper_err = err.downcast_ref::<CredentialHelperError>().unwrap();
        assert!(!helper_err.is_soft());
        assert!(helper_err.to_string().contains("keychain locked"));
    }
}
