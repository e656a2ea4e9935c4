use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;

use anyhow::Result;
use home::home_dir;
use log::debug;

use crate::credential::docker_config::DockerConfigCredentialRetriever;
use crate::credential::helper::{CredentialHelperError, DockerCredentialHelper};
use crate::event::{EventHandlers, LogEvent};
use crate::image::reference::ImageReference;

pub mod docker_config;
pub mod helper;

/// Registry hostname suffixes with a well known credential helper, tried in
/// this order.
pub const KNOWN_CREDENTIAL_HELPERS: [(&str, &str); 2] = [("gcr.io", "gcr"), ("amazonaws.com", "ecr-login")];

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Credential {
        Credential {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("username", &self.username).finish_non_exhaustive()
    }
}

/// One source of registry credentials. `Ok(None)` means the source has
/// nothing for the registry and the next one should be asked.
pub trait CredentialRetriever: Send + Sync {
    fn retrieve(&self) -> Result<Option<Credential>>;
}

impl<F> CredentialRetriever for F
where
    F: Fn() -> Result<Option<Credential>> + Send + Sync,
{
    fn retrieve(&self) -> Result<Option<Credential>> {
        self()
    }
}

/// Asks each retriever in order and returns the first credential found.
pub fn retrieve_first(retrievers: &[Box<dyn CredentialRetriever>]) -> Result<Option<Credential>> {
    for retriever in retrievers {
        if let Some(credential) = retriever.retrieve()? {
            return Ok(Some(credential));
        }
    }
    Ok(None)
}

/// Creates the credential sources for one image.
pub struct CredentialRetrieverFactory {
    registry: String,
    event_handlers: EventHandlers,
    helper_directory: Option<PathBuf>,
    helper_environment: HashMap<String, String>,
    credential_helper: Option<PathBuf>,
}

impl CredentialRetrieverFactory {
    pub fn for_image(image_reference: &ImageReference, event_handlers: &EventHandlers) -> CredentialRetrieverFactory {
        CredentialRetrieverFactory {
            registry: image_reference.registry().to_string(),
            event_handlers: event_handlers.clone(),
            helper_directory: None,
            helper_environment: HashMap::new(),
            credential_helper: None,
        }
    }

    /// Directory holding `docker-credential-*` executables; `PATH` is searched
    /// when not set.
    pub fn with_helper_directory(mut self, helper_directory: impl Into<PathBuf>) -> CredentialRetrieverFactory {
        self.helper_directory = Some(helper_directory.into());
        self
    }

    /// Extra environment variables for credential helper processes.
    pub fn with_helper_environment(mut self, helper_environment: HashMap<String, String>) -> CredentialRetrieverFactory {
        self.helper_environment = helper_environment;
        self
    }

    /// A helper the user named; [`default_chain`](Self::default_chain) asks it
    /// right after the known credential.
    pub fn with_credential_helper(mut self, credential_helper: impl Into<PathBuf>) -> CredentialRetrieverFactory {
        self.credential_helper = Some(credential_helper.into());
        self
    }

    pub fn known(&self, credential: Credential, source: &str) -> Box<dyn CredentialRetriever> {
        let event_handlers = self.event_handlers.clone();
        let message = format!("Using credentials from {} for {}", source, self.registry);
        Box::new(move || -> Result<Option<Credential>> {
            event_handlers.dispatch(LogEvent::info(message.as_str()));
            Ok(Some(credential.clone()))
        })
    }

    /// Uses the helper executable at `helper`. A missing helper or one without
    /// credentials for this registry is an error here, since it was asked for
    /// explicitly.
    pub fn docker_credential_helper(&self, helper: impl Into<PathBuf>) -> Box<dyn CredentialRetriever> {
        let helper = DockerCredentialHelper::new(self.registry.clone(), helper).with_environment(self.helper_environment.clone());
        let event_handlers = self.event_handlers.clone();
        Box::new(move || -> Result<Option<Credential>> {
            let credential = helper.retrieve()?;
            event_handlers.dispatch(LogEvent::info(format!(
                "Using credential helper {} for {}",
                helper.helper().display(),
                helper.server_url()
            )));
            Ok(Some(credential))
        })
    }

    /// Tries the well known helper of every matching registry suffix.
    pub fn infer_credential_helper(&self) -> Box<dyn CredentialRetriever> {
        let registry = self.registry.clone();
        let helper_directory = self.helper_directory.clone();
        let helper_environment = self.helper_environment.clone();
        let event_handlers = self.event_handlers.clone();
        Box::new(move || -> Result<Option<Credential>> {
            for (suffix, helper_suffix) in KNOWN_CREDENTIAL_HELPERS {
                if !registry.ends_with(suffix) {
                    continue;
                }
                let helper = DockerCredentialHelper::from_suffix(registry.as_str(), helper_suffix, helper_directory.as_deref())
                    .with_environment(helper_environment.clone());
                match helper.retrieve() {
                    Ok(credential) => {
                        event_handlers.dispatch(LogEvent::info(format!(
                            "Using credential helper {} for {}",
                            helper.helper().display(),
                            registry
                        )));
                        return Ok(Some(credential));
                    }
                    Err(err) => match err.downcast_ref::<CredentialHelperError>() {
                        Some(helper_err) if helper_err.is_soft() => {
                            event_handlers.dispatch(LogEvent::warn(format!(
                                "The credential helper {} was not usable for {}: {}",
                                helper.helper().display(),
                                registry,
                                helper_err
                            )));
                        }
                        _ => return Err(err),
                    },
                }
            }
            Ok(None)
        })
    }

    pub fn docker_config(&self, config_path: impl Into<PathBuf>) -> Box<dyn CredentialRetriever> {
        Box::new(
            DockerConfigCredentialRetriever::new(self.registry.clone(), config_path, self.event_handlers.clone())
                .with_helpers(self.helper_directory.clone(), self.helper_environment.clone()),
        )
    }

    /// `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`.
    pub fn docker_config_default(&self) -> Box<dyn CredentialRetriever> {
        match default_docker_config_path() {
            Some(path) => self.docker_config(path),
            None => {
                debug!("No home directory, skipping the docker config");
                Box::new(|| -> Result<Option<Credential>> { Ok(None) })
            }
        }
    }

    /// Known credential first, then the named helper, then the inferred helper,
    /// then the docker config.
    pub fn default_chain(&self, known: Option<Credential>, source: &str) -> Vec<Box<dyn CredentialRetriever>> {
        let mut retrievers = Vec::with_capacity(4);
        if let Some(credential) = known {
            retrievers.push(self.known(credential, source));
        }
        if let Some(credential_helper) = &self.credential_helper {
            retrievers.push(self.docker_credential_helper(credential_helper));
        }
        retrievers.push(self.infer_credential_helper());
        retrievers.push(self.docker_config_default());
        retrievers
    }
}

pub fn default_docker_config_path() -> Option<PathBuf> {
    match std::env::var_os("DOCKER_CONFIG") {
        Some(directory) => Some(PathBuf::from(directory).join("config.json")),
        None => home_dir().map(|home| home.join(".docker").join("config.json")),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;

    use super::*;
    use crate::credential::helper::tests::{echo_helper, write_script};

    fn reference(name: &str) -> ImageReference {
        ImageReference::parse(name).unwrap()
    }

    #[test]
    fn first_match_wins_and_later_sources_are_not_asked() {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        let factory = CredentialRetrieverFactory::for_image(&reference("r.example/app"), &EventHandlers::none());
        let retrievers: Vec<Box<dyn CredentialRetriever>> = vec![
            Box::new(|| -> Result<Option<Credential>> { Ok(None) }),
            factory.known(Credential::new("first", "1"), "test"),
            Box::new(move || -> Result<Option<Credential>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Credential::new("second", "2")))
            }),
        ];
        assert_eq!(retrieve_first(&retrievers).unwrap().unwrap().username(), "first");
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hard_errors_stop_the_chain() {
        let retrievers: Vec<Box<dyn CredentialRetriever>> = vec![
            Box::new(|| -> Result<Option<Credential>> { Err(anyhow!("disk on fire")) }),
            Box::new(|| -> Result<Option<Credential>> { Ok(Some(Credential::new("never", "used"))) }),
        ];
        assert!(retrieve_first(&retrievers).is_err());
        assert!(retrieve_first(&[]).unwrap().is_none());
    }

    #[test]
    fn known_credential_logs_its_source() {
        let logs = Arc::new(Mutex::new(Vec::<String>::new()));
        let recorder = logs.clone();
        let handlers = EventHandlers::builder()
            .add::<LogEvent, _>(move |event| recorder.lock().unwrap().push(event.message.clone()))
            .build();
        let factory = CredentialRetrieverFactory::for_image(&reference("r.example/app"), &handlers);
        factory.known(Credential::new("u", "p"), "build configuration").retrieve().unwrap();
        assert_eq!(*logs.lock().unwrap(), vec!["Using credentials from build configuration for r.example"]);
    }

    #[test]
    fn inferred_helper_matches_registry_suffix() {
        let dir = tempfile::tempdir().unwrap();
        echo_helper(dir.path(), "docker-credential-gcr", "oauth2accesstoken");
        let factory = CredentialRetrieverFactory::for_image(&reference("eu.gcr.io/project/app"), &EventHandlers::none())
            .with_helper_directory(dir.path());
        let credential = factory.infer_credential_helper().retrieve().unwrap().unwrap();
        assert_eq!(credential.username(), "oauth2accesstoken");
        assert_eq!(credential.password(), "secret-for-eu.gcr.io");

        let unrelated = CredentialRetrieverFactory::for_image(&reference("quay.io/app"), &EventHandlers::none())
            .with_helper_directory(dir.path());
        assert!(unrelated.infer_credential_helper().retrieve().unwrap().is_none());
    }

    #[test]
    fn inferred_helper_soft_failures_are_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(Mutex::new(0));
        let counter = warnings.clone();
        let handlers = EventHandlers::builder()
            .add::<LogEvent, _>(move |event| {
                if event.level == crate::event::LogLevel::Warn {
                    *counter.lock().unwrap() += 1;
                }
            })
            .build();
        let factory = CredentialRetrieverFactory::for_image(&reference("123.dkr.ecr.us-east-1.amazonaws.com/app"), &handlers)
            .with_helper_directory(dir.path());
        assert!(factory.infer_credential_helper().retrieve().unwrap().is_none());
        assert_eq!(*warnings.lock().unwrap(), 1);

        write_script(dir.path(), "docker-credential-ecr-login", "echo 'access denied' >&2\nexit 2");
        assert!(factory.infer_credential_helper().retrieve().is_err());
    }

    #[test]
    fn chain_prefers_helper_over_docker_config() {
        let dir = tempfile::tempdir().unwrap();
        echo_helper(dir.path(), "docker-credential-gcr", "helper-user");
        let config_path = dir.path().join("config.json");
        fs::write(&config_path, r#"{"auths": {"gcr.io": {"auth": "Y29uZmlnOnB3"}}}"#).unwrap();

        let factory = CredentialRetrieverFactory::for_image(&reference("gcr.io/project/app"), &EventHandlers::none())
            .with_helper_directory(dir.path());
        let retrievers = vec![factory.infer_credential_helper(), factory.docker_config(&config_path)];
        assert_eq!(retrieve_first(&retrievers).unwrap().unwrap().username(), "helper-user");

        fs::remove_file(dir.path().join("docker-credential-gcr")).unwrap();
        assert_eq!(retrieve_first(&retrievers).unwrap().unwrap().username(), "config");
    }

    #[test]
    fn named_helper_wins_over_the_inferred_one() {
        let dir = tempfile::tempdir().unwrap();
        echo_helper(dir.path(), "docker-credential-gcr", "inferred");
        let named = echo_helper(dir.path(), "docker-credential-corp", "named");
        let factory = CredentialRetrieverFactory::for_image(&reference("gcr.io/project/app"), &EventHandlers::none())
            .with_helper_directory(dir.path())
            .with_credential_helper(named);
        let credential = retrieve_first(&factory.default_chain(None, "unused")).unwrap().unwrap();
        assert_eq!(credential.username(), "named");

        let known = retrieve_first(&factory.default_chain(Some(Credential::new("known", "pw")), "test")).unwrap().unwrap();
        assert_eq!(known.username(), "known");
    }

    #[test]
    fn missing_named_helper_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        echo_helper(dir.path(), "docker-credential-gcr", "inferred");
        let factory = CredentialRetrieverFactory::for_image(&reference("gcr.io/project/app"), &EventHandlers::none())
            .with_helper_directory(dir.path())
            .with_credential_helper(dir.path().join("docker-credential-absent"));
        let err = retrieve_first(&factory.default_chain(None, "unused")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CredentialHelperError>(),
            Some(CredentialHelperError::NotFound { .. })
        ));
    }
}
