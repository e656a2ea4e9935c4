use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, warn};
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

use crate::credential::Credential;
use crate::http::{Authorization, Connection, Request};

const DEFAULT_TOKEN_EXPIRES_IN: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    PushAndPull,
    Pull,
}

impl TokenType {
    fn actions(&self) -> &'static str {
        match self {
            TokenType::PushAndPull => "pull,push",
            TokenType::Pull => "pull",
        }
    }
}

/// What a token is requested for: the repository, the access needed and an
/// optional repository to mount blobs from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenScope {
    pub repository: String,
    pub token_type: TokenType,
    pub mount_from: Option<String>,
}

impl TokenScope {
    pub fn new(repository: &str, token_type: TokenType, mount_from: Option<&str>) -> TokenScope {
        TokenScope {
            repository: repository.to_string(),
            token_type,
            mount_from: mount_from.filter(|source| *source != repository).map(str::to_string),
        }
    }

    /// Values of the `scope` query parameters of a token request.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes = vec![format!("repository:{}:{}", self.repository, self.token_type.actions())];
        if let Some(source) = &self.mount_from {
            scopes.push(format!("repository:{}:pull", source));
        }
        scopes
    }

    fn cache_key(&self) -> String {
        match &self.mount_from {
            None => self.repository.clone(),
            Some(source) => format!("{}+{}", self.repository, source),
        }
    }
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationChallenge {
    Bearer(RegistryAuthenticator),
    Basic,
}

impl AuthenticationChallenge {
    pub fn parse(www_authenticate: &str) -> Result<AuthenticationChallenge> {
        let (scheme, params) = www_authenticate.trim().split_once(' ').unwrap_or((www_authenticate.trim(), ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(AuthenticationChallenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(anyhow!("www-authenticate header not supported: {}", www_authenticate));
        }
        let regex = Regex::new(r#"(?P<key>[A-Za-z]+)="(?P<value>[^"]*)""#)?;
        let params = regex
            .captures_iter(params)
            .map(|captures| (captures["key"].to_ascii_lowercase(), captures["value"].to_string()))
            .collect::<HashMap<String, String>>();
        let realm = params
            .get("realm")
            .ok_or_else(|| anyhow!("www-authenticate header has no realm: {}", www_authenticate))?;
        Ok(AuthenticationChallenge::Bearer(RegistryAuthenticator {
            realm: realm.clone(),
            service: params.get("service").cloned(),
        }))
    }

    /// Turns the challenge into an `Authorization` for `scope`.
    pub fn authorize(
        &self,
        connection: &Connection,
        credential: Option<&Credential>,
        scope: &TokenScope,
        user_agent: &str,
    ) -> Result<(Authorization, Option<Duration>)> {
        match self {
            AuthenticationChallenge::Basic => {
                let credential = credential.ok_or_else(|| anyhow!("the registry requires basic authentication but no credentials were found"))?;
                Ok((Authorization::from_basic_credentials(credential.username(), credential.password()), None))
            }
            AuthenticationChallenge::Bearer(authenticator) => {
                let token = authenticator.new_token(connection, credential, scope, user_agent)?;
                let expires_in = token.expires_in.unwrap_or_else(|| {
                    warn!("'expires_in' not found in token response. Set the expires time to 60 second by default.");
                    DEFAULT_TOKEN_EXPIRES_IN
                });
                Ok((Authorization::from_bearer_token(token.token()?), Some(Duration::from_secs(expires_in))))
            }
        }
    }
}

/// Exchanges credentials for bearer tokens at the realm named by the
/// registry's challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuthenticator {
    realm: String,
    service: Option<String>,
}

impl RegistryAuthenticator {
    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn token_url(&self, scope: &TokenScope) -> Result<Url> {
        let mut url = Url::parse(&self.realm).map_err(|err| anyhow!("invalid realm '{}': {}", self.realm, err))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &self.service {
                query.append_pair("service", service);
            }
            for scope in scope.scopes() {
                query.append_pair("scope", &scope);
            }
        }
        Ok(url)
    }

    pub fn new_token(&self, connection: &Connection, credential: Option<&Credential>, scope: &TokenScope, user_agent: &str) -> Result<TokenResponse> {
        let url = self.token_url(scope)?;
        debug!("Requesting token from {}", url);
        let authorization = credential.map(|credential| Authorization::from_basic_credentials(credential.username(), credential.password()));
        let request = Request::builder().authorization(authorization).user_agent(user_agent);
        let response = connection.get(&url, &request)?;
        let status = response.status();
        let response_bytes = response.bytes().unwrap_or_default();
        let response_text = String::from_utf8_lossy(&response_bytes);
        if !status.is_success() {
            return Err(anyhow!("get token failed, code: {}. response: {}", status.as_str(), response_text));
        }
        serde_json::from_slice::<TokenResponse>(&response_bytes)
            .map_err(|err| anyhow!("deserialization 'get token' response failed: {}. response: {}.", err, response_text))
    }
}

#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    /// Registries answer with `token`, `access_token` or both.
    pub fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .or(self.access_token.as_deref())
            .ok_or_else(|| anyhow!("token response has neither 'token' nor 'access_token'"))
    }
}

struct CachedAuthorization {
    authorization: Authorization,
    expires_at: Option<Instant>,
}

/// Authorizations by scope. One granted for push also serves pulls.
#[derive(Default)]
pub struct TokenCache {
    push_and_pull_map: HashMap<String, CachedAuthorization>,
    pull_map: HashMap<String, CachedAuthorization>,
}

impl TokenCache {
    pub fn get(&mut self, scope: &TokenScope) -> Option<Authorization> {
        let key = scope.cache_key();
        match get_authorization(&key, &mut self.push_and_pull_map) {
            None => match scope.token_type {
                TokenType::PushAndPull => None,
                TokenType::Pull => get_authorization(&key, &mut self.pull_map),
            },
            Some(authorization) => Some(authorization),
        }
    }

    pub fn put(&mut self, scope: &TokenScope, authorization: Authorization, expires_in: Option<Duration>) {
        let cached = CachedAuthorization {
            authorization,
            expires_at: expires_in.map(|expires_in| Instant::now() + expires_in),
        };
        let map = match scope.token_type {
            TokenType::PushAndPull => &mut self.push_and_pull_map,
            TokenType::Pull => &mut self.pull_map,
        };
        map.insert(scope.cache_key(), cached);
    }
}

fn get_authorization(key: &str, map: &mut HashMap<String, CachedAuthorization>) -> Option<Authorization> {
    if let Some(cached) = map.get(key) {
        match cached.expires_at {
            Some(expires_at) if Instant::now() >= expires_at => {
                map.remove(key);
            }
            _ => return Some(cached.authorization.clone()),
        }
    }
    None
}
