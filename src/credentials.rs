//! Database credential acquisition.
//!
//! Connections authenticate with a short-lived bearer token. The
//! [`CredentialProvider`] tries a primary strategy (the environment-bound
//! identity: a projected token file or a pre-issued token) and falls back to a
//! secondary one (a CLI command from the default identity chain). Each strategy
//! object is built lazily, once, behind a `OnceCell`; fetching a token never
//! holds that cell's lock.

use crate::config::{AuthMode, Config};
use crate::error::{LookupError, LookupResult};
use futures_util::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// An access token plus the moment it was obtained.
#[derive(Clone)]
pub struct Credential {
    token: String,
    acquired_at: Instant,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            acquired_at: Instant::now(),
        }
    }

    /// Empty credential for backends that do not authenticate.
    pub fn anonymous() -> Self {
        Self::new(String::new())
    }

    /// The raw token. Never log this.
    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_empty()
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"***")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

/// A strategy that can produce access tokens.
pub trait TokenSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn fetch_token(&self) -> BoxFuture<'_, LookupResult<Credential>>;
}

/// Environment-bound identity: a token file projected by the platform, or a
/// pre-issued token in the environment.
#[derive(Debug)]
pub struct EnvironmentIdentity {
    token_file: Option<PathBuf>,
    access_token: Option<String>,
}

impl EnvironmentIdentity {
    /// Fails when the environment carries no identity at all.
    pub fn new(token_file: Option<PathBuf>, access_token: Option<String>) -> LookupResult<Self> {
        let access_token = access_token.filter(|t| !t.trim().is_empty());
        if token_file.is_none() && access_token.is_none() {
            return Err(LookupError::auth(
                "no environment identity: neither LOOKUP_TOKEN_FILE nor LOOKUP_ACCESS_TOKEN is set",
            ));
        }
        Ok(Self {
            token_file,
            access_token,
        })
    }
}

impl TokenSource for EnvironmentIdentity {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn fetch_token(&self) -> BoxFuture<'_, LookupResult<Credential>> {
        Box::pin(async move {
            // The projected file wins: platforms rotate it in place.
            if let Some(path) = &self.token_file {
                let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                    LookupError::auth(format!(
                        "failed to read token file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let token = contents.trim();
                if token.is_empty() {
                    return Err(LookupError::auth(format!(
                        "token file {} is empty",
                        path.display()
                    )));
                }
                return Ok(Credential::new(token));
            }
            match &self.access_token {
                Some(token) => Ok(Credential::new(token.trim())),
                None => Err(LookupError::auth("no environment token available")),
            }
        })
    }
}

/// Default identity chain: run a command that prints a token on stdout.
#[derive(Debug)]
pub struct CommandIdentity {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandIdentity {
    pub fn new(command: Option<&str>, timeout: Duration) -> LookupResult<Self> {
        let mut parts = command.unwrap_or_default().split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| LookupError::auth("no fallback identity: LOOKUP_TOKEN_COMMAND is not set"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }
}

impl TokenSource for CommandIdentity {
    fn name(&self) -> &'static str {
        "command"
    }

    fn fetch_token(&self) -> BoxFuture<'_, LookupResult<Credential>> {
        Box::pin(async move {
            let output = tokio::time::timeout(
                self.timeout,
                Command::new(&self.program)
                    .args(&self.args)
                    .kill_on_drop(true)
                    .output(),
            )
            .await
            .map_err(|_| LookupError::timeout("token command", self.timeout.as_secs()))?
            .map_err(|e| LookupError::auth(format!("failed to run {}: {}", self.program, e)))?;

            if !output.status.success() {
                return Err(LookupError::auth(format!(
                    "{} exited with {}",
                    self.program, output.status
                )));
            }

            let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if token.is_empty() {
                return Err(LookupError::auth(format!(
                    "{} printed no token",
                    self.program
                )));
            }
            Ok(Credential::new(token))
        })
    }
}

/// Always yields the same token. Used for `auth_mode = none` and in tests.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn anonymous() -> Self {
        Self(String::new())
    }
}

impl TokenSource for StaticToken {
    fn name(&self) -> &'static str {
        "static"
    }

    fn fetch_token(&self) -> BoxFuture<'_, LookupResult<Credential>> {
        Box::pin(async move { Ok(Credential::new(self.0.clone())) })
    }
}

type SourceFactory = Box<dyn Fn() -> LookupResult<Box<dyn TokenSource>> + Send + Sync>;

/// A strategy built on first use and reused afterwards.
struct LazySource {
    label: &'static str,
    factory: SourceFactory,
    cell: OnceCell<Box<dyn TokenSource>>,
}

impl LazySource {
    fn new(label: &'static str, factory: SourceFactory) -> Self {
        Self {
            label,
            factory,
            cell: OnceCell::new(),
        }
    }

    async fn fetch(&self) -> LookupResult<Credential> {
        // Construction is serialized by the cell; a failed construction is retried next time.
        let source = self
            .cell
            .get_or_try_init(|| async {
                debug!(strategy = self.label, "Initializing credential strategy");
                (self.factory)()
            })
            .await?;
        source.fetch_token().await
    }
}

/// Primary/fallback token provider shared by every pooled connection.
pub struct CredentialProvider {
    primary: LazySource,
    fallback: Option<LazySource>,
}

impl CredentialProvider {
    /// Provider with a primary strategy only.
    pub fn new<F>(primary: F) -> Self
    where
        F: Fn() -> LookupResult<Box<dyn TokenSource>> + Send + Sync + 'static,
    {
        Self {
            primary: LazySource::new("primary", Box::new(primary)),
            fallback: None,
        }
    }

    /// Add a fallback strategy tried when the primary fails.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> LookupResult<Box<dyn TokenSource>> + Send + Sync + 'static,
    {
        self.fallback = Some(LazySource::new("fallback", Box::new(fallback)));
        self
    }

    /// Provider yielding a fixed token.
    pub fn fixed(source: StaticToken) -> Self {
        Self::new(move || Ok(Box::new(source.clone()) as Box<dyn TokenSource>))
    }

    /// Build the provider described by the configuration.
    pub fn from_config(config: &Config) -> Arc<Self> {
        let provider = match config.auth_mode {
            AuthMode::None => Self::fixed(StaticToken::anonymous()),
            AuthMode::Token => {
                let token_file = config.token_file.clone();
                let access_token = config.access_token.clone();
                let command = config.token_command.clone();
                let timeout = config.connect_timeout_duration();
                Self::new(move || {
                    EnvironmentIdentity::new(token_file.clone(), access_token.clone())
                        .map(|s| Box::new(s) as Box<dyn TokenSource>)
                })
                .with_fallback(move || {
                    CommandIdentity::new(command.as_deref(), timeout)
                        .map(|s| Box::new(s) as Box<dyn TokenSource>)
                })
            }
        };
        Arc::new(provider)
    }

    /// Obtain a fresh token, falling back when the primary strategy fails.
    pub async fn token(&self) -> LookupResult<Credential> {
        let primary_err = match self.primary.fetch().await {
            Ok(credential) => return Ok(credential),
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return Err(match primary_err {
                err @ LookupError::AuthUnavailable { .. } => err,
                other => LookupError::auth(other.to_string()),
            });
        };

        warn!(
            error = %primary_err,
            "Primary credential strategy failed, trying fallback"
        );

        fallback.fetch().await.map_err(|fallback_err| {
            LookupError::auth(format!(
                "all credential strategies failed (primary: {}; fallback: {})",
                auth_detail(&primary_err),
                auth_detail(&fallback_err)
            ))
        })
    }
}

/// The underlying reason of an auth failure, without the variant prefix.
fn auth_detail(err: &LookupError) -> String {
    match err {
        LookupError::AuthUnavailable { message } => message.clone(),
        other => other.to_string(),
    }
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("primary_ready", &self.primary.cell.initialized())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
