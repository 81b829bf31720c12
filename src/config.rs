//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::Path,
    time::Duration,
};

use chrono::NaiveDate;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::oauth::AuthorizationServerMetadata;
use crate::policy::MethodScopes;
use crate::{Error, Result};

/// Environment prefix for configuration overrides (`MCP_AUTH_PROXY_SERVER__PORT=9000`)
pub const ENV_PREFIX: &str = "MCP_AUTH_PROXY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// MCP backend configuration
    pub backend: BackendConfig,
    /// Authorization server configuration
    pub auth_server: AuthServerConfig,
    /// Protected resource (this proxy) configuration
    pub resource: ResourceConfig,
    /// CORS allow-lists
    pub cors: CorsConfig,
    /// Required scopes keyed by JSON-RPC method or namespace (`"*"` = wildcard)
    pub required_scopes: HashMap<String, MethodScopes>,
    /// Supervised stdio backend
    pub command: CommandConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |_| {})
    }

    /// Like [`Config::load`], running `overrides` before defaults are
    /// derived and the result is validated
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_with(path: Option<&Path>, overrides: impl FnOnce(&mut Self)) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        overrides(&mut config);
        config.load_env_files();
        config.expand_env_vars()?;
        config.apply_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secret-bearing values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let managed = &mut self.auth_server.managed;
        managed.client_id = expand_string(&re, &managed.client_id);
        managed.client_secret = expand_string(&re, &managed.client_secret);

        for entry in &mut self.command.env {
            *entry = expand_string(&re, entry);
        }
        for params in self.auth_server.paths.values_mut() {
            for value in params
                .add_query_params
                .values_mut()
                .chain(params.add_body_params.values_mut())
            {
                if let serde_json::Value::String(s) = value {
                    *s = expand_string(&re, s);
                }
            }
        }
        Ok(())
    }

    /// Fill values that depend on other sections
    pub fn apply_defaults(&mut self) {
        if self.backend.base_url.is_empty() {
            self.backend.base_url = format!("http://localhost:{}", self.command.port);
        }
        if self.resource.identifier.is_empty() {
            self.resource.identifier = format!("http://localhost:{}", self.server.port);
        }
        if self.resource.audience.is_empty() {
            self.resource.audience.clone_from(&self.resource.identifier);
        }

        if self.auth_server.mode == ProviderMode::Managed {
            let tenant = self.auth_server.managed.tenant_url.trim_end_matches('/');
            if !tenant.is_empty() {
                if self.auth_server.base_url.is_empty() {
                    self.auth_server.base_url = format!("{tenant}/oauth2");
                }
                if self.auth_server.jwks_url.is_empty() {
                    self.auth_server.jwks_url = format!("{tenant}/oauth2/jwks");
                }
            }
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        parse_base_url("backend.base_url", &self.backend.base_url)?;
        if !self.auth_server.base_url.is_empty() {
            parse_base_url("auth_server.base_url", &self.auth_server.base_url)?;
        }
        if self.auth_server.mode == ProviderMode::Managed
            && self.auth_server.managed.tenant_url.is_empty()
        {
            return Err(Error::Config(
                "auth_server.managed.tenant_url is required in managed mode".to_string(),
            ));
        }

        let paths = &self.backend.paths;
        for (name, path) in [("sse", &paths.sse), ("messages", &paths.messages)] {
            check_path(&format!("backend.paths.{name}"), path)?;
        }
        if let Some(path) = &paths.streamable_http {
            check_path("backend.paths.streamable_http", path)?;
        }
        for (from, to) in &self.backend.path_mapping {
            check_path("backend.path_mapping key", from)?;
            check_path("backend.path_mapping value", to)?;
        }

        if self.command.enabled && self.command.user_command.trim().is_empty() {
            return Err(Error::Config(
                "command.user_command is required when command.enabled is true".to_string(),
            ));
        }
        Ok(())
    }

    /// Public resource identifier used in `WWW-Authenticate` challenges
    #[must_use]
    pub fn resource_metadata_url(&self) -> String {
        format!(
            "{}/.well-known/oauth-protected-resource",
            self.resource.identifier.trim_end_matches('/')
        )
    }
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Parse a backend URL, rejecting anything that cannot be proxied to
///
/// # Errors
///
/// Returns [`Error::Config`] if the URL is unparseable or has no host.
pub fn parse_base_url(field: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value).map_err(|e| Error::Config(format!("{field}: {value}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::Config(format!(
            "{field}: {value}: expected an http(s) URL with a host"
        )));
    }
    Ok(url)
}

fn check_path(field: &str, path: &str) -> Result<()> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(Error::Config(format!("{field}: {path:?} must start with '/'")))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Deadline for non-streaming proxied requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Time allowed for in-flight requests to drain on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Largest request body buffered for inspection or modification
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// MCP backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend base URL (defaults to the supervised process when empty)
    pub base_url: String,
    /// MCP path names
    pub paths: PathsConfig,
    /// Additional MCP paths, rewritten to the mapped backend path
    pub path_mapping: HashMap<String, String>,
}

/// MCP path names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SSE stream path
    pub sse: String,
    /// Message POST path
    pub messages: String,
    /// Streamable HTTP endpoint, if the backend speaks it
    pub streamable_http: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sse: "/sse".to_string(),
            messages: "/messages".to_string(),
            streamable_http: None,
        }
    }
}

/// How the authorization server is fronted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Proxy to a standards-compliant authorization server
    #[default]
    Default,
    /// Serve metadata locally and register clients through a vendor API
    Managed,
}

/// Authorization server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthServerConfig {
    /// Provider mode
    pub mode: ProviderMode,
    /// Authorization server base URL
    pub base_url: String,
    /// JWKS endpoint used to verify bearer tokens
    pub jwks_url: String,
    /// Background refetch interval for the key set (0 = never)
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    /// Prefix reserved for provider-specific user flows
    pub user_path_prefix: String,
    /// Per-path overrides for auth-plane requests
    pub paths: HashMap<String, PathConfig>,
    /// Managed provider credentials
    pub managed: ManagedProviderConfig,
}

impl Default for AuthServerConfig {
    fn default() -> Self {
        Self {
            mode: ProviderMode::Default,
            base_url: String::new(),
            jwks_url: String::new(),
            jwks_refresh_interval: Duration::ZERO,
            user_path_prefix: "/u/".to_string(),
            paths: HashMap::new(),
            managed: ManagedProviderConfig::default(),
        }
    }
}

/// Per-path auth-plane overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PathConfig {
    /// Serve this document locally instead of proxying; empty endpoints
    /// default to the proxy's own public base URL
    pub response: Option<AuthorizationServerMetadata>,
    /// Query parameters merged into the request
    #[serde(alias = "addQueryParams")]
    pub add_query_params: BTreeMap<String, serde_json::Value>,
    /// Body parameters merged into form or JSON bodies
    #[serde(alias = "addBodyParams")]
    pub add_body_params: BTreeMap<String, serde_json::Value>,
}

/// Managed identity provider credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ManagedProviderConfig {
    /// Tenant base URL (`https://idp.example.com/t/acme`)
    pub tenant_url: String,
    /// Admin client id (supports `${VAR}`)
    pub client_id: String,
    /// Admin client secret (supports `${VAR}`)
    pub client_secret: String,
}

/// Protected resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Public resource identifier of this proxy
    pub identifier: String,
    /// Required `aud` value (defaults to `identifier`)
    pub audience: String,
    /// Scopes advertised in the protected resource metadata
    pub scopes_supported: Vec<String>,
    /// Authorization servers advertised (defaults to the proxy itself)
    pub authorization_servers: Vec<String>,
    /// JWKS URI advertised
    pub jwks_uri: Option<String>,
    /// Bearer token delivery methods advertised
    pub bearer_methods_supported: Vec<String>,
    /// Protocol versions on or after this date get audience and scope enforcement
    pub protocol_cutover: NaiveDate,
    /// Treat a missing or unparseable `MCP-Protocol-Version` as legacy
    pub downgrade_without_version: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            audience: String::new(),
            scopes_supported: Vec::new(),
            authorization_servers: Vec::new(),
            jwks_uri: None,
            bearer_methods_supported: vec!["header".to_string()],
            protocol_cutover: default_protocol_cutover(),
            downgrade_without_version: true,
        }
    }
}

/// First protocol revision that requires audience-bound tokens
#[must_use]
pub fn default_protocol_cutover() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 26).unwrap_or_default()
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Exact-match origin allow-list
    pub allowed_origins: Vec<String>,
    /// Methods advertised to browsers
    pub allowed_methods: Vec<String>,
    /// Request headers advertised to browsers
    pub allowed_headers: Vec<String>,
    /// Emit `Access-Control-Allow-Credentials: true`
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_headers: [
                "Authorization",
                "Content-Type",
                "mcp-protocol-version",
                "mcp-session-id",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allow_credentials: false,
        }
    }
}

/// Supervised stdio backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Launch the backend at startup
    pub enabled: bool,
    /// stdio MCP server command line
    pub user_command: String,
    /// Working directory for the process
    pub work_dir: Option<String>,
    /// Extra arguments appended to `user_command`
    pub args: Vec<String>,
    /// Extra environment, `KEY=VALUE`
    pub env: Vec<String>,
    /// Port the bridge listens on
    pub port: u16,
    /// Warn about missing launch tools before starting
    pub check_dependencies: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_command: String::new(),
            work_dir: None,
            args: Vec::new(),
            env: Vec::new(),
            port: 8000,
            check_dependencies: true,
        }
    }
}

impl CommandConfig {
    /// Shell command line bridging the stdio server to SSE on `self.port`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an argument cannot be shell-quoted.
    pub fn shell_command(&self, base_url: &str, paths: &PathsConfig) -> Result<String> {
        let mut stdio = self.user_command.trim().to_string();
        for arg in &self.args {
            let quoted = shlex::try_quote(arg)
                .map_err(|e| Error::Config(format!("command.args: {arg:?}: {e}")))?;
            stdio.push(' ');
            stdio.push_str(&quoted);
        }
        let stdio = shlex::try_quote(&stdio)
            .map_err(|e| Error::Config(format!("command.user_command: {e}")))?;

        let quote = |field: &str, value: &str| {
            shlex::try_quote(value)
                .map(|quoted| quoted.into_owned())
                .map_err(|e| Error::Config(format!("{field}: {e}")))
        };
        Ok(format!(
            "npx -y supergateway --stdio {stdio} --port {} --baseUrl {} --ssePath {} --messagePath {}",
            self.port,
            quote("backend.base_url", base_url)?,
            quote("backend.paths.sse", &paths.sse)?,
            quote("backend.paths.messages", &paths.messages)?,
        ))
    }

    /// Parsed `KEY=VALUE` environment entries; malformed entries are skipped
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| {
            let pair = entry.split_once('=');
            if pair.is_none() {
                tracing::warn!(entry = %entry, "Ignoring malformed command.env entry");
            }
            pair
        })
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
