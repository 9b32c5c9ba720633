//! Configuration for the user agent core
//!
//! [`UserAgentCoreConfig`] is plain serde data apart from the
//! authentication factory, so it can be loaded from JSON and completed in
//! code:
//!
//! ```rust
//! use sipflow_dialog_core::config::{Credentials, UserAgentCoreConfig};
//!
//! let config = UserAgentCoreConfig::builder(
//!     "sip:alice@atlanta.example.com".parse().unwrap(),
//!     "sip:alice@192.0.2.1:5060".parse().unwrap(),
//! )
//! .with_via_host("192.0.2.1:5060")
//! .with_credentials(Credentials::new("alice", "secret"))
//! .build()
//! .unwrap();
//! assert_eq!(config.max_forks, 8);
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use sipflow_sip_core::{NameAddr, Uri};

use crate::errors::{DialogError, DialogResult};
use crate::transaction::timer::TimerSettings;

/// Credentials for digest authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Only answer challenges from this realm when set
    pub realm: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }
}

/// Produces credentials when a request is challenged
pub type AuthenticationFactory = Arc<dyn Fn() -> Option<Credentials> + Send + Sync>;

/// Contact URI of the user agent and its GRUUs (RFC 5627)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactConfig {
    pub uri: Uri,
    #[serde(default)]
    pub pub_gruu: Option<Uri>,
    #[serde(default)]
    pub temp_gruu: Option<Uri>,
}

impl ContactConfig {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            pub_gruu: None,
            temp_gruu: None,
        }
    }

    /// The URIs this user agent answers to besides its AOR
    pub fn uris(&self) -> impl Iterator<Item = &Uri> {
        std::iter::once(&self.uri)
            .chain(self.pub_gruu.as_ref())
            .chain(self.temp_gruu.as_ref())
    }
}

fn default_option_tags() -> Vec<String> {
    vec!["100rel".to_string()]
}

fn default_user_agent() -> String {
    format!("sipflow/{}", env!("CARGO_PKG_VERSION"))
}

fn default_via_transport() -> String {
    "UDP".to_string()
}

fn default_max_forks() -> usize {
    8
}

/// Configuration of a [`UserAgentCore`](crate::core::UserAgentCore)
#[derive(Clone, Serialize, Deserialize)]
pub struct UserAgentCoreConfig {
    /// Address of record
    pub aor: Uri,

    pub contact: ContactConfig,

    /// Preloaded Route set for out-of-dialog requests
    #[serde(default)]
    pub route_set: Vec<NameAddr>,

    /// Option tags advertised in `Supported`
    #[serde(default = "default_option_tags")]
    pub supported_option_tags: Vec<String>,

    /// Source of credentials for 401/407 challenges
    #[serde(skip)]
    pub authentication_factory: Option<AuthenticationFactory>,

    /// `User-Agent` and `Server` header value
    #[serde(default = "default_user_agent")]
    pub user_agent_string: String,

    /// `host[:port]` placed in our Via headers
    pub via_host: String,

    #[serde(default = "default_via_transport")]
    pub via_transport: String,

    /// Whether the transport is reliable (disables retransmissions)
    #[serde(default)]
    pub reliable_transport: bool,

    #[serde(default)]
    pub timers: TimerSettings,

    /// Upper bound on the 2xx responses (distinct To-tags) accepted for
    /// one INVITE. Further branches are acknowledged and released.
    #[serde(default = "default_max_forks")]
    pub max_forks: usize,
}

impl fmt::Debug for UserAgentCoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAgentCoreConfig")
            .field("aor", &self.aor)
            .field("contact", &self.contact)
            .field("route_set", &self.route_set)
            .field("supported_option_tags", &self.supported_option_tags)
            .field("authentication_factory", &self.authentication_factory.is_some())
            .field("user_agent_string", &self.user_agent_string)
            .field("via_host", &self.via_host)
            .field("via_transport", &self.via_transport)
            .field("reliable_transport", &self.reliable_transport)
            .field("timers", &self.timers)
            .field("max_forks", &self.max_forks)
            .finish()
    }
}

impl UserAgentCoreConfig {
    /// Builder with defaults for everything but the AOR and contact
    pub fn builder(aor: Uri, contact: Uri) -> UserAgentCoreConfigBuilder {
        let via_host = contact.host_port();
        UserAgentCoreConfigBuilder {
            config: UserAgentCoreConfig {
                aor,
                contact: ContactConfig::new(contact),
                route_set: Vec::new(),
                supported_option_tags: default_option_tags(),
                authentication_factory: None,
                user_agent_string: default_user_agent(),
                via_host,
                via_transport: default_via_transport(),
                reliable_transport: false,
                timers: TimerSettings::default(),
                max_forks: default_max_forks(),
            },
        }
    }

    /// Parses and validates a JSON configuration
    pub fn from_json(json: &str) -> DialogResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DialogError::configuration(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DialogResult<()> {
        if !self.aor.is_sip() {
            return Err(DialogError::configuration(format!("AOR {} is not a SIP URI", self.aor)));
        }
        if let Some(uri) = self.contact.uris().find(|u| !u.is_sip()) {
            return Err(DialogError::configuration(format!("contact {} is not a SIP URI", uri)));
        }
        if self.via_host.trim().is_empty() {
            return Err(DialogError::configuration("via_host must not be empty"));
        }
        if self.via_transport.trim().is_empty() {
            return Err(DialogError::configuration("via_transport must not be empty"));
        }
        if self.max_forks == 0 {
            return Err(DialogError::configuration("max_forks must be at least 1"));
        }
        self.timers.validate().map_err(DialogError::configuration)
    }

    /// Credentials from the authentication factory, if any
    pub fn credentials(&self) -> Option<Credentials> {
        self.authentication_factory.as_ref().and_then(|factory| factory())
    }

    pub fn supports(&self, option_tag: &str) -> bool {
        self.supported_option_tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(option_tag))
    }
}

/// Builder for [`UserAgentCoreConfig`]
#[derive(Debug)]
pub struct UserAgentCoreConfigBuilder {
    config: UserAgentCoreConfig,
}

impl UserAgentCoreConfigBuilder {
    pub fn with_gruus(mut self, pub_gruu: Option<Uri>, temp_gruu: Option<Uri>) -> Self {
        self.config.contact.pub_gruu = pub_gruu;
        self.config.contact.temp_gruu = temp_gruu;
        self
    }

    pub fn with_route_set(mut self, route_set: Vec<NameAddr>) -> Self {
        self.config.route_set = route_set;
        self
    }

    pub fn with_supported_option_tags(mut self, tags: Vec<String>) -> Self {
        self.config.supported_option_tags = tags;
        self
    }

    pub fn with_authentication_factory(
        mut self,
        factory: impl Fn() -> Option<Credentials> + Send + Sync + 'static,
    ) -> Self {
        self.config.authentication_factory = Some(Arc::new(factory));
        self
    }

    /// Always answers challenges with `credentials`
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.with_authentication_factory(move || Some(credentials.clone()))
    }

    pub fn with_user_agent_string(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent_string = user_agent.into();
        self
    }

    pub fn with_via_host(mut self, via_host: impl Into<String>) -> Self {
        self.config.via_host = via_host.into();
        self
    }

    pub fn with_via_transport(mut self, transport: impl Into<String>) -> Self {
        self.config.via_transport = transport.into();
        self
    }

    pub fn with_reliable_transport(mut self, reliable: bool) -> Self {
        self.config.reliable_transport = reliable;
        self
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.config.timers = timers;
        self
    }

    pub fn with_max_forks(mut self, max_forks: usize) -> Self {
        self.config.max_forks = max_forks;
        self
    }

    pub fn build(self) -> DialogResult<UserAgentCoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
