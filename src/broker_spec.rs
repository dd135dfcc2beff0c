//! [`BrokerSpec`] definition.

/// Identifies one broker instance to connect to: a name for diagnostics, the port to dial, and
/// an optional hostname override (falls back to `REDIS_HOST`, default `localhost`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerSpec {
    name: String,
    port: u16,
    hostname: Option<String>,
}

impl BrokerSpec {
    /// Create a spec for the broker listening on `port`.
    #[must_use]
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            hostname: None,
        }
    }

    /// Override the hostname instead of relying on `REDIS_HOST`/`localhost`.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// This broker's diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port to connect to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The hostname to dial: the explicit override, else `REDIS_HOST`, else `localhost`.
    #[must_use]
    pub fn resolved_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string())
        })
    }
}
