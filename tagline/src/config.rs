use std::collections::HashSet;
use std::time::Duration;

use crate::error::Error;
use crate::method::CallType;

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Added to the call deadline to form the pluck timeout, so the engine's
    /// `DEADLINE_EXCEEDED` status normally arrives before the local timer fires.
    pub pluck_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50051,
            pluck_grace: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be > 0".into()));
        }
        Ok(())
    }

    /// `host:port` of the target.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Methods registered with the engine at startup. Calls to these are
    /// accepted with [`Server::accept_registered`](crate::Server::accept_registered).
    pub registered_methods: Vec<(String, CallType)>,
    /// Unregistered method names the server answers. Calls accepted through
    /// [`Server::handle`](crate::Server::handle) for any other name are
    /// finished with `UNIMPLEMENTED`.
    pub unregistered_methods: Vec<String>,
    /// Added to a call's remaining deadline to form the pluck timeout of its
    /// batches.
    pub pluck_grace: Duration,
    /// Upper bound on waiting for the engine to confirm server shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50051,
            registered_methods: Vec::new(),
            unregistered_methods: Vec::new(),
            pluck_grace: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be > 0".into()));
        }
        let mut seen = HashSet::new();
        for (name, call_type) in &self.registered_methods {
            if name.is_empty() {
                return Err(Error::Config("method names must not be empty".into()));
            }
            if *call_type != CallType::Normal {
                return Err(Error::UnsupportedCallType(*call_type));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!("method {name} registered twice")));
            }
        }
        if self.unregistered_methods.iter().any(String::is_empty) {
            return Err(Error::Config("method names must not be empty".into()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(Error::Config("shutdown_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// `host:port` the server binds.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for [`ClientConfig`] with `build()` validation.
///
/// ```rust
/// use std::time::Duration;
/// use tagline::ClientConfigBuilder;
///
/// let config = ClientConfigBuilder::new()
///     .target("localhost", 7000)
///     .pluck_grace(Duration::from_millis(100))
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.target(), "localhost:7000");
/// ```
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    pub fn pluck_grace(mut self, grace: Duration) -> Self {
        self.config.pluck_grace = grace;
        self
    }

    /// Validate and build the final [`ClientConfig`].
    pub fn build(self) -> Result<ClientConfig, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder for [`ServerConfig`] with `build()` validation.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    /// Register a method with the engine at startup.
    pub fn register_method(mut self, name: impl Into<String>, call_type: CallType) -> Self {
        self.config.registered_methods.push((name.into(), call_type));
        self
    }

    /// Answer calls to `name` through the unregistered path.
    pub fn unregistered_method(mut self, name: impl Into<String>) -> Self {
        self.config.unregistered_methods.push(name.into());
        self
    }

    pub fn pluck_grace(mut self, grace: Duration) -> Self {
        self.config.pluck_grace = grace;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Get mutable access to the underlying config.
    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Validate and build the final [`ServerConfig`].
    pub fn build(self) -> Result<ServerConfig, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClientConfig::default().validate().unwrap();
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn builder_rejects_empty_host() {
        let err = ClientConfigBuilder::new().target("", 1).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let err = ServerConfigBuilder::new()
            .register_method("/svc/foo", CallType::Normal)
            .register_method("/svc/foo", CallType::Normal)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn streaming_registration_rejected() {
        let err = ServerConfigBuilder::new()
            .register_method("/svc/stream", CallType::ServerStreaming)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedCallType(CallType::ServerStreaming)));
    }

    #[test]
    fn builder_collects_methods() {
        let config = ServerConfigBuilder::new()
            .bind("localhost", 7001)
            .register_method("/svc/foo", CallType::Normal)
            .unregistered_method("/svc/bar")
            .build()
            .unwrap();
        assert_eq!(config.address(), "localhost:7001");
        assert_eq!(config.registered_methods.len(), 1);
        assert_eq!(config.unregistered_methods, ["/svc/bar"]);
    }
}
