use std::fmt;

/// SASL credentials presented when opening a broker connection
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach the cluster
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub endpoints: Vec<String>,
    pub client_id: String,
    pub tls: bool,
    /// `None` disables SASL
    pub credentials: Option<Credentials>,
}

impl BrokerConfig {
    pub fn new(endpoints: Vec<String>, client_id: impl Into<String>) -> Self {
        Self {
            endpoints,
            client_id: client_id.into(),
            tls: false,
            credentials: None,
        }
    }

    /// TLS + SASL/PLAIN, the way production clusters are reached.
    pub fn with_sasl(mut self, credentials: Credentials) -> Self {
        self.tls = true;
        self.credentials = Some(credentials);
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }
}
