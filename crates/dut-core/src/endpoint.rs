//! Endpoint identity and SSH credentials.

use std::path::{Path, PathBuf};

/// Identity of one reachable remote API surface.
///
/// `host`/`port` address the SSH side of the tunnel; `socket_path` is the
/// control socket on the remote host (or a locally reachable socket for
/// direct sessions). Used as the connection-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub socket_path: PathBuf,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.socket_path.display())
    }
}

/// SSH login material for the tunnel.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub auth: Auth,
}

/// How the tunnel authenticates.
#[derive(Clone)]
pub enum Auth {
    /// Private key contents (PEM). Written to a transient file that is
    /// deleted as soon as the forward is up.
    Key(String),
    /// Password, supplied to the forward through a password helper.
    Password(String),
}

impl Credentials {
    pub fn with_key(username: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth: Auth::Key(key_pem.into()),
        }
    }

    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            auth: Auth::Password(password.into()),
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match self.auth {
            Auth::Key(_) => "Key(<redacted>)",
            Auth::Password(_) => "Password(<redacted>)",
        };
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("auth", &auth)
            .finish()
    }
}
