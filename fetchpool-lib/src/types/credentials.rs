use secrecy::{ExposeSecret, SecretString};

/// Username and password attached to fetchers as basic auth credentials.
///
/// The password is kept in a [`SecretString`] so it never shows up in
/// `Debug` output or logs.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Basic auth username
    pub username: String,

    /// Basic auth password
    pub password: SecretString,
}

impl Credential {
    /// Create a new credential
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The password in clear text, for handing it to the transport
    #[must_use]
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username && self.expose_password() == other.expose_password()
    }
}

impl Eq for Credential {}
