//! Resolution of an action's `credential_ref` into a bearer token.

use std::collections::HashMap;
use std::fmt;

/// An opaque bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

pub trait CredentialResolver: Send + Sync {
    /// `None` means the reference is unknown; the action cannot proceed.
    fn resolve(&self, reference: &str) -> Option<Credential>;
}

/// Reads `CLOUDOPS_CREDENTIAL_<REF>` where `<REF>` is the reference
/// uppercased with every non-alphanumeric character replaced by `_`.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn var_name(reference: &str) -> String {
        let suffix: String = reference
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("CLOUDOPS_CREDENTIAL_{suffix}")
    }
}

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, reference: &str) -> Option<Credential> {
        std::env::var(Self::var_name(reference))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(Credential::new)
    }
}

/// Fixed reference → token map.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(reference.into(), token.into());
        self
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, reference: &str) -> Option<Credential> {
        self.tokens.get(reference).cloned().map(Credential::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_name_is_normalised() {
        assert_eq!(
            EnvCredentials::var_name("shop-prod.eu"),
            "CLOUDOPS_CREDENTIAL_SHOP_PROD_EU"
        );
    }

    #[test]
    fn env_credentials_reads_variable() {
        std::env::set_var("CLOUDOPS_CREDENTIAL_UNIT_TEST_REF", "tok-123");
        let cred = EnvCredentials.resolve("unit-test-ref").unwrap();
        assert_eq!(cred.token(), "tok-123");
        assert!(EnvCredentials.resolve("unit-test-missing").is_none());
    }

    #[test]
    fn debug_hides_token() {
        let cred = Credential::new("secret");
        assert_eq!(format!("{cred:?}"), "Credential(***)");
    }

    #[test]
    fn static_credentials_lookup() {
        let creds = StaticCredentials::new().with("a", "t1");
        assert_eq!(creds.resolve("a").unwrap().token(), "t1");
        assert!(creds.resolve("b").is_none());
    }
}
