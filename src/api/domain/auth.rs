use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize)]
pub struct AuthRequest {
    pub id_data: String,
    pub pubkey: String,
    pub tenant_token: String,
}

/// A serialized [`AuthRequest`] together with the signature over exactly these bytes.
#[derive(Debug, Clone)]
pub struct SignedAuthRequest {
    pub body: Vec<u8>,
    pub signature: String,
}

/// Bearer token handed out by the backend after a successful authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Credential(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(***)")
    }
}
