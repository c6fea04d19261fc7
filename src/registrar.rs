use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::keys::PublicEce;
use crate::protocol::Identity;
use crate::store::{Acg, Credential};

/// What the registrar is given: the app identity plus the public half of the
/// key material the backend should encrypt for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationRequest {
    #[serde(flatten)]
    pub identity: Identity,
    pub ece: EceRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EceRequest {
    #[serde(rename = "authSecret")]
    pub auth_secret: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

impl RegistrationRequest {
    pub fn new(identity: Identity, ece: PublicEce) -> Self {
        Self {
            identity,
            ece: EceRequest {
                auth_secret: ece.auth_secret,
                public_key: ece.public_key,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("registrar unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("registrar rejected registration (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("registrar returned an unreadable response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Other(String),
}

/// Issues credentials for an identity. A network call that may fail.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, request: RegistrationRequest) -> Result<Credential, RegistrarError>;
}

/// Registrar reached over HTTP/JSON: `POST {endpoint}` with the request body,
/// answered with `{token, acg: {id, securityToken}}`.
pub struct HttpRegistrar {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRegistrar {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, RegistrarError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(RegistrarError::Unreachable)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, request: RegistrationRequest) -> Result<Credential, RegistrarError> {
        tracing::debug!(endpoint = %self.endpoint, app_id = %request.identity.app_id, "registering");

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(RegistrarError::Unreachable)?;

        let status = resp.status();
        let body = resp.text().await.map_err(RegistrarError::Unreachable)?;
        if !status.is_success() {
            return Err(RegistrarError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        let wire: WireCredential = serde_json::from_str(&body)
            .map_err(|e| RegistrarError::InvalidResponse(e.to_string()))?;
        if wire.token.is_empty() {
            return Err(RegistrarError::InvalidResponse("empty token".into()));
        }
        Ok(wire.into())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[derive(Deserialize)]
struct WireCredential {
    token: String,
    acg: WireAcg,
}

#[derive(Deserialize)]
struct WireAcg {
    #[serde(deserialize_with = "decimal_u128")]
    id: u128,
    #[serde(rename = "securityToken", deserialize_with = "decimal_u128")]
    security_token: u128,
}

impl From<WireCredential> for Credential {
    fn from(wire: WireCredential) -> Self {
        Self {
            token: wire.token,
            acg: Acg {
                id: wire.acg.id,
                security_token: wire.acg.security_token,
            },
        }
    }
}

/// Identifiers arrive either as decimal strings or as JSON integers.
fn decimal_u128<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;

    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u128;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("an unsigned integer or a decimal string")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(v as u128)
        }

        fn visit_u128<E: serde::de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u128, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid decimal identifier {:?}", v)))
        }
    }

    deserializer.deserialize_any(Visitor)
}
