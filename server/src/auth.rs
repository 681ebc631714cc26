//! Connection-open authentication.
//!
//! The validator inspects the upgrade request's headers and query
//! parameters; a `false` verdict closes the connection with
//! `UNAUTHORIZED` before it is ever registered.

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::HashMap;

use crate::config::AuthConfig;

pub enum Authenticator {
    /// Every connection is accepted.
    Noauth,
    /// `Authorization: Bearer <token>` must match the configured token.
    Bearer { token: String },
    /// `Authorization: Basic <credentials>` against the configured pair.
    Basic { credentials: String },
    /// A cookie with the configured name and value must be present.
    Cookie { name: String, value: String },
    /// Delegate the verdict to an external endpoint; 2xx accepts.
    Remote { url: String, client: reqwest::Client },
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        match config.auth_type.as_str() {
            "" | "none" | "noauth" => Self::Noauth,
            "bearer" => {
                let token = config.token.clone().unwrap_or_default();
                if token.is_empty() {
                    tracing::warn!("bearer auth configured without a token; all connections will be rejected");
                }
                Self::Bearer { token }
            }
            "basic" => {
                let user = config.user.clone().unwrap_or_default();
                let password = config.password.clone().unwrap_or_default();
                let encoded = STANDARD.encode(format!("{}:{}", user, password));
                Self::Basic {
                    credentials: format!("Basic {}", encoded),
                }
            }
            "cookie" => Self::Cookie {
                name: config.cookie_name.clone().unwrap_or_default(),
                value: config.cookie_value.clone().unwrap_or_default(),
            },
            "remote" => Self::Remote {
                url: config.url.clone().unwrap_or_default(),
                client: reqwest::Client::new(),
            },
            other => {
                tracing::warn!(auth_type = other, "unknown auth type, falling back to noauth");
                Self::Noauth
            }
        }
    }

    pub async fn validate(&self, headers: &HeaderMap, _params: &HashMap<String, String>) -> bool {
        match self {
            Self::Noauth => true,
            Self::Bearer { token } => {
                !token.is_empty()
                    && header_value(headers, header::AUTHORIZATION)
                        .map(|v| v == format!("Bearer {}", token))
                        .unwrap_or(false)
            }
            Self::Basic { credentials } => header_value(headers, header::AUTHORIZATION)
                .map(|v| v == *credentials)
                .unwrap_or(false),
            Self::Cookie { name, value } => header_value(headers, header::COOKIE)
                .map(|cookies| {
                    cookies
                        .split(';')
                        .any(|pair| pair.trim() == format!("{}={}", name, value))
                })
                .unwrap_or(false),
            Self::Remote { url, client } => {
                let mut request = client.get(url);
                if let Some(authorization) = headers.get(header::AUTHORIZATION) {
                    request = request.header(header::AUTHORIZATION, authorization.clone());
                }
                match request.send().await {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        tracing::warn!(error = %e, "remote auth endpoint unreachable, rejecting");
                        false
                    }
                }
            }
        }
    }
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
