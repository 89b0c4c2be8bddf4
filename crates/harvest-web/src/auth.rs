use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use serde::Deserialize;
use thiserror::Error;

/// Authenticated caller; its id doubles as the job owner id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("unknown bearer token")]
    UnknownToken,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokensYaml {
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    token: String,
    principal: String,
}

/// Static bearer token to principal map, loaded from YAML.
#[derive(Debug, Clone, Default)]
pub struct BearerTokenAuth {
    tokens: HashMap<String, String>,
}

impl BearerTokenAuth {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let parsed: TokensYaml = serde_yaml::from_str(raw).context("parsing tokens yaml")?;
        Ok(Self::new(
            parsed.tokens.into_iter().map(|entry| (entry.token, entry.principal)),
        ))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl AuthProvider for BearerTokenAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;

        self.tokens
            .get(token)
            .map(|id| Principal { id: id.clone() })
            .ok_or(AuthError::UnknownToken)
    }
}
