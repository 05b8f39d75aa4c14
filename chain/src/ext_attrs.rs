//! External proposal attributes (owner, title) from a governance web service.
//!
//! The on-chain record only carries a short name and a URL; community
//! services expose richer metadata per proposal hash. These fetches are the
//! one place the engine retries internally: the endpoints are flaky in ways
//! the RPC transport is not, and a couple of immediate retries clear most
//! transient failures.

use govsync_types::ProposalHash;
use serde::Deserialize;
use tracing::{error, info};

use crate::error::ChainError;

/// Attributes a proposal metadata service may supply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtAttributes {
    pub owner: Option<String>,
    pub title: Option<String>,
}

/// Source of external proposal attributes.
///
/// `Ok(None)` means the service answered but has nothing for this proposal;
/// callers mark the proposal as loaded so it is not asked about again.
pub trait ExtAttributeSource: Send + Sync {
    fn fetch(&self, hash: &ProposalHash) -> Result<Option<ExtAttributes>, ChainError>;
}

#[derive(Debug, Deserialize)]
struct AttributeDocument {
    proposal: Option<ProposalAttributes>,
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProposalAttributes {
    owner_username: Option<String>,
    title: Option<String>,
}

/// HTTP implementation over a URL template with a `%HASH%` placeholder.
pub struct HttpAttributeSource {
    client: reqwest::blocking::Client,
    url_template: String,
    retries: u32,
}

impl HttpAttributeSource {
    pub fn new(url_template: impl Into<String>, retries: u32) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            url_template: url_template.into(),
            retries,
        }
    }

    fn fetch_document(&self, url: &str) -> Result<AttributeDocument, ChainError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| ChainError::Network(e.to_string()))?;
        response
            .json::<AttributeDocument>()
            .map_err(|e| ChainError::Malformed(e.to_string()))
    }
}

impl ExtAttributeSource for HttpAttributeSource {
    fn fetch(&self, hash: &ProposalHash) -> Result<Option<ExtAttributes>, ChainError> {
        let url = self.url_template.replace("%HASH%", &hash.to_string());

        let mut attempt = 0;
        let document = loop {
            match self.fetch_document(&url) {
                Ok(doc) => break doc,
                Err(ChainError::Network(msg)) if attempt < self.retries => {
                    attempt += 1;
                    info!(attempt, error = %msg, "attribute fetch failed, retrying");
                }
                Err(e) => return Err(e),
            }
        };

        match document.proposal {
            Some(attrs) => Ok(Some(ExtAttributes {
                owner: attrs.owner_username,
                title: attrs.title,
            })),
            None => {
                match document.error_type {
                    Some(err) => error!(proposal = %hash, error = %err, "attribute service error"),
                    None => error!(proposal = %hash, "attribute service returned no proposal"),
                }
                Ok(None)
            }
        }
    }
}
