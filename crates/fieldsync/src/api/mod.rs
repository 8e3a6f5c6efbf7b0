//! Remote field-service API integration
//!
//! This module provides:
//! - Client-credentials authentication with a shared credential cache
//! - An authenticated HTTP client that pages through entity endpoints
//! - The transport seam used by both (ureq in production)

mod auth;
mod client;
mod transport;

pub use auth::{
    ClientCredentialsExchange, Credential, CredentialCache, ISSUANCE_BUFFER_SECS,
    REFRESH_SKEW_SECS, TokenGrant, TokenSource,
};
pub use client::{APP_KEY_HEADER, ApiClient, MAX_AUTH_ATTEMPTS, parse_page};
pub use transport::{HttpReply, HttpTransport, UreqTransport};
