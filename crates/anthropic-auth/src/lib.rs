//! Credential material and token/project resolution for the account pool
//!
//! This crate owns everything the spec calls the Credential Store (§4.1)
//! and the Token Resolver (§4.2): the durable accounts+settings document,
//! refresh-token exchange, local-database extraction, and project
//! discovery. Browser-based OAuth enrollment is out of scope — accounts
//! arrive pre-enrolled in the credential document.

pub mod constants;
pub mod credentials;
pub mod database;
pub mod error;
pub mod project;
pub mod resolver;
pub mod token;

pub use constants::*;
pub use credentials::{
    Account, AccountStats, CredentialMaterial, CredentialSource, CredentialStore, PoolDocument,
    PoolSettings,
};
pub use error::{Error, Result};
pub use resolver::TokenResolver;
pub use token::{TokenResponse, refresh_token};
