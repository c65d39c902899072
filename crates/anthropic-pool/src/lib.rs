//! Account Pool (§4.3) — health-scored, sticky-selecting credential pool
//!
//! The pool holds no credential material itself; it operates on the
//! `anthropic-auth` `CredentialStore` and layers the selection policy,
//! health scoring, and failure bookkeeping on top of it.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{PickResult, Pool};
