//! Upstream adapter: error taxonomy + request preparation
//!
//! Narrowed from a pluggable multi-provider abstraction to the single
//! built-in upstream this gateway fronts (Non-goals: "arbitrary provider
//! plug-ins beyond the single built-in upstream"). What remains is the
//! closed error taxonomy that feeds the account pool's learning loop, and
//! the header/body preparation boundary the request pipeline calls as an
//! opaque step before dispatching to the upstream.

pub mod error;
pub mod upstream;

pub use error::{ErrorTaxonomy, PoolAction, classify_upstream_error, parse_cooldown};
