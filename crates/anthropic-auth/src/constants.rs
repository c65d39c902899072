//! Anthropic OAuth / token-resolution constants
//!
//! Browser-based enrollment (PKCE, authorization URLs) is out of scope for
//! this gateway — accounts arrive already enrolled via the Credential Store.
//! What remains in scope is everything the Token Resolver needs to keep an
//! enrolled account's access token and project id fresh.

/// Anthropic's public OAuth client ID (same as Claude CLI). Sent with every
/// refresh-token grant; not a secret, it identifies the client application.
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Token endpoint for refresh-token exchange.
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Required system prompt prefix for Opus/Sonnet access.
/// Anthropic requires this exact string at the start of the system prompt
/// to authorize Claude Code sessions.
pub const REQUIRED_SYSTEM_PROMPT_PREFIX: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

/// How long a resolved access token is trusted before it's re-resolved.
pub const TOKEN_REFRESH_INTERVAL_MILLIS: u64 = 5 * 60 * 1000;

/// Returned when no account-specific project id can be discovered.
pub const DEFAULT_PROJECT_ID: &str = "default-project";

/// Ordered fallback list of project-discovery endpoints. The first
/// well-formed response wins.
pub const PROJECT_DISCOVERY_ENDPOINTS: &[&str] = &[
    "https://api.anthropic.com/v1/me/project",
    "https://console.anthropic.com/api/oauth/me/project",
];

/// Budget for out-of-process `sqlite3` credential extraction (§9).
pub const DATABASE_EXTRACT_TIMEOUT_SECS: u64 = 5;

/// Local credential database consulted for the cold-start fallback account
/// (§4.1) when no credential document exists yet. Resolved relative to
/// `$HOME` to avoid a directory-resolution dependency for one well-known
/// path.
pub const DEFAULT_DATABASE_RELATIVE_PATH: &str = ".claude/credentials.db";

/// Identity assigned to the single account hydrated from that fallback
/// database.
pub const DEFAULT_ACCOUNT_EMAIL: &str = "default@local";
