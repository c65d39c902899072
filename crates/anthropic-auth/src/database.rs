//! Local credential database extraction
//!
//! For accounts with `source = database`, credentials live in a local
//! sqlite3 file maintained by an out-of-scope enrollment tool rather than
//! this gateway. Rather than fabricate a sqlite driver dependency for a
//! single read, extraction shells out to the `sqlite3` CLI the same way
//! the tailnet fallback in this codebase shells out to `tailscale status`,
//! bounded by a short timeout since the file may be locked by the writer.

use std::time::Duration;

use tokio::process::Command;

use crate::constants::DATABASE_EXTRACT_TIMEOUT_SECS;
use crate::error::{Error, Result};

/// Extract the access token for `email` from the sqlite3 database at `path`.
///
/// Runs `sqlite3 <path> "select access_token from accounts where email = ?"`
/// out of process, bounded to `DATABASE_EXTRACT_TIMEOUT_SECS`. The query
/// result is expected to be the bare token on a single line.
pub async fn extract_access_token(path: &str, email: &str) -> Result<String> {
    let query = format!(
        "select access_token from accounts where email = '{}' limit 1;",
        email.replace('\'', "''")
    );

    let output = tokio::time::timeout(
        Duration::from_secs(DATABASE_EXTRACT_TIMEOUT_SECS),
        Command::new("sqlite3").arg(path).arg(&query).output(),
    )
    .await
    .map_err(|_| Error::Database(format!("sqlite3 extraction timed out for {email}")))?
    .map_err(|e| Error::Database(format!("failed to spawn sqlite3: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Database(format!("sqlite3 query failed: {stderr}")));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(Error::Database(format!(
            "no credential row found for {email} in {path}"
        )));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_database_file_errors() {
        let result = extract_access_token("/nonexistent/path.db", "a@example.com").await;
        assert!(result.is_err());
    }
}
