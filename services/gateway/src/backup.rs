//! State backups (§6 `POST/GET /api/admin/backup(s)`) — timestamped
//! snapshots of the credential and runtime-config documents, retaining at
//! least the most recent 5.

use std::path::Path;

use serde::Serialize;

const MIN_RETAINED: usize = 5;

#[derive(Debug, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub label: Option<String>,
    pub created_at_millis: u64,
}

/// Snapshot `accounts.json` and `config.json` into a new timestamped
/// directory under `backup_dir`, then prune anything beyond the 5 most
/// recent entries.
pub async fn create_backup(
    backup_dir: &Path,
    credential_store_path: &Path,
    runtime_config_path: &Path,
    label: Option<String>,
) -> std::io::Result<BackupInfo> {
    let now = common::now_millis();
    let dir_name = match &label {
        Some(label) => format!("{now}-{}", sanitize(label)),
        None => now.to_string(),
    };
    let dest = backup_dir.join(&dir_name);
    tokio::fs::create_dir_all(&dest).await?;

    if tokio::fs::metadata(credential_store_path).await.is_ok() {
        tokio::fs::copy(credential_store_path, dest.join("accounts.json")).await?;
    }
    if tokio::fs::metadata(runtime_config_path).await.is_ok() {
        tokio::fs::copy(runtime_config_path, dest.join("config.json")).await?;
    }

    prune(backup_dir).await?;

    Ok(BackupInfo {
        name: dir_name,
        label,
        created_at_millis: now,
    })
}

pub async fn list_backups(backup_dir: &Path) -> std::io::Result<Vec<BackupInfo>> {
    let mut entries = match tokio::fs::read_dir(backup_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut backups = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let (created_at_millis, label) = parse_dir_name(&name);
        backups.push(BackupInfo {
            name,
            label,
            created_at_millis,
        });
    }
    backups.sort_by(|a, b| b.created_at_millis.cmp(&a.created_at_millis));
    Ok(backups)
}

async fn prune(backup_dir: &Path) -> std::io::Result<()> {
    let mut backups = list_backups(backup_dir).await?;
    if backups.len() <= MIN_RETAINED {
        return Ok(());
    }
    backups.sort_by(|a, b| b.created_at_millis.cmp(&a.created_at_millis));
    for stale in backups.split_off(MIN_RETAINED) {
        let _ = tokio::fs::remove_dir_all(backup_dir.join(&stale.name)).await;
    }
    Ok(())
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn parse_dir_name(name: &str) -> (u64, Option<String>) {
    match name.split_once('-') {
        Some((millis_str, label)) if millis_str.chars().all(|c| c.is_ascii_digit()) => {
            (millis_str.parse().unwrap_or(0), Some(label.to_string()))
        }
        _ => (name.parse().unwrap_or(0), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_backup_copies_existing_files() {
        let state_dir = tempfile::tempdir().unwrap();
        let accounts = state_dir.path().join("accounts.json");
        let config = state_dir.path().join("config.json");
        tokio::fs::write(&accounts, b"{}").await.unwrap();
        tokio::fs::write(&config, b"{}").await.unwrap();
        let backup_dir = state_dir.path().join("backups");

        let info = create_backup(&backup_dir, &accounts, &config, Some("pre-migration".into()))
            .await
            .unwrap();

        assert!(backup_dir.join(&info.name).join("accounts.json").exists());
        assert!(backup_dir.join(&info.name).join("config.json").exists());
    }

    #[tokio::test]
    async fn list_backups_returns_empty_when_dir_missing() {
        let state_dir = tempfile::tempdir().unwrap();
        let backups = list_backups(&state_dir.path().join("nope")).await.unwrap();
        assert!(backups.is_empty());
    }

    #[tokio::test]
    async fn prune_retains_only_five_most_recent() {
        let state_dir = tempfile::tempdir().unwrap();
        let accounts = state_dir.path().join("accounts.json");
        tokio::fs::write(&accounts, b"{}").await.unwrap();
        let config = state_dir.path().join("config.json");
        tokio::fs::write(&config, b"{}").await.unwrap();
        let backup_dir = state_dir.path().join("backups");

        for i in 0..8 {
            let dir = backup_dir.join(format!("{i:020}"));
            tokio::fs::create_dir_all(&dir).await.unwrap();
        }
        create_backup(&backup_dir, &accounts, &config, None)
            .await
            .unwrap();

        let remaining = list_backups(&backup_dir).await.unwrap();
        assert_eq!(remaining.len(), MIN_RETAINED);
    }
}
