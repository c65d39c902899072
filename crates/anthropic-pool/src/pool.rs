//! Account Pool selection policy (§4.3) — the heart of the system
//!
//! Selection is driven by four layered rules: an affinity lock that pins
//! requests to the most recently used account for upstream prompt-cache
//! locality, a sticky-current check, a wait-versus-switch decision for a
//! rate-limited current account, and a health-score-ranked pick among the
//! available accounts. The credential document is the single source of
//! truth; the affinity anchor (`lastUsedAccount`/`lastUsedAt`) is pool-only
//! runtime state that does not survive a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anthropic_auth::credentials::{Account, PoolDocument};
use anthropic_auth::CredentialStore;
use provider::PoolAction;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Affinity lock window (§4.3 Rule 1). Not configurable in the original —
/// the spec's §9 open question calls this out explicitly, so it's exposed
/// here as a constructor parameter rather than hardcoded.
pub const DEFAULT_TIME_WINDOW_LOCK_MS: u64 = 60_000;

/// Below this remaining cooldown, waiting beats switching accounts.
pub const SHORT_WAIT_THRESHOLD_MS: u64 = 10_000;

/// Above this remaining cooldown, don't wait at all — switch or fail fast.
pub const MAX_WAIT_BEFORE_ERROR_MS: u64 = 60_000;

/// Outcome of a selection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PickResult {
    /// An available account to use for this request.
    Account(Account),
    /// No account ready yet; sleep this many ms and call again.
    Wait { ms: u64 },
    /// Pool has accounts but none are available and none are worth waiting
    /// for — pipeline surfaces this as `overloaded_error`.
    Exhausted,
    /// Pool has zero accounts — pipeline surfaces this as
    /// `authentication_error` (§8 boundary behavior).
    Empty,
}

/// In-memory affinity anchor: the account + timestamp of the last
/// `pickStickyAccount` call that actually returned an account.
struct Anchor {
    email: RwLock<Option<String>>,
    at: AtomicU64,
}

impl Anchor {
    fn new() -> Self {
        Self {
            email: RwLock::new(None),
            at: AtomicU64::new(0),
        }
    }
}

/// The Account Pool.
pub struct Pool {
    store: Arc<CredentialStore>,
    anchor: Anchor,
    time_window_lock_ms: u64,
}

impl Pool {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            store,
            anchor: Anchor::new(),
            time_window_lock_ms: DEFAULT_TIME_WINDOW_LOCK_MS,
        }
    }

    /// Override the affinity lock window (§9 open question: make it
    /// configurable rather than hardcoded).
    pub fn with_time_window_lock_ms(mut self, ms: u64) -> Self {
        self.time_window_lock_ms = ms;
        self
    }

    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// §4.3 — the four-rule selection policy.
    pub async fn pick_sticky_account(&self) -> PickResult {
        let now = common::now_millis();
        let anchor_email = self.anchor.email.read().await.clone();
        let anchor_at = self.anchor.at.load(Ordering::Acquire);

        let (result, new_anchor) = self
            .store
            .mutate(|doc| {
                if doc.accounts.is_empty() {
                    return (PickResult::Empty, None);
                }
                clear_expired(doc, now);
                decide(doc, anchor_email.as_deref(), anchor_at, now, self.time_window_lock_ms)
            })
            .await;

        if let Some(email) = new_anchor {
            *self.anchor.email.write().await = Some(email);
            self.anchor.at.store(now, Ordering::Release);
        }

        result
    }

    /// §4.3 "Optimistic reset": if every account is currently rate-limited,
    /// clear all cooldowns so the next call probes the upstream directly.
    pub async fn reset_all_rate_limits_if_exhausted(&self) {
        let now = common::now_millis();
        let reset = self
            .store
            .mutate(|doc| {
                if doc.accounts.is_empty() {
                    return false;
                }
                let all_limited = doc.accounts.iter().all(|a| a.is_rate_limited);
                if !all_limited {
                    return false;
                }
                let cooldown_ms = doc.settings.cooldown_duration_ms;
                for account in &mut doc.accounts {
                    account.is_rate_limited = false;
                    account.rate_limit_reset_time = None;
                    rescore(account, now, cooldown_ms);
                }
                recompute_recommended(doc);
                true
            })
            .await;
        if reset {
            info!("optimistic reset: cleared all account cooldowns");
        }
    }

    /// §4.3 `recordSuccess`.
    pub async fn record_success(&self, email: &str) {
        self.store
            .mutate(|doc| {
                let cooldown_ms = doc.settings.cooldown_duration_ms;
                if let Some(account) = find_mut(doc, email) {
                    account.stats.success_count += 1;
                    account.stats.last_success_at = Some(common::now_millis());
                    account.is_rate_limited = false;
                    account.rate_limit_reset_time = None;
                    account.is_invalid = false;
                    account.invalid_reason = None;
                    rescore(account, common::now_millis(), cooldown_ms);
                }
                recompute_recommended(doc);
            })
            .await;
    }

    /// §4.3 `markRateLimited`.
    pub async fn mark_rate_limited(&self, email: &str, cooldown_ms: Option<u64>) {
        let now = common::now_millis();
        self.store
            .mutate(|doc| {
                let default_cooldown = doc.settings.cooldown_duration_ms;
                if let Some(account) = find_mut(doc, email) {
                    let cooldown = cooldown_ms.unwrap_or(default_cooldown);
                    account.is_rate_limited = true;
                    account.rate_limit_reset_time = Some(now + cooldown);
                    account.stats.error_count += 1;
                    account.stats.last_failure_at = Some(now);
                    rescore(account, now, default_cooldown);
                    info!(email, cooldown_ms = cooldown, "account entering cooldown");
                }
                recompute_recommended(doc);
            })
            .await;
    }

    /// §4.3 `markInvalid`.
    pub async fn mark_invalid(&self, email: &str, reason: &str) {
        let now = common::now_millis();
        self.store
            .mutate(|doc| {
                let cooldown_ms = doc.settings.cooldown_duration_ms;
                if let Some(account) = find_mut(doc, email) {
                    account.is_invalid = true;
                    account.invalid_reason = Some(reason.to_string());
                    account.invalid_at = Some(now);
                    rescore(account, now, cooldown_ms);
                    warn!(email, reason, "account marked invalid — re-enrollment required");
                }
                recompute_recommended(doc);
            })
            .await;
    }

    /// §4.3 `recordFailure` — combines rate-limit and invalidation
    /// conditionally, per the classified upstream error's `PoolAction`.
    pub async fn record_failure(&self, email: &str, action: PoolAction) {
        match action {
            PoolAction::None => {}
            PoolAction::Cooldown(duration) => {
                self.mark_rate_limited(email, Some(duration.as_millis() as u64))
                    .await;
            }
            PoolAction::Invalidate(reason) => {
                self.mark_invalid(email, &reason).await;
            }
        }
    }

    /// Pool health summary for the `/health` endpoint.
    pub async fn health(&self) -> serde_json::Value {
        let doc = self.store.snapshot().await;
        let now = common::now_millis();

        let mut accounts = Vec::new();
        let mut available = 0usize;
        let mut cooling = 0usize;
        let mut invalid = 0usize;

        for account in &doc.accounts {
            if account.is_invalid {
                invalid += 1;
                accounts.push(serde_json::json!({
                    "email": account.email,
                    "status": "invalid",
                    "reason": account.invalid_reason,
                    "health_score": account.health_score,
                }));
            } else if account.is_rate_limited {
                cooling += 1;
                let remaining = account
                    .rate_limit_reset_time
                    .map(|t| t.saturating_sub(now))
                    .unwrap_or(0);
                accounts.push(serde_json::json!({
                    "email": account.email,
                    "status": "cooling_down",
                    "cooldown_remaining_ms": remaining,
                    "health_score": account.health_score,
                }));
            } else {
                available += 1;
                accounts.push(serde_json::json!({
                    "email": account.email,
                    "status": "available",
                    "recommended": account.recommended,
                    "health_score": account.health_score,
                }));
            }
        }

        let total = doc.accounts.len();
        let status = if total == 0 {
            "unhealthy"
        } else if available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "accounts_total": total,
            "accounts_available": available,
            "accounts_cooling_down": cooling,
            "accounts_invalid": invalid,
            "accounts": accounts,
        })
    }

    /// Snapshot of all accounts (for `/account-limits` and admin listing).
    pub async fn accounts(&self) -> Vec<Account> {
        self.store.snapshot().await.accounts
    }
}

fn find_mut<'a>(doc: &'a mut PoolDocument, email: &str) -> Option<&'a mut Account> {
    doc.accounts.iter_mut().find(|a| a.email == email)
}

/// Lazily expire cooldowns whose `rateLimitResetTime` has passed.
fn clear_expired(doc: &mut PoolDocument, now: u64) {
    let cooldown_ms = doc.settings.cooldown_duration_ms;
    for account in &mut doc.accounts {
        if account.is_rate_limited
            && account.rate_limit_reset_time.is_some_and(|t| now >= t)
        {
            account.is_rate_limited = false;
            account.rate_limit_reset_time = None;
            rescore(account, now, cooldown_ms);
        }
    }
}

/// §4.3 health score formula.
fn rescore(account: &mut Account, now: u64, default_cooldown_ms: u64) {
    let state_weight: f64 = if account.is_invalid {
        -50.0
    } else if account.is_rate_limited {
        -20.0
    } else {
        30.0
    };

    let success = account.stats.success_count as f64;
    let error = account.stats.error_count as f64;
    let denom = (success + error).max(1.0);
    let usage_ratio = success / denom;
    let error_ratio = error / denom;

    let cooldown_factor = if account.is_rate_limited {
        let remaining = account
            .rate_limit_reset_time
            .map(|t| t.saturating_sub(now) as f64)
            .unwrap_or(0.0);
        let default = (default_cooldown_ms as f64).max(1.0);
        (1.0 - (remaining / default).min(1.0)).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let raw = state_weight + (1.0 - usage_ratio) * 30.0 + (1.0 - error_ratio) * 20.0 + cooldown_factor * 10.0;
    account.health_score = raw.clamp(-100.0, 120.0).round() as i32;
}

/// `recommended` is true for the single strictly-highest-scoring non-invalid
/// account, provided that score is positive. Ties get no recommendation.
fn recompute_recommended(doc: &mut PoolDocument) {
    let max_score = doc
        .accounts
        .iter()
        .filter(|a| !a.is_invalid)
        .map(|a| a.health_score)
        .max();

    let winner_email = match max_score {
        Some(max) if max > 0 => {
            let winners: Vec<&str> = doc
                .accounts
                .iter()
                .filter(|a| !a.is_invalid && a.health_score == max)
                .map(|a| a.email.as_str())
                .collect();
            if winners.len() == 1 {
                Some(winners[0].to_string())
            } else {
                None
            }
        }
        _ => None,
    };

    for account in &mut doc.accounts {
        account.recommended = Some(account.email.as_str()) == winner_email.as_deref();
    }
}

/// The four-rule decision, run synchronously under the credential store's
/// write lock. Returns the pick plus an optional new affinity anchor email.
fn decide(
    doc: &mut PoolDocument,
    anchor_email: Option<&str>,
    anchor_at: u64,
    now: u64,
    time_window_lock_ms: u64,
) -> (PickResult, Option<String>) {
    // Rule 1 — affinity lock.
    if let Some(email) = anchor_email
        && now.saturating_sub(anchor_at) < time_window_lock_ms
    {
        if let Some(account) = doc.accounts.iter().find(|a| a.email == email) {
            if account.is_available() {
                return (PickResult::Account(account.clone()), None);
            }
            if account.is_rate_limited && !account.is_invalid {
                let remaining = account
                    .rate_limit_reset_time
                    .map(|t| t.saturating_sub(now))
                    .unwrap_or(0);
                if remaining <= SHORT_WAIT_THRESHOLD_MS {
                    return (PickResult::Wait { ms: remaining }, None);
                }
            }
            // Invalid, or a long cooldown: fall through to Rule 2.
        }
    }

    // Rule 2 — sticky current.
    if let Some(current) = doc.accounts.get(doc.active_index).cloned()
        && current.is_available()
    {
        let email = current.email.clone();
        if let Some(account) = find_mut(doc, &email) {
            account.last_used = Some(now);
        }
        return (PickResult::Account(account_clone(doc, &email)), Some(email));
    }

    // Rule 3 — wait-versus-switch on the current account's cooldown.
    if let Some(current) = doc.accounts.get(doc.active_index) {
        if let Some(reset_time) = current.rate_limit_reset_time {
            let remaining = reset_time.saturating_sub(now);
            if remaining <= SHORT_WAIT_THRESHOLD_MS {
                return (PickResult::Wait { ms: remaining }, None);
            }
            if remaining <= MAX_WAIT_BEFORE_ERROR_MS {
                let other_available = doc
                    .accounts
                    .iter()
                    .enumerate()
                    .any(|(i, a)| i != doc.active_index && a.is_available());
                if !other_available {
                    return (PickResult::Wait { ms: remaining }, None);
                }
                // fall through to Rule 4 to switch
            }
            // remaining > MAX_WAIT_BEFORE_ERROR: don't wait, fall through to Rule 4
        }
    }

    // Rule 4 — pick next by (healthScore desc, lastSuccessAt desc).
    pick_next(doc, now)
}

fn account_clone(doc: &PoolDocument, email: &str) -> Account {
    doc.accounts
        .iter()
        .find(|a| a.email == email)
        .cloned()
        .expect("email came from this document")
}

fn pick_next(doc: &mut PoolDocument, now: u64) -> (PickResult, Option<String>) {
    let mut available: Vec<usize> = doc
        .accounts
        .iter()
        .enumerate()
        .filter(|(_, a)| a.is_available())
        .map(|(i, _)| i)
        .collect();

    if available.is_empty() {
        return (PickResult::Exhausted, None);
    }

    available.sort_by(|&a, &b| {
        let acct_a = &doc.accounts[a];
        let acct_b = &doc.accounts[b];
        acct_b
            .health_score
            .cmp(&acct_a.health_score)
            .then_with(|| {
                acct_b
                    .stats
                    .last_success_at
                    .unwrap_or(0)
                    .cmp(&acct_a.stats.last_success_at.unwrap_or(0))
            })
    });

    let idx = available[0];
    doc.active_index = idx;
    let email = doc.accounts[idx].email.clone();
    doc.accounts[idx].last_used = Some(now);
    (PickResult::Account(doc.accounts[idx].clone()), Some(email))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anthropic_auth::credentials::{CredentialMaterial, CredentialSource};
    use std::sync::Arc;

    async fn store_with(accounts: Vec<Account>) -> Arc<CredentialStore> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = CredentialStore::load(path).await.unwrap();
        store.mutate(|doc| doc.accounts = accounts).await;
        // Keep the tempdir alive for the lifetime of the test by leaking it;
        // tests only assert in-memory behavior and don't re-load from disk.
        std::mem::forget(dir);
        Arc::new(store)
    }

    fn account(email: &str) -> Account {
        Account::new(
            email.to_string(),
            CredentialSource::Manual,
            CredentialMaterial {
                api_key: Some(format!("key-{email}")),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn empty_pool_returns_empty() {
        let store = store_with(vec![]).await;
        let pool = Pool::new(store);
        assert_eq!(pool.pick_sticky_account().await, PickResult::Empty);
    }

    #[tokio::test]
    async fn single_available_account_is_picked() {
        let store = store_with(vec![account("a@example.com")]).await;
        let pool = Pool::new(store);
        match pool.pick_sticky_account().await {
            PickResult::Account(a) => assert_eq!(a.email, "a@example.com"),
            other => panic!("expected Account, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn affinity_lock_holds_within_window() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);

        let first = pool.pick_sticky_account().await;
        assert!(matches!(first, PickResult::Account(ref a) if a.email == "a@example.com"));

        for _ in 0..10 {
            let next = pool.pick_sticky_account().await;
            assert!(matches!(next, PickResult::Account(ref a) if a.email == "a@example.com"));
        }
    }

    #[tokio::test]
    async fn affinity_lock_expires_after_window() {
        let store = store_with(vec![account("a@example.com")]).await;
        let pool = Pool::new(store).with_time_window_lock_ms(0);

        pool.pick_sticky_account().await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        // With a zero-length lock window, rule 1 never applies, but rule 2
        // (sticky current) still returns the only account.
        let second = pool.pick_sticky_account().await;
        assert!(matches!(second, PickResult::Account(ref a) if a.email == "a@example.com"));
    }

    #[tokio::test]
    async fn short_cooldown_on_current_returns_wait() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);
        pool.mark_rate_limited("a@example.com", Some(8_000)).await;

        match pool.pick_sticky_account().await {
            PickResult::Wait { ms } => assert!(ms <= 8_000 && ms > 0),
            other => panic!("expected Wait, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn medium_cooldown_switches_to_other_account() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);
        pool.mark_rate_limited("a@example.com", Some(30_000)).await;

        match pool.pick_sticky_account().await {
            PickResult::Account(a) => assert_eq!(a.email, "b@example.com"),
            other => panic!("expected Account(b), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_rate_limited_is_exhausted() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);
        pool.mark_rate_limited("a@example.com", Some(30_000)).await;
        pool.mark_rate_limited("b@example.com", Some(30_000)).await;

        // current (a) has a medium cooldown, and no other account is
        // available, so the decision must wait rather than report exhausted.
        match pool.pick_sticky_account().await {
            PickResult::Wait { .. } => {}
            other => panic!("expected Wait since no account is available, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_account_never_returned() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);
        pool.mark_invalid("a@example.com", "revoked").await;

        for _ in 0..5 {
            match pool.pick_sticky_account().await {
                PickResult::Account(a) => assert_eq!(a.email, "b@example.com"),
                PickResult::Wait { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn record_success_clears_flags_and_rescoes() {
        let store = store_with(vec![account("a@example.com")]).await;
        let pool = Pool::new(store);
        pool.mark_rate_limited("a@example.com", Some(1_000)).await;
        pool.record_success("a@example.com").await;

        let accounts = pool.accounts().await;
        let a = accounts.iter().find(|a| a.email == "a@example.com").unwrap();
        assert!(!a.is_rate_limited);
        assert!(!a.is_invalid);
        assert_eq!(a.stats.success_count, 1);
    }

    #[tokio::test]
    async fn optimistic_reset_clears_all_cooldowns() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);
        pool.mark_rate_limited("a@example.com", Some(60_000)).await;
        pool.mark_rate_limited("b@example.com", Some(60_000)).await;

        pool.reset_all_rate_limits_if_exhausted().await;

        let accounts = pool.accounts().await;
        assert!(accounts.iter().all(|a| !a.is_rate_limited));
    }

    #[tokio::test]
    async fn optimistic_reset_is_noop_unless_all_limited() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);
        pool.mark_rate_limited("a@example.com", Some(60_000)).await;

        pool.reset_all_rate_limits_if_exhausted().await;

        let accounts = pool.accounts().await;
        let a = accounts.iter().find(|a| a.email == "a@example.com").unwrap();
        assert!(a.is_rate_limited, "should not reset when not all accounts are limited");
    }

    #[tokio::test]
    async fn health_score_stays_in_bounds() {
        let store = store_with(vec![account("a@example.com")]).await;
        let pool = Pool::new(store);
        for _ in 0..50 {
            pool.record_success("a@example.com").await;
        }
        let accounts = pool.accounts().await;
        assert!(accounts[0].health_score <= 120 && accounts[0].health_score >= -100);
    }

    #[tokio::test]
    async fn recommended_is_unique_highest_scorer() {
        let store = store_with(vec![account("a@example.com"), account("b@example.com")]).await;
        let pool = Pool::new(store);
        for _ in 0..5 {
            pool.record_success("a@example.com").await;
        }

        let accounts = pool.accounts().await;
        let recommended: Vec<&Account> = accounts.iter().filter(|a| a.recommended).collect();
        assert_eq!(recommended.len(), 1);
        assert_eq!(recommended[0].email, "a@example.com");
    }
}
