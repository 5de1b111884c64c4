//! Auth-profile selection and cooldown policy
//!
//! Selection picks the live profile with the least-recent `last_used`,
//! tie-broken by lowest error count. Failures feed a class-based cooldown
//! schedule; successes reset it.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::{Error, Result};

use super::store::ProfileStore;
use super::{AuthProfile, ErrorClass, ProfileHandle};

/// Transient cooldown ladder: 1, 5, 25, 60 minutes
fn transient_cooldown(error_count: u32) -> Duration {
    let exponent = error_count.saturating_sub(1).min(3);
    let secs = 60_i64.saturating_mul(5_i64.pow(exponent));
    Duration::seconds(secs.min(3600))
}

/// Billing cooldown: 5h base, doubling per consecutive billing error, 24h cap
fn billing_cooldown(billing_error_count: u32) -> Duration {
    let exponent = billing_error_count.saturating_sub(1).min(3);
    let hours = 5_i64.saturating_mul(1 << exponent);
    Duration::hours(hours.min(24))
}

/// Serialized pool of auth profiles
pub struct AuthProfilePool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    profiles: Vec<AuthProfile>,
    store: Option<ProfileStore>,
}

impl AuthProfilePool {
    /// Build a pool from config-provided profiles, merging persisted state
    /// from `store` when given.
    #[must_use]
    pub fn new(mut profiles: Vec<AuthProfile>, store: Option<ProfileStore>) -> Self {
        if let Some(ref store) = store {
            if let Ok(saved) = store.load() {
                for profile in &mut profiles {
                    if let Some(prev) = saved.iter().find(|p| p.id == profile.id) {
                        profile.state = prev.state.clone();
                    }
                }
            }
        }
        Self {
            inner: Mutex::new(PoolInner { profiles, store }),
        }
    }

    /// Select a live profile for `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderUnavailable`] when every profile for the
    /// provider is cooling down or disabled.
    pub fn select(&self, provider: &str) -> Result<ProfileHandle> {
        self.select_at(provider, Utc::now())
    }

    /// Clock-injected selection, for tests
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderUnavailable`] when no live profile exists.
    pub fn select_at(&self, provider: &str, now: DateTime<Utc>) -> Result<ProfileHandle> {
        let mut inner = self.lock()?;

        let candidate = inner
            .profiles
            .iter_mut()
            .filter(|p| p.provider == provider && p.is_live(now))
            .min_by(|a, b| {
                let by_last_used = a.state.last_used.cmp(&b.state.last_used);
                by_last_used.then(a.state.error_count.cmp(&b.state.error_count))
            });

        let Some(profile) = candidate else {
            return Err(Error::ProviderUnavailable(format!(
                "no live auth profile for provider {provider}"
            )));
        };

        profile.state.last_used = Some(now);
        let handle = ProfileHandle {
            id: profile.id.clone(),
            provider: profile.provider.clone(),
            api_key: profile.api_key.clone(),
            base_url: profile.base_url.clone(),
        };
        inner.persist();
        Ok(handle)
    }

    /// Record a successful call: clears error counts and cooldown.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool lock is poisoned.
    pub fn report_success(&self, profile_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(profile) = inner.profiles.iter_mut().find(|p| p.id == profile_id) {
            profile.state.error_count = 0;
            profile.state.billing_error_count = 0;
            profile.state.cooldown_until = None;
            profile.state.last_error_class = None;
            profile.state.last_used = Some(Utc::now());
        }
        inner.persist();
        Ok(())
    }

    /// Record a failed call and apply the class cooldown.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool lock is poisoned.
    pub fn report_failure(&self, profile_id: &str, class: ErrorClass) -> Result<()> {
        self.report_failure_at(profile_id, class, Utc::now())
    }

    /// Clock-injected failure report, for tests
    ///
    /// # Errors
    ///
    /// Returns an error when the pool lock is poisoned.
    pub fn report_failure_at(
        &self,
        profile_id: &str,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(profile) = inner.profiles.iter_mut().find(|p| p.id == profile_id) else {
            return Ok(());
        };

        profile.state.last_error_class = Some(class);
        match class {
            ErrorClass::RateLimit | ErrorClass::Timeout | ErrorClass::Unknown => {
                profile.state.error_count += 1;
                let cooldown = transient_cooldown(profile.state.error_count);
                profile.state.cooldown_until = Some(now + cooldown);
                tracing::warn!(
                    profile = profile_id,
                    class = ?class,
                    cooldown_secs = cooldown.num_seconds(),
                    "profile cooling down"
                );
            }
            ErrorClass::Billing => {
                profile.state.error_count += 1;
                profile.state.billing_error_count += 1;
                let cooldown = billing_cooldown(profile.state.billing_error_count);
                profile.state.cooldown_until = Some(now + cooldown);
                tracing::warn!(
                    profile = profile_id,
                    cooldown_hours = cooldown.num_hours(),
                    "billing failure, long cooldown"
                );
            }
            ErrorClass::Auth | ErrorClass::Format => {
                profile.state.error_count += 1;
                profile.state.disabled = true;
                tracing::error!(
                    profile = profile_id,
                    class = ?class,
                    "profile disabled pending operator intervention"
                );
            }
        }
        inner.persist();
        Ok(())
    }

    /// Re-enable a disabled profile (operator action)
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown profiles.
    pub fn reenable(&self, profile_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let profile = inner
            .profiles
            .iter_mut()
            .find(|p| p.id == profile_id)
            .ok_or_else(|| Error::NotFound(format!("profile {profile_id}")))?;
        profile.state = super::ProfileState::default();
        inner.persist();
        Ok(())
    }

    /// Snapshot of all profiles with keys redacted, for status reporting
    ///
    /// # Errors
    ///
    /// Returns an error when the pool lock is poisoned.
    pub fn status(&self) -> Result<Vec<AuthProfile>> {
        let inner = self.lock()?;
        Ok(inner
            .profiles
            .iter()
            .map(|p| {
                let mut p = p.clone();
                p.api_key = "<redacted>".to_string();
                p
            })
            .collect())
    }

    /// Provider names with at least one configured profile
    ///
    /// # Errors
    ///
    /// Returns an error when the pool lock is poisoned.
    pub fn providers(&self) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let mut names: Vec<String> = inner
            .profiles
            .iter()
            .map(|p| p.provider.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PoolInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("auth pool lock poisoned".to_string()))
    }
}

impl PoolInner {
    /// Best-effort persistence; the pool stays authoritative in memory
    fn persist(&self) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.save(&self.profiles) {
                tracing::warn!(error = %e, "failed to persist auth profile state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProfileState;

    fn profile(id: &str) -> AuthProfile {
        AuthProfile {
            id: id.to_string(),
            provider: "anthropic".to_string(),
            api_key: format!("sk-{id}"),
            base_url: None,
            state: ProfileState::default(),
        }
    }

    fn pool(ids: &[&str]) -> AuthProfilePool {
        AuthProfilePool::new(ids.iter().map(|id| profile(id)).collect(), None)
    }

    #[test]
    fn transient_ladder_matches_schedule() {
        assert_eq!(transient_cooldown(1).num_minutes(), 1);
        assert_eq!(transient_cooldown(2).num_minutes(), 5);
        assert_eq!(transient_cooldown(3).num_minutes(), 25);
        assert_eq!(transient_cooldown(4).num_minutes(), 60);
        assert_eq!(transient_cooldown(9).num_minutes(), 60);
    }

    #[test]
    fn billing_ladder_doubles_to_24h() {
        assert_eq!(billing_cooldown(1).num_hours(), 5);
        assert_eq!(billing_cooldown(2).num_hours(), 10);
        assert_eq!(billing_cooldown(3).num_hours(), 20);
        assert_eq!(billing_cooldown(4).num_hours(), 24);
    }

    #[test]
    fn selects_least_recently_used() {
        let pool = pool(&["p1", "p2"]);
        let now = Utc::now();
        let first = pool.select_at("anthropic", now).unwrap();
        let second = pool.select_at("anthropic", now + Duration::seconds(1)).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn rate_limited_profile_is_skipped_until_cooldown_elapses() {
        let pool = pool(&["p1", "p2"]);
        let now = Utc::now();
        let first = pool.select_at("anthropic", now).unwrap();
        pool.report_failure_at(&first.id, ErrorClass::RateLimit, now)
            .unwrap();

        // Within the cooldown window, only the other profile is served
        let during = now + Duration::seconds(30);
        for _ in 0..3 {
            let picked = pool.select_at("anthropic", during).unwrap();
            assert_ne!(picked.id, first.id);
        }

        // After the 1-minute cooldown, the first profile is eligible again
        let after = now + Duration::minutes(2);
        let ids: Vec<String> = (0..2)
            .map(|i| {
                pool.select_at("anthropic", after + Duration::seconds(i))
                    .unwrap()
                    .id
            })
            .collect();
        assert!(ids.contains(&first.id));
    }

    #[test]
    fn auth_failure_disables_profile() {
        let pool = pool(&["p1"]);
        let handle = pool.select("anthropic").unwrap();
        pool.report_failure(&handle.id, ErrorClass::Auth).unwrap();
        assert!(matches!(
            pool.select("anthropic"),
            Err(Error::ProviderUnavailable(_))
        ));
        pool.reenable(&handle.id).unwrap();
        assert!(pool.select("anthropic").is_ok());
    }

    #[test]
    fn success_resets_cooldown_state() {
        let pool = pool(&["p1"]);
        let now = Utc::now();
        let handle = pool.select_at("anthropic", now).unwrap();
        pool.report_failure_at(&handle.id, ErrorClass::RateLimit, now)
            .unwrap();
        pool.report_success(&handle.id).unwrap();
        let status = pool.status().unwrap();
        assert_eq!(status[0].state.error_count, 0);
        assert!(status[0].state.cooldown_until.is_none());
    }

    #[test]
    fn unknown_provider_is_unavailable() {
        let pool = pool(&["p1"]);
        assert!(matches!(
            pool.select("openai"),
            Err(Error::ProviderUnavailable(_))
        ));
    }

    #[test]
    fn status_redacts_keys() {
        let pool = pool(&["p1"]);
        let status = pool.status().unwrap();
        assert_eq!(status[0].api_key, "<redacted>");
    }
}
