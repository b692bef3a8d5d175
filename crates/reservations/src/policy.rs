//! Hold-window policy.

use chrono::{DateTime, Duration, Utc};

use stocklock_core::{DomainError, DomainResult};

/// How long holds live, and how far they may be pushed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HoldPolicy {
    /// Window granted when the caller does not ask for one.
    pub window: Duration,
    /// Ceiling for caller-requested windows and extensions.
    pub max_window: Duration,
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            window: Duration::minutes(30),
            max_window: Duration::hours(4),
        }
    }
}

impl HoldPolicy {
    /// Resolve the expiry for a new or refreshed hold.
    pub fn expiry_from(
        &self,
        now: DateTime<Utc>,
        requested: Option<Duration>,
    ) -> DomainResult<DateTime<Utc>> {
        let window = requested.unwrap_or(self.window);
        if window <= Duration::zero() {
            return Err(DomainError::validation("hold window must be positive"));
        }
        if window > self.max_window {
            return Err(DomainError::validation(format!(
                "hold window {}s exceeds the {}s ceiling",
                window.num_seconds(),
                self.max_window.num_seconds()
            )));
        }
        Ok(now + window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_applies_when_unspecified() {
        let policy = HoldPolicy::default();
        let now = Utc::now();
        let expiry = policy.expiry_from(now, None).unwrap();
        assert_eq!(expiry, now + Duration::minutes(30));
    }

    #[test]
    fn requested_windows_are_bounded() {
        let policy = HoldPolicy::default();
        let now = Utc::now();

        assert!(policy.expiry_from(now, Some(Duration::minutes(90))).is_ok());
        assert!(policy
            .expiry_from(now, Some(Duration::hours(5)))
            .is_err());
        assert!(policy
            .expiry_from(now, Some(Duration::seconds(0)))
            .is_err());
    }
}
