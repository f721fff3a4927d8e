use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use deeplist_llm::BoxFuture;
use deeplist_storage::{UsageDay, UsageStore};
use serde::{Deserialize, Serialize};

use super::collaborators::{QuotaChecker, run_blocking};
use super::context::UserIdentity;
use super::error::CollaboratorResult;
use super::notice::{Notice, Notifier};

pub const DEFAULT_AUTHENTICATED_DAILY_LIMIT: u64 = 1000;
pub const DEFAULT_GUEST_DAILY_LIMIT: u64 = 5;
pub const DAILY_LIMIT_NOTICE: &str = "Daily message limit reached";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSettings {
    #[serde(default = "default_authenticated_daily_limit")]
    pub authenticated_daily_limit: u64,
    #[serde(default = "default_guest_daily_limit")]
    pub guest_daily_limit: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            authenticated_daily_limit: DEFAULT_AUTHENTICATED_DAILY_LIMIT,
            guest_daily_limit: DEFAULT_GUEST_DAILY_LIMIT,
        }
    }
}

impl QuotaSettings {
    pub fn limit_for(&self, user: &UserIdentity) -> u64 {
        if user.is_authenticated {
            self.authenticated_daily_limit
        } else {
            self.guest_daily_limit
        }
    }
}

/// Per-user daily message counter.
///
/// An allowed check consumes one unit; a denied check consumes nothing.
pub struct DailyUsageLimiter {
    usage: Arc<dyn UsageStore>,
    notifier: Arc<dyn Notifier>,
    settings: QuotaSettings,
    today: fn() -> UsageDay,
}

impl DailyUsageLimiter {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        notifier: Arc<dyn Notifier>,
        settings: QuotaSettings,
    ) -> Self {
        Self {
            usage,
            notifier,
            settings,
            today: current_usage_day,
        }
    }

    pub fn with_clock(mut self, today: fn() -> UsageDay) -> Self {
        self.today = today;
        self
    }

    async fn check(&self, user: &UserIdentity) -> CollaboratorResult<bool> {
        let limit = self.settings.limit_for(user);
        let day = (self.today)();
        let usage = self.usage.clone();
        let user_id = user.id.clone();

        let consumed = run_blocking("check-daily-usage", move || {
            if usage.usage(&user_id, day)? >= limit {
                return Ok(None);
            }
            usage.increment_usage(&user_id, day).map(Some)
        })
        .await?;

        match consumed {
            Some(count) => {
                tracing::debug!(user_id = %user.id, count, limit, "daily usage consumed");
                Ok(true)
            }
            None => {
                tracing::info!(user_id = %user.id, limit, "daily usage limit reached");
                let description = if user.is_authenticated {
                    format!("You have used all {limit} messages for today.")
                } else {
                    format!("Guests can send {limit} messages a day. Sign in for more.")
                };
                self.notifier
                    .notify(Notice::error(DAILY_LIMIT_NOTICE).with_description(description));
                Ok(false)
            }
        }
    }
}

impl QuotaChecker for DailyUsageLimiter {
    fn check_limits_and_notify<'a>(
        &'a self,
        user: &'a UserIdentity,
    ) -> BoxFuture<'a, CollaboratorResult<bool>> {
        Box::pin(self.check(user))
    }
}

pub fn current_usage_day() -> UsageDay {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default();
    UsageDay::from_unix_seconds(seconds)
}

fn default_authenticated_daily_limit() -> u64 {
    DEFAULT_AUTHENTICATED_DAILY_LIMIT
}

fn default_guest_daily_limit() -> u64 {
    DEFAULT_GUEST_DAILY_LIMIT
}
