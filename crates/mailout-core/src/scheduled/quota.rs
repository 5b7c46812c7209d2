//! Account Quota Tracker - Daily send cap per sending account

use chrono::NaiveDate;
use mailout_storage::{DailyCounter, SendingAccount};
use tracing::debug;

/// Daily quota check shared by all sending accounts
///
/// A counter is over quota only once it is strictly greater than the limit,
/// so an account gets `daily_limit + 1` deliveries per business date.
#[derive(Debug, Clone, Copy)]
pub struct AccountQuotaTracker {
    daily_limit: i32,
}

impl AccountQuotaTracker {
    pub fn new(daily_limit: i32) -> Self {
        Self { daily_limit }
    }

    pub fn daily_limit(&self) -> i32 {
        self.daily_limit
    }

    fn within_limit(&self, sent_today: i32) -> bool {
        sent_today <= self.daily_limit
    }

    /// Whether the account may attempt another delivery on `today`
    pub fn has_capacity(&self, account: &SendingAccount, today: NaiveDate) -> bool {
        self.within_limit(account.quota.current(today))
    }

    /// Deliveries left for the account on `today`
    pub fn remaining(&self, account: &SendingAccount, today: NaiveDate) -> i32 {
        (self.daily_limit + 1 - account.quota.current(today)).max(0)
    }

    /// Roll the counter over if needed, then count one delivery if the
    /// account is still within its quota
    pub fn try_consume(&self, counter: &mut DailyCounter, today: NaiveDate) -> bool {
        if counter.roll_over(today) {
            debug!(%today, "Daily quota counter reset");
        }
        if !self.within_limit(counter.count) {
            return false;
        }
        counter.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, n).unwrap()
    }

    fn account(quota: DailyCounter) -> SendingAccount {
        SendingAccount {
            id: 1,
            owner_id: 1,
            from_address: "a@example.com".to_string(),
            from_name: None,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            use_starttls: true,
            allow_mass_mail: true,
            is_primary: false,
            quota,
            report: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_try_consume_allows_limit_plus_one() {
        let tracker = AccountQuotaTracker::new(5);
        let mut counter = DailyCounter::default();

        let granted = (0..10).filter(|_| tracker.try_consume(&mut counter, day(4))).count();
        assert_eq!(granted, 6);
        assert!(!tracker.try_consume(&mut counter, day(4)));

        assert!(tracker.try_consume(&mut counter, day(5)));
        assert_eq!(counter, DailyCounter::new(1, Some(day(5))));
    }

    #[test]
    fn test_has_capacity_matches_try_consume() {
        let tracker = AccountQuotaTracker::new(2);
        assert!(tracker.has_capacity(&account(DailyCounter::new(2, Some(day(4)))), day(4)));
        assert!(!tracker.has_capacity(&account(DailyCounter::new(3, Some(day(4)))), day(4)));
        // Yesterday's count does not apply today.
        assert!(tracker.has_capacity(&account(DailyCounter::new(3, Some(day(3)))), day(4)));
    }

    #[test]
    fn test_remaining() {
        let tracker = AccountQuotaTracker::new(100);
        assert_eq!(tracker.remaining(&account(DailyCounter::default()), day(4)), 101);
        assert_eq!(
            tracker.remaining(&account(DailyCounter::new(101, Some(day(4)))), day(4)),
            0
        );
    }
}
