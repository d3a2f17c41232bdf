// Cooldown gate - decides whether a pseudonymous identity may submit again.

use super::confession_models::SubmissionRecord;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Time left before `record` may submit again, or `None` if allowed now.
///
/// A clock that went backwards counts as zero elapsed time, so skew can only
/// ever extend a cooldown, never shorten it.
pub fn remaining(
    record: &SubmissionRecord,
    cooldown_seconds: u64,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if cooldown_seconds == 0 {
        return None;
    }
    let last = record.last_submission_at?;

    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    let cooldown = Duration::from_secs(cooldown_seconds);
    if elapsed >= cooldown {
        None
    } else {
        Some(cooldown - elapsed)
    }
}

pub fn is_allowed(record: &SubmissionRecord, cooldown_seconds: u64, now: DateTime<Utc>) -> bool {
    remaining(record, cooldown_seconds, now).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confessions::IdentityToken;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record_at(last: Option<i64>) -> SubmissionRecord {
        let mut record = SubmissionRecord::new(IdentityToken::from_hex("ab".repeat(32)));
        record.last_submission_at = last.map(at);
        record
    }

    #[test]
    fn fresh_record_is_allowed() {
        assert!(is_allowed(&record_at(None), 60, at(0)));
    }

    #[test]
    fn zero_cooldown_always_allows() {
        assert!(is_allowed(&record_at(Some(0)), 0, at(0)));
    }

    #[test]
    fn cooldown_boundaries() {
        let record = record_at(Some(0));
        assert!(!is_allowed(&record, 60, at(30)));
        assert!(!is_allowed(&record, 60, at(59)));
        assert!(is_allowed(&record, 60, at(60)));
        assert!(is_allowed(&record, 60, at(61)));
    }

    #[test]
    fn remaining_reports_time_left() {
        let record = record_at(Some(0));
        assert_eq!(remaining(&record, 60, at(45)), Some(Duration::from_secs(15)));
        assert_eq!(remaining(&record, 60, at(90)), None);
    }

    #[test]
    fn backwards_clock_does_not_unblock() {
        let record = record_at(Some(100));
        assert!(!is_allowed(&record, 60, at(50)));
        assert_eq!(remaining(&record, 60, at(50)), Some(Duration::from_secs(60)));
    }

    #[test]
    fn blocked_stays_blocked_for_earlier_times() {
        let record = record_at(Some(0));
        let cooldown = 60;
        for t1 in [10, 30, 59] {
            assert!(!is_allowed(&record, cooldown, at(t1)));
            for t2 in (-120..t1).step_by(7) {
                assert!(!is_allowed(&record, cooldown, at(t2)), "t2={t2} t1={t1}");
            }
        }
    }
}
