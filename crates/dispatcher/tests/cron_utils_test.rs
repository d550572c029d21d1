#[cfg(test)]
mod cron_utils_tests {
    use taskbeat_core::{ScheduleEntry, ScheduleTrigger, TaskbeatError};
    use taskbeat_dispatcher::cron_utils::*;

    use chrono::{Duration, TimeZone, Timelike, Utc};
    use serde_json::json;

    #[test]
    fn test_cron_scheduler_creation() {
        let scheduler = CronScheduler::new("0 0 0 * * *");
        assert!(scheduler.is_ok());
        let scheduler = CronScheduler::new("invalid");
        assert!(scheduler.is_err());
    }

    #[test]
    fn test_next_execution_time() {
        let scheduler = CronScheduler::new("0 0 0 * * *").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(now).unwrap();
        assert_eq!(next.hour(), 0);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_validate_cron_expression() {
        assert!(CronScheduler::validate_cron_expression("0 0 0 * * *").is_ok());
        assert!(CronScheduler::validate_cron_expression("0 */5 * * * *").is_ok());
        assert!(CronScheduler::validate_cron_expression("0 0 9-17 * * 1-5").is_ok());
        assert!(CronScheduler::validate_cron_expression("invalid").is_err());
        assert!(CronScheduler::validate_cron_expression("0 0 0 32 * *").is_err());
        assert!(CronScheduler::validate_cron_expression("").is_err());
    }

    #[test]
    fn test_interval_entry_is_due_relative_to_created_at() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = ScheduleEntry::interval("poll", "poll_feed", 60, json!({})).with_created_at(created);

        assert!(!is_due(&entry, created).unwrap());
        assert!(!is_due(&entry, created + Duration::seconds(59)).unwrap());
        assert!(is_due(&entry, created + Duration::seconds(60)).unwrap());

        let mut fired = entry.clone();
        fired.last_run_at = Some(created + Duration::seconds(60));
        assert!(!is_due(&fired, created + Duration::seconds(61)).unwrap());
        assert!(is_due(&fired, created + Duration::seconds(120)).unwrap());
    }

    #[test]
    fn test_cron_entry_is_due_after_next_match() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        let entry = ScheduleEntry::cron("report", "build_report", "0 * * * * *", json!({}))
            .with_created_at(created);

        assert!(!is_due(&entry, created + Duration::seconds(10)).unwrap());
        assert!(is_due(&entry, created + Duration::seconds(30)).unwrap());
    }

    #[test]
    fn test_invalid_triggers_rejected() {
        assert!(validate_trigger(&ScheduleTrigger::Interval { seconds: 0 }).is_err());
        assert!(validate_trigger(&ScheduleTrigger::Interval { seconds: 5 }).is_ok());
        assert!(validate_trigger(&ScheduleTrigger::Cron {
            expression: "nope".to_string()
        })
        .is_err());

        let entry = ScheduleEntry::cron("bad", "t", "nope", json!({}));
        assert!(is_due(&entry, Utc::now()).is_err());
    }

    #[test]
    fn test_oversized_interval_is_an_error_not_a_panic() {
        let huge = ScheduleTrigger::Interval {
            seconds: 10_000_000_000_000_000,
        };
        assert!(validate_trigger(&huge).is_err());
        assert!(validate_trigger(&ScheduleTrigger::Interval {
            seconds: MAX_INTERVAL_SECONDS
        })
        .is_ok());

        // 绕过校验直接写入存储的条目同样只返回错误
        let entry = ScheduleEntry::interval("huge", "t", 10_000_000_000_000_000, json!({}));
        assert!(matches!(
            is_due(&entry, Utc::now()),
            Err(TaskbeatError::Configuration(_))
        ));
    }
}
