use chrono::{NaiveTime, TimeZone, Utc};
use stream_conductor::models::schedule::{
    Schedule, ScheduleAction, ScheduleKind, ScheduleRule, TimeSpec,
};
use stream_conductor::AppError;

#[test]
fn daily_time_accepts_minutes_or_seconds() {
    let short = TimeSpec::parse(ScheduleKind::Daily, "21:00").expect("HH:MM");
    let long = TimeSpec::parse(ScheduleKind::Daily, "21:00:00").expect("HH:MM:SS");
    assert_eq!(short, long);
    assert_eq!(
        short,
        TimeSpec::Daily {
            time: NaiveTime::from_hms_opt(21, 0, 0).expect("time")
        }
    );
    assert_eq!(short.to_stored(), "21:00:00");
}

#[test]
fn malformed_time_spec_is_validation_error() {
    for raw in ["25:00", "noon", ""] {
        assert!(
            matches!(
                TimeSpec::parse(ScheduleKind::Daily, raw),
                Err(AppError::ScheduleValidation(_))
            ),
            "{raw:?}"
        );
    }
    assert!(matches!(
        TimeSpec::parse(ScheduleKind::OneTime, "tomorrow"),
        Err(AppError::ScheduleValidation(_))
    ));
}

#[test]
fn one_time_instant_normalizes_to_utc() {
    let spec = TimeSpec::parse(ScheduleKind::OneTime, "2024-01-01T21:00:00+07:00")
        .expect("instant");
    let expected = Utc.with_ymd_and_hms(2024, 1, 1, 14, 0, 0).single().expect("utc");
    assert_eq!(spec, TimeSpec::OneTime { at: expected });
    assert_eq!(spec.kind(), ScheduleKind::OneTime);
}

#[test]
fn rule_enabled_defaults_to_true() {
    let rule: ScheduleRule = serde_json::from_str(
        r#"{"time":{"kind":"daily","time":"06:30:00"},"timezone":"Asia/Jakarta","action":"start"}"#,
    )
    .expect("deserialize");
    assert!(rule.enabled);
    assert_eq!(rule.action, ScheduleAction::Start);
}

#[test]
fn new_schedule_has_no_trigger_history() {
    let rule = ScheduleRule {
        time: TimeSpec::Daily {
            time: NaiveTime::from_hms_opt(6, 0, 0).expect("time"),
        },
        timezone: "UTC".into(),
        action: ScheduleAction::Stop,
        enabled: true,
    };
    let schedule = Schedule::new("session-1".into(), rule);
    assert_eq!(schedule.session_id, "session-1");
    assert_eq!(schedule.kind(), ScheduleKind::Daily);
    assert!(schedule.last_fired_at.is_none());
    assert!(schedule.next_fire_at.is_none());
}
