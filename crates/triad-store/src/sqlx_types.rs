//! Wire encodings between domain enums and sqlite's `TEXT`/`INTEGER`
//! columns. sqlite has no native enum type, so (as in
//! `sem_os_postgres::sqlx_types`) every enum round-trips through a string
//! with an explicit parse/encode pair instead of a derived `sqlx::Type`.

use triad_core::types::{Direction, GroupType, JobState, PowerTarget, Quota};

pub fn encode_direction(d: Direction) -> &'static str {
    d.as_str()
}

pub fn parse_direction(s: &str) -> Direction {
    s.parse().unwrap_or(Direction::N)
}

pub fn encode_job_state(s: JobState) -> &'static str {
    s.as_str()
}

pub fn parse_job_state(s: &str) -> JobState {
    s.parse().unwrap_or(JobState::Unknown)
}

pub fn encode_group_type(t: GroupType) -> &'static str {
    match t {
        GroupType::Internal => "internal",
        GroupType::Organisation => "organisation",
        GroupType::Collabratory => "collabratory",
    }
}

pub fn parse_group_type(s: &str) -> GroupType {
    match s {
        "organisation" => GroupType::Organisation,
        "collabratory" => GroupType::Collabratory,
        _ => GroupType::Internal,
    }
}

pub fn encode_quota(q: Quota) -> Option<i64> {
    match q {
        Quota::Unlimited => None,
        Quota::Seconds(s) => Some(s),
    }
}

pub fn parse_quota(v: Option<i64>) -> Quota {
    match v {
        None => Quota::Unlimited,
        Some(s) => Quota::Seconds(s),
    }
}

pub fn encode_power_target(p: PowerTarget) -> &'static str {
    match p {
        PowerTarget::On => "on",
        PowerTarget::Off => "off",
    }
}

pub fn parse_power_target(s: &str) -> PowerTarget {
    match s {
        "on" => PowerTarget::On,
        _ => PowerTarget::Off,
    }
}

/// `tags` is stored as a comma-joined string; small fixed vocabulary, no
/// need for a join table.
pub fn encode_tags(tags: &std::collections::BTreeSet<String>) -> String {
    tags.iter().cloned().collect::<Vec<_>>().join(",")
}

pub fn parse_tags(s: &str) -> std::collections::BTreeSet<String> {
    s.split(',').filter(|t| !t.is_empty()).map(str::to_string).collect()
}
