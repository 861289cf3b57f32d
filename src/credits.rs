use crate::model::{Learner, Training, ValidatedActivity};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `XhYY`: whole hours, then minutes padded to two digits.
pub fn parse_minutes_to_hours(minutes: i64) -> String {
    let sign = if minutes < 0 { "-" } else { "" };
    let abs = minutes.unsigned_abs();
    format!("{}{}h{:02}", sign, abs / 60, abs % 60)
}

/// Sum of milestones that saturates instead of overflowing; extracted values
/// are not bounded.
pub fn sum_minutes<I: IntoIterator<Item = i64>>(minutes: I) -> i64 {
    minutes.into_iter().fold(0i64, i64::saturating_add)
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditsError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CreditsError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Completion window: `begin` inclusive, `end` exclusive, both optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub begin: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(begin: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        if let Some(b) = self.begin {
            if timestamp < midnight_utc(b) {
                return false;
            }
        }
        if let Some(e) = self.end {
            if timestamp >= midnight_utc(e) {
                return false;
            }
        }
        true
    }

    pub fn begin_str(&self) -> Option<String> {
        self.begin.map(|d| d.format("%Y-%m-%d").to_string())
    }

    pub fn end_str(&self) -> Option<String> {
        self.end.map(|d| d.format("%Y-%m-%d").to_string())
    }
}

pub fn midnight_utc(d: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)).timestamp()
}

/// Accepts `YYYY-MM-DD` as well as the unpadded `YYYY-M-D` produced by date
/// pickers.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let mut parts = s.split('-');
    let y = parts.next()?.parse::<i32>().ok()?;
    let m = parts.next()?.parse::<u32>().ok()?;
    let d = parts.next()?.parse::<u32>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(y, m, d)
}

/// Reads `begin`/`end` from request params. Absent, null or empty strings mean
/// an open bound.
pub fn parse_date_range(params: &serde_json::Value) -> Result<DateRange, CreditsError> {
    let mut bound = |key: &str| -> Result<Option<NaiveDate>, CreditsError> {
        match params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(serde_json::Value::String(s)) => parse_date(s).map(Some).ok_or_else(|| {
                let mut e = CreditsError::new("bad_params", format!("{} must be YYYY-MM-DD", key));
                e.details = Some(serde_json::json!({ key: s }));
                e
            }),
            Some(other) => {
                let mut e = CreditsError::new("bad_params", format!("{} must be a string", key));
                e.details = Some(serde_json::json!({ key: other }));
                Err(e)
            }
        }
    };
    let begin = bound("begin")?;
    let end = bound("end")?;
    if let (Some(b), Some(e)) = (begin, end) {
        if e < b {
            return Err(CreditsError::new("bad_params", "end must not be before begin"));
        }
    }
    Ok(DateRange { begin, end })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditSummary {
    pub learner_id: i64,
    pub training_id: i64,
    pub activities: Vec<ValidatedActivity>,
    pub total_minutes: i64,
    /// Listed activities, with or without credited time.
    pub counted: usize,
    /// Listed activities that carry a milestone.
    pub credited: usize,
}

impl CreditSummary {
    pub fn total_label(&self) -> String {
        parse_minutes_to_hours(self.total_minutes)
    }
}

/// Validated activities of a learner inside the training and the window.
///
/// Activities without a milestone are listed and contribute nothing to the
/// total.
pub fn aggregate(learner: &Learner, range: &DateRange, training: &Training) -> CreditSummary {
    let mut activities = Vec::new();
    for completion in &learner.completions {
        if !range.contains(completion.completed_at) {
            continue;
        }
        let Some((course, act)) = training.find_activity(completion.activity_id) else {
            continue;
        };
        activities.push(ValidatedActivity {
            activity_id: act.id,
            activity_name: act.name.clone(),
            module_type: act.module_type.clone(),
            course_id: course.id,
            course_name: course.name.clone(),
            milestone: act.milestone,
            completed_at: completion.completed_at,
        });
    }
    activities.sort_by(|a, b| {
        a.completed_at
            .cmp(&b.completed_at)
            .then_with(|| a.activity_id.cmp(&b.activity_id))
    });

    let total_minutes = sum_minutes(activities.iter().filter_map(|a| a.milestone));
    let credited = activities.iter().filter(|a| a.milestone.is_some()).count();
    CreditSummary {
        learner_id: learner.id,
        training_id: training.id,
        counted: activities.len(),
        credited,
        total_minutes,
        activities,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupKey {
    #[serde(rename = "coursename")]
    CourseName,
    #[serde(rename = "name")]
    ActivityName,
    #[serde(rename = "type")]
    ActivityType,
}

impl GroupKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coursename" => Some(Self::CourseName),
            "name" => Some(Self::ActivityName),
            "type" => Some(Self::ActivityType),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::CourseName => "coursename",
            Self::ActivityName => "name",
            Self::ActivityType => "type",
        }
    }

    fn value_of(self, va: &ValidatedActivity) -> &str {
        match self {
            Self::CourseName => &va.course_name,
            Self::ActivityName => &va.activity_name,
            Self::ActivityType => &va.module_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLine {
    pub label: String,
    pub minutes: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<GroupLine>,
}

/// Display grouping of credited activities. Only activities with a milestone
/// appear; groups keep the order in which their first activity was validated.
pub fn group_lines(summary: &CreditSummary, key1: GroupKey, key2: Option<GroupKey>) -> Vec<GroupLine> {
    let credited: Vec<&ValidatedActivity> = summary
        .activities
        .iter()
        .filter(|a| a.milestone.is_some())
        .collect();
    group_level(&credited, key1, key2)
}

fn group_level(items: &[&ValidatedActivity], key: GroupKey, next: Option<GroupKey>) -> Vec<GroupLine> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: BTreeMap<String, Vec<&ValidatedActivity>> = BTreeMap::new();
    for va in items {
        let label = key.value_of(va).to_string();
        if !buckets.contains_key(&label) {
            order.push(label.clone());
        }
        buckets.entry(label).or_default().push(va);
    }

    order
        .into_iter()
        .map(|label| {
            let members = buckets.remove(&label).unwrap_or_default();
            let minutes = sum_minutes(members.iter().filter_map(|a| a.milestone));
            let children = match next {
                Some(k) if k != key => group_level(&members, k, None),
                _ => Vec::new(),
            };
            GroupLine {
                label,
                minutes,
                children,
            }
        })
        .collect()
}

/// Flattens grouped lines into printable rows, nested rows indented.
pub fn format_group_lines(lines: &[GroupLine]) -> Vec<String> {
    let mut out = Vec::new();
    for line in lines {
        out.push(format!("{} : {}", line.label, parse_minutes_to_hours(line.minutes)));
        for child in &line.children {
            out.push(format!(
                "    {} : {}",
                child.label,
                parse_minutes_to_hours(child.minutes)
            ));
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerCredits {
    pub learner_id: i64,
    pub firstname: String,
    pub lastname: String,
    pub validated_count: usize,
    pub total_minutes: i64,
    pub total_label: String,
}

/// Learner list of a training with per-learner counts for the window.
pub fn learner_credits(training: &Training, range: &DateRange) -> Vec<LearnerCredits> {
    training
        .sorted_learners()
        .into_iter()
        .map(|l| {
            let s = aggregate(l, range, training);
            LearnerCredits {
                learner_id: l.id,
                firstname: l.firstname.clone(),
                lastname: l.lastname.clone(),
                validated_count: s.counted,
                total_minutes: s.total_minutes,
                total_label: s.total_label(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activity, Completion, Course};
    use std::collections::BTreeMap;

    fn activity(id: i64, name: &str, module_type: &str, milestone: Option<i64>) -> Activity {
        Activity {
            id,
            instance_id: id,
            name: name.to_string(),
            description: String::new(),
            module_type: module_type.to_string(),
            milestone,
            visible: true,
            restricted: false,
            is_resource: false,
        }
    }

    fn training() -> Training {
        Training {
            id: 1,
            name: "Nursing".into(),
            category_id: 1,
            courses: vec![
                Course {
                    id: 10,
                    name: "Anatomy".into(),
                    activities: vec![
                        activity(1, "Bones quiz", "quiz", Some(10)),
                        activity(2, "Notes", "resource", None),
                    ],
                },
                Course {
                    id: 20,
                    name: "Hygiene".into(),
                    activities: vec![activity(3, "Hands quiz", "quiz", Some(5))],
                },
            ],
            learners: BTreeMap::new(),
        }
    }

    fn learner(completions: &[(i64, i64)]) -> Learner {
        Learner {
            id: 7,
            firstname: "Ada".into(),
            lastname: "Lovelace".into(),
            completions: completions
                .iter()
                .map(|&(activity_id, completed_at)| Completion {
                    activity_id,
                    completed_at,
                })
                .collect(),
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn minutes_to_hours_format() {
        assert_eq!(parse_minutes_to_hours(125), "2h05");
        assert_eq!(parse_minutes_to_hours(59), "0h59");
        assert_eq!(parse_minutes_to_hours(0), "0h00");
        assert_eq!(parse_minutes_to_hours(600), "10h00");
    }

    #[test]
    fn totals_skip_missing_milestones_but_list_them() {
        let t = training();
        let l = learner(&[(1, 100), (2, 200), (3, 300)]);
        let s = aggregate(&l, &DateRange::default(), &t);
        assert_eq!(s.total_minutes, 15);
        assert_eq!(s.counted, 3);
        assert_eq!(s.credited, 2);
        assert_eq!(s.total_label(), "0h15");
    }

    #[test]
    fn activities_outside_training_are_ignored() {
        let t = training();
        let l = learner(&[(1, 100), (999, 100)]);
        let s = aggregate(&l, &DateRange::default(), &t);
        assert_eq!(s.counted, 1);
    }

    #[test]
    fn range_includes_begin_and_excludes_end() {
        let t = training();
        let begin = day(2024, 1, 1);
        let end = day(2024, 2, 1);
        let l = learner(&[(1, midnight_utc(begin)), (3, midnight_utc(end))]);
        let s = aggregate(&l, &DateRange::new(Some(begin), Some(end)), &t);
        assert_eq!(s.counted, 1);
        assert_eq!(s.activities[0].activity_id, 1);
        assert_eq!(s.total_minutes, 10);
    }

    #[test]
    fn open_bounds() {
        let t = training();
        let l = learner(&[(1, midnight_utc(day(2020, 5, 1))), (3, midnight_utc(day(2030, 5, 1)))]);
        let since = DateRange::new(Some(day(2025, 1, 1)), None);
        let until = DateRange::new(None, Some(day(2025, 1, 1)));
        assert_eq!(aggregate(&l, &since, &t).total_minutes, 5);
        assert_eq!(aggregate(&l, &until, &t).total_minutes, 10);
    }

    #[test]
    fn parse_date_range_accepts_unpadded_and_empty() {
        let r = parse_date_range(&serde_json::json!({ "begin": "2024-1-5", "end": "" }))
            .expect("range");
        assert_eq!(r.begin, Some(day(2024, 1, 5)));
        assert_eq!(r.end, None);

        let bad = parse_date_range(&serde_json::json!({ "begin": "05/01/2024" }));
        assert_eq!(bad.expect_err("bad").code, "bad_params");

        let reversed = parse_date_range(&serde_json::json!({ "begin": "2024-02-01", "end": "2024-01-01" }));
        assert!(reversed.is_err());
    }

    #[test]
    fn grouping_two_levels() {
        let t = training();
        let l = learner(&[(1, 100), (2, 150), (3, 200)]);
        let s = aggregate(&l, &DateRange::default(), &t);
        let lines = group_lines(&s, GroupKey::ActivityType, Some(GroupKey::CourseName));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].label, "quiz");
        assert_eq!(lines[0].minutes, 15);
        let children: Vec<&str> = lines[0].children.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(children, vec!["Anatomy", "Hygiene"]);

        let rows = format_group_lines(&lines);
        assert_eq!(rows[0], "quiz : 0h15");
        assert_eq!(rows[1], "    Anatomy : 0h10");
    }

    #[test]
    fn oversized_milestones_saturate() {
        let mut t = training();
        t.courses[0].activities[0].milestone = Some(i64::MAX);
        t.courses[1].activities[0].milestone = Some(i64::MAX);
        let l = learner(&[(1, 100), (3, 200)]);
        let s = aggregate(&l, &DateRange::default(), &t);
        assert_eq!(s.total_minutes, i64::MAX);
        assert_eq!(t.courses[0].total_milestones(), i64::MAX);

        let lines = group_lines(&s, GroupKey::ActivityType, Some(GroupKey::CourseName));
        assert_eq!(lines[0].minutes, i64::MAX);
        assert_eq!(lines[0].children[1].minutes, i64::MAX);
        assert_eq!(
            s.total_label(),
            format!("{}h{:02}", i64::MAX / 60, i64::MAX % 60)
        );
    }

    #[test]
    fn negative_milestones_reduce_the_total() {
        let mut t = training();
        t.courses[1].activities[0].milestone = Some(-70);
        let l = learner(&[(1, 100), (3, 200)]);
        let s = aggregate(&l, &DateRange::default(), &t);
        assert_eq!(s.total_minutes, -60);
        assert_eq!(s.total_label(), "-1h00");
        assert_eq!(parse_minutes_to_hours(-70), "-1h10");
        assert_eq!(parse_minutes_to_hours(-5), "-0h05");
        assert_eq!(parse_minutes_to_hours(i64::MIN), "-153722867280912930h08");
    }

    #[test]
    fn group_key_codes_are_stable() {
        for k in [GroupKey::CourseName, GroupKey::ActivityName, GroupKey::ActivityType] {
            assert_eq!(GroupKey::parse(k.code()), Some(k));
        }
        assert_eq!(GroupKey::parse("coursename"), Some(GroupKey::CourseName));
        assert_eq!(GroupKey::parse("bogus"), None);
    }
}
