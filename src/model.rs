use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Course-module id; the id milestones and completions refer to.
    pub id: i64,
    pub instance_id: i64,
    pub name: String,
    pub description: String,
    /// Module table name (`quiz`, `resource`, ...).
    pub module_type: String,
    pub milestone: Option<i64>,
    pub visible: bool,
    pub restricted: bool,
    pub is_resource: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    pub name: String,
    pub activities: Vec<Activity>,
}

impl Course {
    pub fn total_milestones(&self) -> i64 {
        crate::credits::sum_minutes(self.activities.iter().filter_map(|a| a.milestone))
    }

    pub fn find_activity(&self, activity_id: i64) -> Option<&Activity> {
        self.activities.iter().find(|a| a.id == activity_id)
    }
}

/// Completion record of one course module by one learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub activity_id: i64,
    pub completed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Learner {
    pub id: i64,
    pub firstname: String,
    pub lastname: String,
    pub completions: Vec<Completion>,
}

impl Learner {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub parent_id: Option<i64>,
    /// Names from the root category down to this one.
    pub hierarchy: Vec<String>,
    pub is_training: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Training {
    pub id: i64,
    pub name: String,
    pub category_id: i64,
    pub courses: Vec<Course>,
    /// Learners enrolled in at least one of the courses, keyed by learner id.
    pub learners: BTreeMap<i64, Learner>,
}

impl Training {
    /// Label shown on certificates: the training name, or the category name
    /// when the training was never renamed.
    pub fn display_name<'a>(&'a self, category_name: &'a str) -> &'a str {
        if self.name.trim().is_empty() {
            category_name
        } else {
            &self.name
        }
    }

    pub fn find_activity(&self, activity_id: i64) -> Option<(&Course, &Activity)> {
        self.courses
            .iter()
            .find_map(|c| c.find_activity(activity_id).map(|a| (c, a)))
    }

    /// Learners ordered by last name then first name.
    pub fn sorted_learners(&self) -> Vec<&Learner> {
        let mut out: Vec<&Learner> = self.learners.values().collect();
        out.sort_by(|a, b| {
            a.lastname
                .to_lowercase()
                .cmp(&b.lastname.to_lowercase())
                .then_with(|| a.firstname.to_lowercase().cmp(&b.firstname.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

/// A learner's completed activity joined with the course it belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedActivity {
    pub activity_id: i64,
    pub activity_name: String,
    pub module_type: String,
    pub course_id: i64,
    pub course_name: String,
    pub milestone: Option<i64>,
    pub completed_at: i64,
}
