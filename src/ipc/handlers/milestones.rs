use crate::factories::TrainingsFactory;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::milestone_settings;
use crate::ipc::helpers::{no_workspace, require_i64};
use crate::ipc::types::{AppState, Request};
use crate::model::Activity;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TypeFilter {
    All,
    NoResources,
    Module(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisibilityFilter {
    Any,
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestrictionFilter {
    Any,
    Restricted,
    Unrestricted,
}

#[derive(Debug, Clone)]
struct ActivityFilter {
    name: Option<String>,
    module_type: TypeFilter,
    visibility: VisibilityFilter,
    restriction: RestrictionFilter,
}

impl ActivityFilter {
    /// A name search wins over every other criterion.
    fn matches(&self, a: &Activity) -> bool {
        if let Some(n) = &self.name {
            return a.name.to_lowercase().contains(n.as_str());
        }
        let type_ok = match &self.module_type {
            TypeFilter::All => true,
            TypeFilter::NoResources => !a.is_resource,
            TypeFilter::Module(m) => a.module_type == *m,
        };
        let visibility_ok = match self.visibility {
            VisibilityFilter::Any => true,
            VisibilityFilter::Visible => a.visible,
            VisibilityFilter::Hidden => !a.visible,
        };
        let restriction_ok = match self.restriction {
            RestrictionFilter::Any => true,
            RestrictionFilter::Restricted => a.restricted,
            RestrictionFilter::Unrestricted => !a.restricted,
        };
        type_ok && visibility_ok && restriction_ok
    }
}

fn filter_index(params: &Value, key: &str, default: i64) -> Result<i64, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => match v.as_i64() {
            Some(n @ 0..=2) => Ok(n),
            _ => Err(format!("{} must be 0, 1 or 2", key)),
        },
    }
}

fn parse_filter(params: &Value, settings: &Value) -> Result<ActivityFilter, String> {
    let name = match params.get("name") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.trim().to_lowercase()),
        Some(_) => return Err("name must be a string".to_string()),
    };
    let module_type = match params.get("type") {
        None | Some(Value::Null) => TypeFilter::All,
        Some(Value::String(s)) if s == "0" || s.is_empty() => TypeFilter::All,
        Some(Value::String(s)) if s == "1" => TypeFilter::NoResources,
        Some(Value::String(s)) => TypeFilter::Module(s.clone()),
        Some(v) => match v.as_i64() {
            Some(0) => TypeFilter::All,
            Some(1) => TypeFilter::NoResources,
            _ => return Err("type must be 0, 1 or a module name".to_string()),
        },
    };
    let default_visibility = settings
        .get("defaultVisibilityFilter")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let default_restriction = settings
        .get("defaultRestrictFilter")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let visibility = match filter_index(params, "visibility", default_visibility)? {
        1 => VisibilityFilter::Visible,
        2 => VisibilityFilter::Hidden,
        _ => VisibilityFilter::Any,
    };
    let restriction = match filter_index(params, "restriction", default_restriction)? {
        1 => RestrictionFilter::Restricted,
        2 => RestrictionFilter::Unrestricted,
        _ => RestrictionFilter::Any,
    };
    Ok(ActivityFilter {
        name,
        module_type,
        visibility,
        restriction,
    })
}

fn handle_milestones_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let training_id = match require_i64(req, "trainingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let settings = milestone_settings(conn);
    let filter = match parse_filter(&req.params, &settings) {
        Ok(f) => f,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let training = match TrainingsFactory::new(conn, &mut state.module_names)
        .retrieve_training_by_id(training_id)
    {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "not_found", "training not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut module_types = BTreeSet::new();
    let mut courses = Vec::with_capacity(training.courses.len());
    for course in &training.courses {
        let activities: Vec<&Activity> = course
            .activities
            .iter()
            .inspect(|a| {
                module_types.insert(a.module_type.clone());
            })
            .filter(|a| filter.matches(a))
            .collect();
        courses.push(json!({
            "id": course.id,
            "name": course.name,
            "totalMinutes": course.total_milestones(),
            "activities": activities,
        }));
    }

    ok(
        &req.id,
        json!({
            "trainingId": training.id,
            "courses": courses,
            "moduleTypes": module_types,
            "inputSuffix": settings.get("inputSuffix").cloned().unwrap_or(Value::Null),
        }),
    )
}

fn handle_milestones_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let Some(updates) = req.params.get("updates").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing params.updates", None);
    };

    let mut parsed: Vec<(i64, Option<i64>)> = Vec::with_capacity(updates.len());
    for (i, u) in updates.iter().enumerate() {
        let Some(activity_id) = u.get("activityId").and_then(|v| v.as_i64()) else {
            return err(
                &req.id,
                "bad_params",
                "activityId must be an integer",
                Some(json!({ "index": i })),
            );
        };
        let minutes = match u.get("minutes") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_i64() {
                Some(m) if m >= 0 => Some(m),
                _ => {
                    return err(
                        &req.id,
                        "bad_params",
                        "minutes must be a non-negative integer or null",
                        Some(json!({ "index": i, "activityId": activity_id })),
                    )
                }
            },
        };
        let exists = conn
            .query_row(
                "SELECT 1 FROM course_modules WHERE id = ?",
                [activity_id],
                |r| r.get::<_, i64>(0),
            )
            .optional();
        match exists {
            Ok(Some(_)) => {}
            Ok(None) => {
                return err(
                    &req.id,
                    "not_found",
                    "activity not found",
                    Some(json!({ "index": i, "activityId": activity_id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        parsed.push((activity_id, minutes));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    for (activity_id, minutes) in &parsed {
        let res = match minutes {
            Some(m) => tx.execute(
                "INSERT INTO milestones(module_id, credited_time) VALUES(?, ?)
                 ON CONFLICT(module_id) DO UPDATE SET credited_time = excluded.credited_time",
                (activity_id, m),
            ),
            None => tx.execute("DELETE FROM milestones WHERE module_id = ?", [activity_id]),
        };
        if let Err(e) = res {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(count = parsed.len(), "milestones updated");
    ok(&req.id, json!({ "updated": parsed.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "milestones.list" => Some(handle_milestones_list(state, req)),
        "milestones.update" => Some(handle_milestones_update(state, req)),
        _ => None,
    }
}
