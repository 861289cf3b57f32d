use crate::credits::GroupKey;
use crate::factories::{CategoriesFactory, TrainingTemplate, TrainingsFactory};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{no_workspace, require_i64};
use crate::ipc::types::{AppState, Request};
use crate::storage::FileStore;
use crate::template::TemplateStore;
use serde_json::{json, Value};

fn handle_trainings_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let trainings = match TrainingsFactory::new(conn, &mut state.module_names).list() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let category_ids: Vec<i64> = {
        let mut stmt = match conn.prepare("SELECT id FROM categories ORDER BY path") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };
    let categories_factory = CategoriesFactory::new(conn);
    let mut categories = Vec::with_capacity(category_ids.len());
    for id in category_ids {
        match categories_factory.get_category(id) {
            Ok(Some(c)) => categories.push(c),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    ok(
        &req.id,
        json!({ "trainings": trainings, "categories": categories }),
    )
}

fn handle_training_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let category_id = match require_i64(req, "categoryId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let category = match CategoriesFactory::new(conn).get_category(category_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "category not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut factory = TrainingsFactory::new(conn, &mut state.module_names);
    let training = match factory.retrieve_training(category_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(training) = training else {
        return ok(
            &req.id,
            json!({ "category": category, "isTraining": false, "training": null }),
        );
    };
    let template = match factory.template_of(training.id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let courses: Vec<Value> = training
        .courses
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "activityCount": c.activities.len(),
                "totalMinutes": c.total_milestones(),
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "category": category,
            "isTraining": true,
            "training": {
                "id": training.id,
                "name": training.name,
                "displayName": training.display_name(&category.name),
                "courses": courses,
                "learnerCount": training.learners.len(),
                "template": template,
            }
        }),
    )
}

fn handle_training_set_enabled(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let category_id = match require_i64(req, "categoryId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(enabled) = req.params.get("enabled").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing params.enabled", None);
    };
    let mut category = match CategoriesFactory::new(conn).get_category(category_id) {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "not_found", "category not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let factory = TrainingsFactory::new(conn, &mut state.module_names);
    let previous = match factory.has_training(category_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    category.is_training = enabled;
    let dropped_templates = match factory.persist_training(category_id, enabled) {
        Ok(ids) => ids,
        Err(e) => {
            category.is_training = previous;
            tracing::warn!(category_id, enabled, error = %e, "training flag not saved");
            return err(
                &req.id,
                "db_update_failed",
                "could not update the training flag",
                Some(json!({ "category": category })),
            );
        }
    };
    if let Some(store) = state.workspace.as_deref().map(FileStore::new) {
        for &template_id in &dropped_templates {
            if let Err(e) = store.remove_backgrounds(template_id) {
                tracing::warn!(template_id, error = %format!("{e:#}"), "template files not removed");
            }
        }
    }
    let training_id = match factory.training_id(category_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    tracing::info!(category_id, enabled, dropped = dropped_templates.len(), "training flag updated");
    ok(
        &req.id,
        json!({
            "category": category,
            "trainingId": training_id,
            "droppedTemplates": dropped_templates,
        }),
    )
}

fn parse_group(v: &Value, key: &str) -> Result<Option<String>, String> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => GroupKey::parse(s)
            .map(|k| Some(k.code().to_string()))
            .ok_or_else(|| format!("{} must be one of: coursename, name, type", key)),
        _ => Err(format!("{} must be a string or null", key)),
    }
}

fn handle_training_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let training_id = match require_i64(req, "trainingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let factory = TrainingsFactory::new(conn, &mut state.module_names);
    let current = match factory.template_of(training_id) {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "not_found", "training not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Validate everything before writing anything.
    let name = match req.params.get("name") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().chars().count() <= 255 => Some(s.trim().to_string()),
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                "name must be a string of at most 255 characters",
                None,
            )
        }
    };
    let mut next = TrainingTemplate {
        template_id: current.template_id,
        group1: current.group1.clone(),
        group2: current.group2.clone(),
    };
    if let Some(v) = req.params.get("templateId") {
        let Some(template_id) = v.as_i64() else {
            return err(&req.id, "bad_params", "templateId must be an integer", None);
        };
        match TemplateStore::new(conn).name(template_id) {
            Ok(Some(_)) => next.template_id = template_id,
            Ok(None) => return err(&req.id, "not_found", "template not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(v) = req.params.get("group1") {
        match parse_group(v, "group1") {
            Ok(Some(g)) => next.group1 = g,
            Ok(None) => return err(&req.id, "bad_params", "group1 is required", None),
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        }
    }
    if let Some(v) = req.params.get("group2") {
        match parse_group(v, "group2") {
            Ok(g) => next.group2 = g,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Some(n) = &name {
        if let Err(e) = factory.rename(training_id, n) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = factory.set_template(training_id, &next) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(training_id, template_id = next.template_id, "training updated");
    ok(&req.id, json!({ "trainingId": training_id, "template": next }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "trainings.list" => Some(handle_trainings_list(state, req)),
        "training.get" => Some(handle_training_get(state, req)),
        "training.setEnabled" => Some(handle_training_set_enabled(state, req)),
        "training.update" => Some(handle_training_update(state, req)),
        _ => None,
    }
}
