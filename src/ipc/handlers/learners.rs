use crate::credits::{aggregate, learner_credits, parse_minutes_to_hours};
use crate::factories::{CategoriesFactory, LearnersFactory, TrainingsFactory};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{date_range, no_workspace, require_i64};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn handle_learners_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let training_id = match require_i64(req, "trainingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let range = match date_range(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let training = match TrainingsFactory::new(conn, &mut state.module_names)
        .retrieve_training_by_id(training_id)
    {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "not_found", "training not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let learners = learner_credits(&training, &range);
    ok(
        &req.id,
        json!({
            "trainingId": training.id,
            "range": range,
            "learners": learners,
        }),
    )
}

fn handle_learner_details(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let learner_id = match require_i64(req, "learnerId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let range = match date_range(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let learner = match LearnersFactory::new(conn).retrieve_learner(learner_id) {
        Ok(Some(l)) => l,
        Ok(None) => return err(&req.id, "not_found", "learner not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let trainings = match TrainingsFactory::new(conn, &mut state.module_names)
        .trainings_of_learner(learner_id)
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let categories = CategoriesFactory::new(conn);
    let mut out = Vec::with_capacity(trainings.len());
    for training in &trainings {
        let category_name = match categories.get_category(training.category_id) {
            Ok(c) => c.map(|c| c.name).unwrap_or_default(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let summary = aggregate(&learner, &range, training);
        out.push(json!({
            "trainingId": training.id,
            "trainingName": training.display_name(&category_name),
            "activities": summary.activities,
            "counted": summary.counted,
            "credited": summary.credited,
            "totalMinutes": summary.total_minutes,
            "totalLabel": parse_minutes_to_hours(summary.total_minutes),
        }));
    }

    ok(
        &req.id,
        json!({
            "learner": {
                "id": learner.id,
                "firstname": learner.firstname,
                "lastname": learner.lastname,
                "fullName": learner.full_name(),
            },
            "range": range,
            "trainings": out,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "learners.list" => Some(handle_learners_list(state, req)),
        "learner.details" => Some(handle_learner_details(state, req)),
        _ => None,
    }
}
