use crate::certificate::{CertificateGenerator, CertificateSettings};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{files, no_workspace, require_i64, require_str};
use crate::ipc::types::{AppState, Request};
use crate::pdf::decode_background;
use crate::template::{placement_from_json, FieldKind, FieldPlacement, TemplateError, TemplateStore};
use serde_json::{json, Value};
use std::path::PathBuf;

fn template_err(req: &Request, e: &TemplateError, db_code: &str) -> Value {
    let code = match e {
        TemplateError::NotFound(_) => "not_found",
        TemplateError::UnknownKind(_) | TemplateError::Invalid(_) => "bad_params",
        TemplateError::Decode { .. } => "template_corrupt",
        TemplateError::Db(_) => db_code,
    };
    err(&req.id, code, e.to_string(), None)
}

fn placements_json(placements: &[FieldPlacement]) -> Vec<Value> {
    placements.iter().map(|p| p.to_json()).collect()
}

fn handle_templates_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    match TemplateStore::new(conn).list() {
        Ok(templates) => ok(&req.id, json!({ "templates": templates })),
        Err(e) => template_err(req, &e, "db_query_failed"),
    }
}

fn handle_template_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let template_id = match require_i64(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let store = TemplateStore::new(conn);
    let name = match store.name(template_id) {
        Ok(Some(n)) => n,
        Ok(None) => return err(&req.id, "not_found", "template not found", None),
        Err(e) => return template_err(req, &e, "db_query_failed"),
    };
    match store.load(template_id) {
        Ok(placements) => ok(
            &req.id,
            json!({
                "id": template_id,
                "name": name,
                "placements": placements_json(&placements),
            }),
        ),
        Err(e) => template_err(req, &e, "db_query_failed"),
    }
}

fn handle_template_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match TemplateStore::new(conn).create(name) {
        Ok(id) => ok(&req.id, json!({ "templateId": id })),
        Err(e) => template_err(req, &e, "db_update_failed"),
    }
}

fn handle_template_for_training(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let training_id = match require_i64(req, "trainingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match TemplateStore::new(conn).ensure_for_training(training_id) {
        Ok(id) => ok(&req.id, json!({ "trainingId": training_id, "templateId": id })),
        Err(TemplateError::Invalid(msg)) => err(&req.id, "not_found", msg, None),
        Err(e) => template_err(req, &e, "db_update_failed"),
    }
}

/// Replaces the text placements. The stored background survives unless the
/// request carries its own background placement or sets `clearBackground`.
fn handle_template_save(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let template_id = match require_i64(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(raw) = req.params.get("placements").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing params.placements", None);
    };
    let clear_background = req
        .params
        .get("clearBackground")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut placements = Vec::with_capacity(raw.len() + 1);
    for (i, p) in raw.iter().enumerate() {
        match placement_from_json(p) {
            Ok(fp) => placements.push(fp),
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    e.to_string(),
                    Some(json!({ "index": i })),
                )
            }
        }
    }

    let store = TemplateStore::new(conn);
    let has_background = placements
        .iter()
        .any(|p| p.kind() == FieldKind::Background);
    if !has_background && !clear_background {
        match store.background(template_id) {
            Ok(Some(filename)) => placements.push(FieldPlacement::Background { filename }),
            Ok(None) => {}
            Err(e) => return template_err(req, &e, "db_query_failed"),
        }
    }
    match store.save(template_id, &placements) {
        Ok(()) => ok(
            &req.id,
            json!({
                "templateId": template_id,
                "placements": placements_json(&placements),
            }),
        ),
        Err(e) => template_err(req, &e, "db_update_failed"),
    }
}

fn handle_template_set_background(state: &mut AppState, req: &Request) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), files(state)) else {
        return no_workspace(req);
    };
    let template_id = match require_i64(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let source = match require_str(req, "path") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };
    let templates = TemplateStore::new(conn);
    match templates.name(template_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "template not found", None),
        Err(e) => return template_err(req, &e, "db_query_failed"),
    }

    let bytes = match std::fs::read(&source) {
        Ok(b) => b,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("cannot read {}: {}", source.display(), e),
                None,
            )
        }
    };
    let (width, height) = match decode_background(&bytes) {
        Ok(bg) => (bg.width, bg.height),
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("not a PNG or JPEG image: {}", e),
                None,
            )
        }
    };

    let staged = match store.import_background(template_id, &source) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "storage_failed", format!("{e:#}"), None),
    };
    if let Err(e) = templates.set_background(template_id, &staged.filename) {
        if let Err(cleanup) = store.discard_background(template_id, &staged) {
            tracing::warn!(template_id, error = %format!("{cleanup:#}"), "staged background not removed");
        }
        return template_err(req, &e, "db_update_failed");
    }
    if let Err(e) = store.commit_background(template_id, &staged.filename) {
        tracing::warn!(template_id, error = %format!("{e:#}"), "previous background not removed");
    }
    let filename = staged.filename;
    tracing::info!(template_id, filename = %filename, width, height, "template background imported");
    ok(
        &req.id,
        json!({
            "templateId": template_id,
            "filename": filename,
            "width": width,
            "height": height,
        }),
    )
}

fn handle_template_preview(state: &mut AppState, req: &Request) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), files(state)) else {
        return no_workspace(req);
    };
    let template_id = match require_i64(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let generator = CertificateGenerator::new(conn, &store, CertificateSettings::load(conn));
    match generator.preview(template_id) {
        Ok(path) => ok(&req.id, json!({ "templateId": template_id, "path": path })),
        Err(e) => err(&req.id, e.code(), e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "templates.list" => Some(handle_templates_list(state, req)),
        "template.get" => Some(handle_template_get(state, req)),
        "template.create" => Some(handle_template_create(state, req)),
        "template.forTraining" => Some(handle_template_for_training(state, req)),
        "template.save" => Some(handle_template_save(state, req)),
        "template.setBackground" => Some(handle_template_set_background(state, req)),
        "template.preview" => Some(handle_template_preview(state, req)),
        _ => None,
    }
}
