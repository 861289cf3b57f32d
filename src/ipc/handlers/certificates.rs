use crate::certificate::{
    load_context, read_logs, CertificateError, CertificateGenerator, CertificateSettings,
    TrainingContext,
};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{date_range, files, no_workspace, optional_i64, require_i64};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn generation_err(req: &Request, e: &CertificateError) -> Value {
    err(&req.id, e.code(), e.to_string(), None)
}

/// Resolves `params.trainingId` to a loaded context, or the error response.
fn context(state: &mut AppState, req: &Request) -> Result<TrainingContext, Value> {
    let Some(conn) = state.db.as_ref() else {
        return Err(no_workspace(req));
    };
    let training_id = require_i64(req, "trainingId")?;
    match load_context(conn, &mut state.module_names, training_id) {
        Ok(Some(ctx)) => Ok(ctx),
        Ok(None) => Err(err(&req.id, "not_found", "training not found", None)),
        Err(e) => Err(generation_err(req, &e)),
    }
}

fn handle_certificate_generate(state: &mut AppState, req: &Request) -> Value {
    let learner_id = match require_i64(req, "learnerId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let range = match date_range(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let ctx = match context(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (Some(conn), Some(store)) = (state.db.as_ref(), files(state)) else {
        return no_workspace(req);
    };
    let Some(learner) = ctx.training.learners.get(&learner_id) else {
        return err(
            &req.id,
            "not_found",
            "learner is not enrolled in this training",
            Some(json!({ "learnerId": learner_id, "trainingId": ctx.training.id })),
        );
    };

    let generator = CertificateGenerator::new(conn, &store, CertificateSettings::load(conn));
    match generator.generate_one(&ctx, learner, &range) {
        Ok(g) => ok(
            &req.id,
            json!({
                "filename": g.filename,
                "status": g.status,
                "sha256": g.sha256,
                "totalMinutes": g.summary.total_minutes,
                "totalLabel": g.summary.total_label(),
            }),
        ),
        Err(e) => generation_err(req, &e),
    }
}

fn handle_certificates_generate_all(state: &mut AppState, req: &Request) -> Value {
    let range = match date_range(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let operator_id = match optional_i64(req, "operatorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = match context(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (Some(conn), Some(store)) = (state.db.as_ref(), files(state)) else {
        return no_workspace(req);
    };

    let generator = CertificateGenerator::new(conn, &store, CertificateSettings::load(conn));
    match generator.generate_all(&ctx, &range, operator_id) {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => generation_err(req, &e),
    }
}

fn handle_certificates_zip(state: &mut AppState, req: &Request) -> Value {
    let range = match date_range(req) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let ctx = match context(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let (Some(conn), Some(store)) = (state.db.as_ref(), files(state)) else {
        return no_workspace(req);
    };

    let generator = CertificateGenerator::new(conn, &store, CertificateSettings::load(conn));
    match generator.bundle(&ctx, &range) {
        Ok(report) => {
            tracing::info!(
                training_id = ctx.training.id,
                included = report.included.len(),
                missing = report.missing.len(),
                "certificate bundle written"
            );
            ok(&req.id, json!(report))
        }
        Err(e) => generation_err(req, &e),
    }
}

fn handle_certificates_log(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(req);
    };
    let training_id = match optional_i64(req, "trainingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match read_logs(conn, training_id) {
        Ok(launches) => ok(&req.id, json!({ "launches": launches })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "certificate.generate" => Some(handle_certificate_generate(state, req)),
        "certificates.generateAll" => Some(handle_certificates_generate_all(state, req)),
        "certificates.zip" => Some(handle_certificates_zip(state, req)),
        "certificates.log" => Some(handle_certificates_log(state, req)),
        _ => None,
    }
}
