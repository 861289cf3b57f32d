use crate::credits::{parse_date_range, DateRange};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::storage::FileStore;
use serde_json::Value;

pub fn no_workspace(req: &Request) -> Value {
    err(&req.id, "no_workspace", "select a workspace first", None)
}

pub fn files(state: &AppState) -> Option<FileStore> {
    state.workspace.as_deref().map(FileStore::new)
}

pub fn require_i64(req: &Request, key: &str) -> Result<i64, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing params.{}", key), None))
}

pub fn optional_i64(req: &Request, key: &str) -> Result<Option<i64>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("params.{} must be an integer", key),
                None,
            )
        }),
    }
}

pub fn require_str<'a>(req: &'a Request, key: &str) -> Result<&'a str, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing params.{}", key), None))
}

pub fn date_range(req: &Request) -> Result<DateRange, Value> {
    parse_date_range(&req.params).map_err(|e| err(&req.id, &e.code, e.message, e.details))
}
