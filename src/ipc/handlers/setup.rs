use crate::certificate::{self, is_valid_date_format, CertificateSettings};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::pdf::Orientation;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Certificates,
    Milestones,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "certificates" => Some(Self::Certificates),
            "milestones" => Some(Self::Milestones),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Certificates => certificate::SETTINGS_KEY,
            Self::Milestones => MILESTONES_KEY,
        }
    }
}

pub const MILESTONES_KEY: &str = "setup.milestones";

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Certificates => CertificateSettings::default().to_json(),
        SetupSection::Milestones => json!({
            "inputSuffix": "minutes",
            "defaultRestrictFilter": 0,
            "defaultVisibilityFilter": 0
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Certificates => match k.as_str() {
                "dateFormat" => {
                    let s = parse_string_max(v, k, 32)?;
                    if !is_valid_date_format(&s) {
                        return Err(format!("dateFormat is not a valid date format: {}", s));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "orientation" => {
                    let s = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    if Orientation::parse(&s).is_none() {
                        return Err("orientation must be one of: portrait, landscape".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "compressPdf" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "periodAllTimeLabel" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 64)?));
                }
                "filenamePrefix" => {
                    let s = parse_string_max(v, k, 32)?;
                    if s.is_empty()
                        || !s
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                    {
                        return Err(
                            "filenamePrefix must be non-empty and use only letters, digits, _ or -"
                                .into(),
                        );
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown certificates field: {}", k)),
            },
            SetupSection::Milestones => match k.as_str() {
                "inputSuffix" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 16)?));
                }
                "defaultRestrictFilter" | "defaultVisibilityFilter" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 2)?));
                }
                _ => return Err(format!("unknown milestones field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut value = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        match (value.as_object_mut(), saved.as_object()) {
            (Some(base), Some(saved)) => {
                for (k, v) in saved {
                    if base.contains_key(k) {
                        base.insert(k.clone(), v.clone());
                    }
                }
            }
            _ => tracing::warn!(key = section.key(), "saved setup section is not an object"),
        }
    }
    Ok(value)
}

pub fn milestone_settings(conn: &Connection) -> Value {
    load_section(conn, SetupSection::Milestones).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "milestone settings unreadable, using defaults");
        default_section(SetupSection::Milestones)
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let certificates = match load_section(conn, SetupSection::Certificates) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let milestones = match load_section(conn, SetupSection::Milestones) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "certificates": certificates,
            "milestones": milestones
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section_raw, "setup updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
