use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryIn {
    id: i64,
    name: String,
    #[serde(default)]
    description: String,
    parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseIn {
    id: i64,
    category_id: i64,
    fullname: String,
    #[serde(default = "default_true")]
    enable_completion: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModuleIn {
    id: i64,
    name: String,
    #[serde(default = "default_true")]
    visible: bool,
    #[serde(default)]
    is_resource: bool,
}

/// A course module together with its module instance record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityIn {
    id: i64,
    course_id: i64,
    module_id: i64,
    instance_id: i64,
    name: String,
    #[serde(default)]
    intro: Option<String>,
    #[serde(default)]
    section: i64,
    #[serde(default)]
    sort_order: i64,
    #[serde(default = "default_true")]
    visible: bool,
    #[serde(default)]
    availability: Option<String>,
    #[serde(default)]
    deletion_in_progress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserIn {
    id: i64,
    firstname: String,
    lastname: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrolmentIn {
    course_id: i64,
    user_id: i64,
    #[serde(default = "default_role")]
    role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionIn {
    activity_id: i64,
    user_id: i64,
    state: i64,
    time_modified: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostImport {
    #[serde(default)]
    categories: Vec<CategoryIn>,
    #[serde(default)]
    courses: Vec<CourseIn>,
    #[serde(default)]
    modules: Vec<ModuleIn>,
    #[serde(default)]
    activities: Vec<ActivityIn>,
    #[serde(default)]
    users: Vec<UserIn>,
    #[serde(default)]
    enrolments: Vec<EnrolmentIn>,
    #[serde(default)]
    completions: Vec<CompletionIn>,
}

fn default_true() -> bool {
    true
}

fn default_role() -> String {
    crate::factories::STUDENT_ROLE.to_string()
}

/// Upserts every record in one transaction, then recomputes category paths.
fn import(conn: &Connection, data: &HostImport) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    for c in &data.categories {
        tx.execute(
            "INSERT INTO categories(id, name, description, parent_id, path) VALUES(?, ?, ?, ?, '')
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                parent_id = excluded.parent_id",
            (c.id, &c.name, &c.description, c.parent_id),
        )?;
    }
    for c in &data.courses {
        tx.execute(
            "INSERT INTO courses(id, category_id, fullname, enable_completion) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                category_id = excluded.category_id,
                fullname = excluded.fullname,
                enable_completion = excluded.enable_completion",
            (c.id, c.category_id, &c.fullname, c.enable_completion),
        )?;
    }
    for m in &data.modules {
        tx.execute(
            "INSERT INTO modules(id, name, visible, is_resource) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                visible = excluded.visible,
                is_resource = excluded.is_resource",
            (m.id, &m.name, m.visible, m.is_resource),
        )?;
    }
    for a in &data.activities {
        tx.execute(
            "INSERT INTO module_instances(module_id, id, name, intro) VALUES(?, ?, ?, ?)
             ON CONFLICT(module_id, id) DO UPDATE SET name = excluded.name, intro = excluded.intro",
            (a.module_id, a.instance_id, &a.name, &a.intro),
        )?;
        tx.execute(
            "INSERT INTO course_modules(id, course_id, module_id, instance_id, section, sort_order,
                                        visible, availability, deletion_in_progress)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                course_id = excluded.course_id,
                module_id = excluded.module_id,
                instance_id = excluded.instance_id,
                section = excluded.section,
                sort_order = excluded.sort_order,
                visible = excluded.visible,
                availability = excluded.availability,
                deletion_in_progress = excluded.deletion_in_progress",
            (
                a.id,
                a.course_id,
                a.module_id,
                a.instance_id,
                a.section,
                a.sort_order,
                a.visible,
                &a.availability,
                a.deletion_in_progress,
            ),
        )?;
    }
    for u in &data.users {
        tx.execute(
            "INSERT INTO users(id, firstname, lastname) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET firstname = excluded.firstname, lastname = excluded.lastname",
            (u.id, &u.firstname, &u.lastname),
        )?;
    }
    for e in &data.enrolments {
        tx.execute(
            "INSERT OR IGNORE INTO enrolments(course_id, user_id, role) VALUES(?, ?, ?)",
            (e.course_id, e.user_id, &e.role),
        )?;
    }
    for c in &data.completions {
        tx.execute(
            "INSERT INTO completions(course_module_id, user_id, completion_state, time_modified)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(course_module_id, user_id) DO UPDATE SET
                completion_state = excluded.completion_state,
                time_modified = excluded.time_modified",
            (c.activity_id, c.user_id, c.state, c.time_modified),
        )?;
    }
    rebuild_category_paths(&tx)?;
    tx.commit()?;
    Ok(())
}

/// Category paths in the host's `/root/child` form, derived from parent links.
fn rebuild_category_paths(conn: &Connection) -> anyhow::Result<()> {
    let parents: HashMap<i64, Option<i64>> = {
        let mut stmt = conn.prepare("SELECT id, parent_id FROM categories")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        rows
    };
    for &id in parents.keys() {
        let mut chain = vec![id];
        let mut cursor = parents.get(&id).copied().flatten();
        while let Some(p) = cursor {
            if chain.contains(&p) {
                anyhow::bail!("category {} has a cyclic parent chain", id);
            }
            chain.push(p);
            cursor = parents.get(&p).copied().flatten();
        }
        let path: String = chain.iter().rev().map(|c| format!("/{}", c)).collect();
        conn.execute("UPDATE categories SET path = ? WHERE id = ?", (path, id))?;
    }
    Ok(())
}

fn handle_host_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let data: HostImport = match serde_json::from_value(req.params.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    if let Err(e) = import(conn, &data) {
        return err(&req.id, "db_update_failed", format!("{e:#}"), None);
    }
    state.module_names.clear();
    tracing::info!(
        categories = data.categories.len(),
        courses = data.courses.len(),
        activities = data.activities.len(),
        users = data.users.len(),
        completions = data.completions.len(),
        "host records imported"
    );
    ok(
        &req.id,
        json!({
            "categories": data.categories.len(),
            "courses": data.courses.len(),
            "modules": data.modules.len(),
            "activities": data.activities.len(),
            "users": data.users.len(),
            "enrolments": data.enrolments.len(),
            "completions": data.completions.len(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "host.import" => Some(handle_host_import(state, req)),
        _ => None,
    }
}
