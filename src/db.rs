use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "attestd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    create_host_tables(&conn)?;
    create_plugin_tables(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    crate::template::ensure_site_default(&conn)?;
    Ok(conn)
}

/// Records owned by the host platform. The daemon only reads them; they are
/// loaded through `host.import`.
fn create_host_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            parent_id INTEGER,
            path TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id INTEGER PRIMARY KEY,
            category_id INTEGER NOT NULL,
            fullname TEXT NOT NULL,
            enable_completion INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_category ON courses(category_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS modules(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            visible INTEGER NOT NULL DEFAULT 1,
            is_resource INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS module_instances(
            module_id INTEGER NOT NULL,
            id INTEGER NOT NULL,
            name TEXT NOT NULL,
            intro TEXT,
            PRIMARY KEY(module_id, id),
            FOREIGN KEY(module_id) REFERENCES modules(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_modules(
            id INTEGER PRIMARY KEY,
            course_id INTEGER NOT NULL,
            module_id INTEGER NOT NULL,
            instance_id INTEGER NOT NULL,
            section INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,
            visible INTEGER NOT NULL DEFAULT 1,
            availability TEXT,
            deletion_in_progress INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(module_id) REFERENCES modules(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_modules_course ON course_modules(course_id, section, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id INTEGER PRIMARY KEY,
            firstname TEXT NOT NULL,
            lastname TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrolments(
            course_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL DEFAULT 'student',
            PRIMARY KEY(course_id, user_id, role),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS completions(
            course_module_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            completion_state INTEGER NOT NULL,
            time_modified INTEGER NOT NULL,
            PRIMARY KEY(course_module_id, user_id),
            FOREIGN KEY(course_module_id) REFERENCES course_modules(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_completions_user ON completions(user_id)",
        [],
    )?;
    Ok(())
}

fn create_plugin_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS trainings(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL DEFAULT '',
            category_id INTEGER NOT NULL UNIQUE
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS milestones(
            module_id INTEGER PRIMARY KEY,
            credited_time INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS templates(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            owner_training_id INTEGER
        )",
        [],
    )?;
    if !table_has_column(conn, "templates", "owner_training_id")? {
        conn.execute("ALTER TABLE templates ADD COLUMN owner_training_id INTEGER", [])?;
    }
    conn.execute(
        "CREATE TABLE IF NOT EXISTS template_details(
            template_id INTEGER NOT NULL,
            type TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY(template_id, type),
            FOREIGN KEY(template_id) REFERENCES templates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS train_template(
            training_id INTEGER PRIMARY KEY,
            template_id INTEGER NOT NULL,
            grp_criteria1 TEXT NOT NULL DEFAULT 'coursename',
            grp_criteria2 TEXT,
            FOREIGN KEY(training_id) REFERENCES trainings(id) ON DELETE CASCADE,
            FOREIGN KEY(template_id) REFERENCES templates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS launch_log(
            id TEXT PRIMARY KEY,
            time_generated INTEGER NOT NULL,
            begin_date TEXT,
            end_date TEXT,
            operator_id INTEGER
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS certif_log(
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            status TEXT NOT NULL,
            training_id INTEGER NOT NULL,
            learner_id INTEGER NOT NULL,
            launch_id TEXT NOT NULL,
            sha256 TEXT,
            message TEXT,
            FOREIGN KEY(launch_id) REFERENCES launch_log(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certif_log_launch ON certif_log(launch_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS value_log(
            certificate_id TEXT NOT NULL,
            module_id INTEGER NOT NULL,
            credited_time INTEGER,
            FOREIGN KEY(certificate_id) REFERENCES certif_log(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_value_log_certificate ON value_log(certificate_id)",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => {
            let v = serde_json::from_str(&text)
                .with_context(|| format!("settings value for {} is not valid json", key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_host_tables(&conn)?;
    create_plugin_tables(&conn)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;
    crate::template::ensure_site_default(&conn)?;
    Ok(conn)
}
