#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub fn temp_dir(prefix: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .expect("create temp dir")
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_with_env(&[])
}

pub fn spawn_with_env(env: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_attestd");
    let mut cmd = Command::new(exe);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("ATTESTD_WORKSPACE");
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("spawn attestd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

pub fn error_code(value: &Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

/// Host records for one training: category 1 > category 2, course 10 in 1,
/// course 20 in 2, three learners of whom one never validated anything.
pub fn host_fixture() -> Value {
    json!({
        "categories": [
            { "id": 1, "name": "Nursing", "description": "Nursing school" },
            { "id": 2, "name": "Year 1", "parentId": 1 },
            { "id": 3, "name": "Other" }
        ],
        "courses": [
            { "id": 10, "categoryId": 1, "fullname": "Anatomy" },
            { "id": 20, "categoryId": 2, "fullname": "Hygiene" },
            { "id": 30, "categoryId": 3, "fullname": "Elsewhere" }
        ],
        "modules": [
            { "id": 1, "name": "quiz" },
            { "id": 2, "name": "resource", "isResource": true }
        ],
        "activities": [
            {
                "id": 1000, "courseId": 10, "moduleId": 1, "instanceId": 100,
                "name": "Bones quiz",
                "intro": "<p>Quiz <span class=\"tps_jalon\">90</span></p>",
                "section": 1
            },
            {
                "id": 1001, "courseId": 10, "moduleId": 2, "instanceId": 101,
                "name": "Skeleton notes", "intro": "<p>Read me<br></p>",
                "section": 1, "sortOrder": 1, "visible": false,
                "availability": "{\"op\":\"&\"}"
            },
            {
                "id": 2000, "courseId": 20, "moduleId": 1, "instanceId": 102,
                "name": "Hands quiz",
                "intro": "<span class='tps_jalon'>45</span>"
            },
            {
                "id": 3000, "courseId": 30, "moduleId": 1, "instanceId": 103,
                "name": "Elsewhere quiz",
                "intro": "<span class=\"tps_jalon\">600</span>"
            }
        ],
        "users": [
            { "id": 7, "firstname": "Ada", "lastname": "Lovelace" },
            { "id": 8, "firstname": "Alan", "lastname": "Turing" },
            { "id": 9, "firstname": "Grace", "lastname": "Hopper" }
        ],
        "enrolments": [
            { "courseId": 10, "userId": 7 },
            { "courseId": 20, "userId": 7 },
            { "courseId": 10, "userId": 8 },
            { "courseId": 20, "userId": 9 },
            { "courseId": 30, "userId": 9 },
            { "courseId": 10, "userId": 9, "role": "editingteacher" }
        ],
        "completions": [
            { "activityId": 1000, "userId": 7, "state": 1, "timeModified": 1704067200 },
            { "activityId": 1001, "userId": 7, "state": 1, "timeModified": 1704153600 },
            { "activityId": 2000, "userId": 7, "state": 1, "timeModified": 1706745600 },
            { "activityId": 1000, "userId": 8, "state": 0, "timeModified": 1704067200 },
            { "activityId": 2000, "userId": 9, "state": 1, "timeModified": 1709251200 },
            { "activityId": 3000, "userId": 9, "state": 1, "timeModified": 1709251200 }
        ]
    })
}

/// Imports the host fixture and flags category 1 as a training. Returns the
/// training id.
pub fn seed_training(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) -> i64 {
    let _ = request_ok(
        stdin,
        reader,
        "seed-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(stdin, reader, "seed-2", "host.import", host_fixture());
    let enabled = request_ok(
        stdin,
        reader,
        "seed-3",
        "training.setEnabled",
        json!({ "categoryId": 1, "enabled": true }),
    );
    enabled
        .get("trainingId")
        .and_then(|v| v.as_i64())
        .expect("training id")
}

pub fn write_png(path: &Path, width: u32, height: u32) {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([240, 230, 200]));
    img.save(path).expect("write png");
}
