mod test_support;

use serde_json::{json, Value};
use test_support::{error_code, request, request_ok, seed_training, spawn_sidecar, temp_dir};

fn activity_ids(list: &Value) -> Vec<i64> {
    list["courses"]
        .as_array()
        .expect("courses")
        .iter()
        .flat_map(|c| c["activities"].as_array().cloned().unwrap_or_default())
        .filter_map(|a| a["id"].as_i64())
        .collect()
}

#[test]
fn training_flag_and_settings_round_trip() {
    let workspace = temp_dir("attestd-training-flag");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let training_id = seed_training(&mut stdin, &mut reader, workspace.path());

    let listed = request_ok(&mut stdin, &mut reader, "1", "trainings.list", json!({}));
    let trainings = listed["trainings"].as_array().expect("trainings");
    assert_eq!(trainings.len(), 1);
    // an unnamed training shows its category name
    assert_eq!(trainings[0]["name"], "Nursing");
    let flags: Vec<(i64, bool)> = listed["categories"]
        .as_array()
        .expect("categories")
        .iter()
        .map(|c| (c["id"].as_i64().expect("id"), c["isTraining"] == true))
        .collect();
    assert_eq!(flags, vec![(1, true), (2, false), (3, false)]);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "training.update",
        json!({ "trainingId": training_id, "name": "Nursing 2024", "group1": "type", "group2": "name" }),
    );
    assert_eq!(updated["template"]["group1"], "type");
    assert_eq!(updated["template"]["group2"], "name");

    let bad = request(
        &mut stdin,
        &mut reader,
        "3",
        "training.update",
        json!({ "trainingId": training_id, "name": "Renamed", "group1": "colour" }),
    );
    assert_eq!(error_code(&bad), "bad_params");
    let missing_template = request(
        &mut stdin,
        &mut reader,
        "4",
        "training.update",
        json!({ "trainingId": training_id, "templateId": 77 }),
    );
    assert_eq!(error_code(&missing_template), "not_found");

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "training.get",
        json!({ "categoryId": 1 }),
    );
    assert_eq!(got["isTraining"], true);
    // the rejected update did not rename
    assert_eq!(got["training"]["displayName"], "Nursing 2024");
    assert_eq!(got["training"]["learnerCount"], 3);
    assert_eq!(got["training"]["template"]["group2"], "name");

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "training.update",
        json!({ "trainingId": training_id, "group2": null }),
    );
    assert!(cleared["template"]["group2"].is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "training.setEnabled",
        json!({ "categoryId": 1, "enabled": false }),
    );
    let off = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "training.get",
        json!({ "categoryId": 1 }),
    );
    assert_eq!(off["isTraining"], false);
    assert!(off["training"].is_null());

    let unknown = request(
        &mut stdin,
        &mut reader,
        "9",
        "training.setEnabled",
        json!({ "categoryId": 404, "enabled": true }),
    );
    assert_eq!(error_code(&unknown), "not_found");
}

#[test]
fn milestone_editor_filters_and_updates() {
    let workspace = temp_dir("attestd-milestones");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let training_id = seed_training(&mut stdin, &mut reader, workspace.path());

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "milestones.list",
        json!({ "trainingId": training_id }),
    );
    assert_eq!(activity_ids(&all), vec![1000, 1001, 2000]);
    assert_eq!(all["courses"][0]["totalMinutes"], 90);
    assert_eq!(all["moduleTypes"], json!(["quiz", "resource"]));
    assert_eq!(all["inputSuffix"], "minutes");

    let hidden = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "milestones.list",
        json!({ "trainingId": training_id, "visibility": 2 }),
    );
    assert_eq!(activity_ids(&hidden), vec![1001]);
    let no_resources = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "milestones.list",
        json!({ "trainingId": training_id, "type": 1 }),
    );
    assert_eq!(activity_ids(&no_resources), vec![1000, 2000]);
    let by_name = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "milestones.list",
        json!({ "trainingId": training_id, "name": "HANDS", "restriction": 1 }),
    );
    assert_eq!(activity_ids(&by_name), vec![2000]);

    // one bad entry rejects the whole batch
    let rejected = request(
        &mut stdin,
        &mut reader,
        "5",
        "milestones.update",
        json!({ "updates": [
            { "activityId": 1001, "minutes": 30 },
            { "activityId": 2000, "minutes": -5 }
        ] }),
    );
    assert_eq!(error_code(&rejected), "bad_params");
    let unknown = request(
        &mut stdin,
        &mut reader,
        "6",
        "milestones.update",
        json!({ "updates": [{ "activityId": 9999, "minutes": 30 }] }),
    );
    assert_eq!(error_code(&unknown), "not_found");

    let unchanged = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "milestones.list",
        json!({ "trainingId": training_id }),
    );
    assert!(unchanged["courses"][0]["activities"][1]["milestone"].is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "milestones.update",
        json!({ "updates": [
            { "activityId": 1001, "minutes": 30 },
            { "activityId": 1000, "minutes": 60 }
        ] }),
    );
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "milestones.list",
        json!({ "trainingId": training_id }),
    );
    assert_eq!(saved["courses"][0]["totalMinutes"], 90);

    // clearing falls back to the value in the description
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "milestones.update",
        json!({ "updates": [{ "activityId": 1000, "minutes": null }] }),
    );
    let reverted = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "milestones.list",
        json!({ "trainingId": training_id }),
    );
    assert_eq!(reverted["courses"][0]["activities"][0]["milestone"], 90);
    assert_eq!(reverted["courses"][0]["totalMinutes"], 120);
}

#[test]
fn learner_totals_follow_the_date_window() {
    let workspace = temp_dir("attestd-learners");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let training_id = seed_training(&mut stdin, &mut reader, workspace.path());

    let all_time = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "learners.list",
        json!({ "trainingId": training_id }),
    );
    let rows: Vec<(i64, i64, i64)> = all_time["learners"]
        .as_array()
        .expect("learners")
        .iter()
        .map(|l| {
            (
                l["learnerId"].as_i64().expect("id"),
                l["validatedCount"].as_i64().expect("count"),
                l["totalMinutes"].as_i64().expect("total"),
            )
        })
        .collect();
    assert_eq!(rows, vec![(9, 1, 45), (7, 3, 135), (8, 0, 0)]);

    let january = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "learners.list",
        json!({ "trainingId": training_id, "begin": "2024-01-01", "end": "2024-02-01" }),
    );
    let ada = january["learners"]
        .as_array()
        .expect("learners")
        .iter()
        .find(|l| l["learnerId"] == 7)
        .cloned()
        .expect("ada");
    assert_eq!(ada["validatedCount"], 2);
    assert_eq!(ada["totalLabel"], "1h30");

    let details = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "learner.details",
        json!({ "learnerId": 9 }),
    );
    assert_eq!(details["learner"]["fullName"], "Grace Hopper");
    let trainings = details["trainings"].as_array().expect("trainings");
    assert_eq!(trainings.len(), 1);
    // the course outside the training is not counted
    assert_eq!(trainings[0]["totalMinutes"], 45);
    assert_eq!(trainings[0]["activities"][0]["courseName"], "Hygiene");

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "4",
        "learners.list",
        json!({ "trainingId": training_id, "begin": "01/02/2024" }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");
}

#[test]
fn unbounded_description_values_flow_into_totals() {
    let workspace = temp_dir("attestd-unbounded");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let mut host = test_support::host_fixture();
    host["activities"][0]["intro"] = json!("<span class=\"tps_jalon\">99999999999999999999</span>");
    host["activities"][2]["intro"] = json!("<span class=\"tps_jalon\">-30</span>");
    let _ = request_ok(&mut stdin, &mut reader, "2", "host.import", host);
    let enabled = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "training.setEnabled",
        json!({ "categoryId": 1, "enabled": true }),
    );
    let training_id = enabled["trainingId"].as_i64().expect("training id");

    let milestones = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "milestones.list",
        json!({ "trainingId": training_id }),
    );
    assert_eq!(milestones["courses"][0]["totalMinutes"], i64::MAX);
    assert_eq!(milestones["courses"][1]["totalMinutes"], -30);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "learners.list",
        json!({ "trainingId": training_id }),
    );
    let by_id = |id: i64| {
        listed["learners"]
            .as_array()
            .expect("learners")
            .iter()
            .find(|l| l["learnerId"] == id)
            .cloned()
            .expect("learner")
    };
    let ada = by_id(7);
    let ada_total = i64::MAX - 30;
    assert_eq!(ada["totalMinutes"], ada_total);
    assert_eq!(
        ada["totalLabel"],
        format!("{}h{:02}", ada_total / 60, ada_total % 60)
    );
    let grace = by_id(9);
    assert_eq!(grace["totalMinutes"], -30);
    assert_eq!(grace["totalLabel"], "-0h30");

    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "certificate.generate",
        json!({ "trainingId": training_id, "learnerId": 7 }),
    );
    assert_eq!(generated["totalMinutes"], ada_total);
}

#[test]
fn reimported_module_names_replace_cached_ones() {
    let workspace = temp_dir("attestd-reimport");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let training_id = seed_training(&mut stdin, &mut reader, workspace.path());

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "milestones.list",
        json!({ "trainingId": training_id }),
    );
    assert_eq!(before["moduleTypes"], json!(["quiz", "resource"]));

    let mut host = test_support::host_fixture();
    host["modules"][0]["name"] = json!("assign");
    let _ = request_ok(&mut stdin, &mut reader, "2", "host.import", host);
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "milestones.list",
        json!({ "trainingId": training_id }),
    );
    assert_eq!(after["moduleTypes"], json!(["assign", "resource"]));
}
