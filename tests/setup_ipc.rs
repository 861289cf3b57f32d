mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, seed_training, spawn_sidecar, temp_dir};

#[test]
fn setup_defaults_and_validated_patches() {
    let workspace = temp_dir("attestd-setup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(defaults["certificates"]["dateFormat"], "%d/%m/%Y");
    assert_eq!(defaults["certificates"]["orientation"], "portrait");
    assert_eq!(defaults["certificates"]["compressPdf"], true);
    assert_eq!(defaults["certificates"]["filenamePrefix"], "certificate");
    assert_eq!(defaults["milestones"]["inputSuffix"], "minutes");
    assert_eq!(defaults["milestones"]["defaultRestrictFilter"], 0);

    // a bad field rejects the whole patch
    let rejected = request(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({
            "section": "certificates",
            "patch": { "orientation": "landscape", "dateFormat": "%Q" }
        }),
    );
    assert_eq!(error_code(&rejected), "bad_params");
    let unchanged = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(unchanged["certificates"]["orientation"], "portrait");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({
            "section": "certificates",
            "patch": { "orientation": "Landscape", "filenamePrefix": "attestation" }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({ "section": "milestones", "patch": { "defaultVisibilityFilter": 1 } }),
    );
    let saved = request_ok(&mut stdin, &mut reader, "7", "setup.get", json!({}));
    assert_eq!(saved["certificates"]["orientation"], "landscape");
    assert_eq!(saved["certificates"]["filenamePrefix"], "attestation");
    assert_eq!(saved["milestones"]["defaultVisibilityFilter"], 1);

    let unknown = request(
        &mut stdin,
        &mut reader,
        "8",
        "setup.update",
        json!({ "section": "grades", "patch": {} }),
    );
    assert_eq!(error_code(&unknown), "bad_params");
}

#[test]
fn certificate_settings_shape_generated_files() {
    let workspace = temp_dir("attestd-setup-certs");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let training_id = seed_training(&mut stdin, &mut reader, workspace.path());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "setup.update",
        json!({
            "section": "certificates",
            "patch": { "orientation": "landscape", "filenamePrefix": "attestation" }
        }),
    );
    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "certificate.generate",
        json!({ "trainingId": training_id, "learnerId": 7 }),
    );
    let filename = generated["filename"].as_str().expect("filename");
    assert_eq!(
        filename,
        format!("attestation_LovelaceAda_7_{}_all_all.pdf", training_id)
    );

    let path = workspace.path().join("files/certificates").join(filename);
    let doc = lopdf::Document::load(&path).expect("load pdf");
    let page_id = *doc.get_pages().values().next().expect("page");
    let page = doc.get_dictionary(page_id).expect("page dictionary");
    let media_box = page
        .get(b"MediaBox")
        .and_then(|o| o.as_array())
        .expect("media box");
    let dims: Vec<f32> = media_box
        .iter()
        .map(|o| o.as_float().expect("number"))
        .collect();
    // landscape A4
    assert!(dims[2] > dims[3], "{:?}", dims);
}
