use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_lessond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lessond");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn setup_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        stdin,
        reader,
        "class",
        "classes.create",
        json!({
            "name": "Override 101",
            "grade": ["4"],
            "teacherEmail": "teacher@institute1001"
        }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let words: Vec<serde_json::Value> = (0..4)
        .map(|i| {
            json!({
                "vocabId": format!("v1_{:02}", i),
                "word": format!("word{}", i),
                "level": 1,
                "wordNo": i,
                "meaningKor": format!("뜻{}", i)
            })
        })
        .collect();
    let _ = request_ok(
        stdin,
        reader,
        "vocab",
        "materials.vocab.import",
        json!({ "words": words }),
    );

    let _ = request_ok(
        stdin,
        reader,
        "cur",
        "curriculum.save",
        json!({
            "classId": class_id,
            "curriculum": {
                "numberOfDays": 4,
                "classFormat": [
                    { "type": "vocab", "level": 1 },
                    { "type": "vocab", "level": 1 }
                ]
            }
        }),
    );
    class_id
}

fn resolve(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    day: i64,
    slot: i64,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &format!("resolve-{}-{}", day, slot),
        "activity.resolve",
        json!({ "classId": class_id, "day": day, "slot": slot }),
    )
}

#[test]
fn single_override_pins_one_slot_only() {
    let workspace = temp_dir("lessond-override-single");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = setup_class(&mut stdin, &mut reader, &workspace);

    // Rotation would give day 2 slot 0 the third word.
    let before = resolve(&mut stdin, &mut reader, &class_id, 2, 0);
    assert_eq!(before.get("materialId").and_then(|v| v.as_str()), Some("v1_02"));
    assert_eq!(before.get("overridden").and_then(|v| v.as_bool()), Some(false));

    let written = request_ok(
        &mut stdin,
        &mut reader,
        "modify",
        "activity.modify",
        json!({
            "classId": class_id,
            "activityId": "day-2-activity-0",
            "materialId": "v1_00",
            "scope": "single"
        }),
    );
    assert_eq!(written.get("written").and_then(|v| v.as_u64()), Some(1));

    let pinned = resolve(&mut stdin, &mut reader, &class_id, 2, 0);
    assert_eq!(pinned.get("materialId").and_then(|v| v.as_str()), Some("v1_00"));
    assert_eq!(pinned.get("overridden").and_then(|v| v.as_bool()), Some(true));

    // Neighbours keep their rotation picks.
    let same_day_other_slot = resolve(&mut stdin, &mut reader, &class_id, 2, 1);
    assert_eq!(
        same_day_other_slot.get("materialId").and_then(|v| v.as_str()),
        Some("v1_03")
    );
    let day_before = resolve(&mut stdin, &mut reader, &class_id, 1, 0);
    assert_eq!(day_before.get("materialId").and_then(|v| v.as_str()), Some("v1_00"));
    let day_after = resolve(&mut stdin, &mut reader, &class_id, 3, 0);
    assert_eq!(day_after.get("materialId").and_then(|v| v.as_str()), Some("v1_00"));
    assert_eq!(day_after.get("overridden").and_then(|v| v.as_bool()), Some(false));

    let overrides = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "overrides.list",
        json!({ "classId": class_id }),
    );
    let rows = overrides
        .get("overrides")
        .and_then(|v| v.as_array())
        .expect("overrides array");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("activityId").and_then(|v| v.as_str()),
        Some("day-2-activity-0")
    );

    let _ = child.kill();
}

#[test]
fn stale_override_falls_back_to_rotation() {
    let workspace = temp_dir("lessond-override-stale");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = setup_class(&mut stdin, &mut reader, &workspace);

    // Pin a material id that is not in the level-1 catalog. The write itself
    // succeeds; resolution treats it as stale and uses the rotation pick.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "modify",
        "activity.modify",
        json!({
            "classId": class_id,
            "activityId": "day-1-activity-0",
            "materialId": "v1_gone",
            "scope": "single"
        }),
    );

    let resolved = resolve(&mut stdin, &mut reader, &class_id, 1, 0);
    assert_eq!(resolved.get("materialId").and_then(|v| v.as_str()), Some("v1_00"));
    assert_eq!(resolved.get("overridden").and_then(|v| v.as_bool()), Some(false));

    let _ = child.kill();
}

#[test]
fn override_survives_repeat_resolution() {
    let workspace = temp_dir("lessond-override-repeat");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = setup_class(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "modify",
        "activity.modify",
        json!({
            "classId": class_id,
            "activityId": "day-3-activity-1",
            "materialId": "v1_01",
            "scope": "single"
        }),
    );

    for _ in 0..3 {
        let resolved = resolve(&mut stdin, &mut reader, &class_id, 3, 1);
        assert_eq!(resolved.get("materialId").and_then(|v| v.as_str()), Some("v1_01"));
        assert_eq!(resolved.get("overridden").and_then(|v| v.as_bool()), Some(true));
    }

    let _ = child.kill();
}
