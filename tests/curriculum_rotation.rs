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

fn seed_workspace(
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
            "name": "Rotation 101",
            "grade": ["5"],
            "teacherEmail": "teacher@institute1001"
        }),
    );
    created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string()
}

fn seed_vocab_level1(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, count: usize) {
    let words: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            json!({
                "vocabId": format!("v1_{:02}", i),
                "word": format!("word{}", i),
                "level": 1,
                "wordNo": i,
                "partOfSpeech": "n",
                "meaningKor": format!("뜻{}", i),
                "meaningEng": format!("meaning {}", i)
            })
        })
        .collect();
    let res = request_ok(
        stdin,
        reader,
        "vocab",
        "materials.vocab.import",
        json!({ "words": words }),
    );
    assert_eq!(res.get("imported").and_then(|v| v.as_u64()), Some(count as u64));
}

fn seed_reading_level2(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, count: usize) {
    for i in 0..count {
        let _ = request_ok(
            stdin,
            reader,
            &format!("reading-{}", i),
            "materials.reading.upsert",
            json!({
                "unit": {
                    "id": format!("reading_2_{}", i),
                    "level": 2,
                    "unitNo": i,
                    "title": format!("Unit {}", i),
                    "passage": "Once upon a time.",
                    "questions": [
                        { "question_text": "What happened?", "options": ["a", "b"], "answer": "a" }
                    ],
                    "vocabWords": []
                }
            }),
        );
    }
}

fn resolve_material_id(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    day: i64,
    slot: i64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("resolve-{}-{}", day, slot),
        "activity.resolve",
        json!({ "classId": class_id, "day": day, "slot": slot }),
    );
    res.get("materialId")
        .and_then(|v| v.as_str())
        .expect("materialId")
        .to_string()
}

#[test]
fn rotation_walks_catalog_without_intra_day_collisions() {
    let workspace = temp_dir("lessond-rotation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = seed_workspace(&mut stdin, &mut reader, &workspace);
    seed_vocab_level1(&mut stdin, &mut reader, 4);
    seed_reading_level2(&mut stdin, &mut reader, 3);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "cur",
        "curriculum.save",
        json!({
            "classId": class_id,
            "curriculum": {
                "numberOfDays": 6,
                "classFormat": [
                    { "type": "vocab", "level": 1 },
                    { "type": "vocab", "level": 1 },
                    { "type": "reading", "level": 2 }
                ]
            }
        }),
    );

    // Two vocab slots per day over a 4-item catalog: days advance in pairs.
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 1, 0), "v1_00");
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 1, 1), "v1_01");
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 2, 0), "v1_02");
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 2, 1), "v1_03");
    // Day 3 wraps back to the top of the catalog.
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 3, 0), "v1_00");

    // The reading slot advances one unit per day and wraps after three.
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 1, 2), "reading_2_0");
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 2, 2), "reading_2_1");
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 3, 2), "reading_2_2");
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 4, 2), "reading_2_0");

    let _ = child.kill();
}

#[test]
fn resolution_is_deterministic_across_calls() {
    let workspace = temp_dir("lessond-rotation-determinism");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = seed_workspace(&mut stdin, &mut reader, &workspace);
    seed_vocab_level1(&mut stdin, &mut reader, 7);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "cur",
        "curriculum.save",
        json!({
            "classId": class_id,
            "curriculum": {
                "numberOfDays": 10,
                "classFormat": [{ "type": "vocab", "level": 1 }]
            }
        }),
    );

    let first = resolve_material_id(&mut stdin, &mut reader, &class_id, 9, 0);
    for _ in 0..3 {
        assert_eq!(
            resolve_material_id(&mut stdin, &mut reader, &class_id, 9, 0),
            first
        );
    }

    // One slot per day over 7 items: the first 7 days each see a new word.
    let mut seen = Vec::new();
    for day in 1..=7 {
        let id = resolve_material_id(&mut stdin, &mut reader, &class_id, day, 0);
        assert!(!seen.contains(&id), "day {} repeated {}", day, id);
        seen.push(id);
    }
    assert_eq!(
        resolve_material_id(&mut stdin, &mut reader, &class_id, 8, 0),
        seen[0]
    );

    let _ = child.kill();
}

#[test]
fn empty_slots_hold_position_but_do_not_resolve() {
    let workspace = temp_dir("lessond-rotation-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = seed_workspace(&mut stdin, &mut reader, &workspace);
    seed_vocab_level1(&mut stdin, &mut reader, 4);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "cur",
        "curriculum.save",
        json!({
            "classId": class_id,
            "curriculum": {
                "numberOfDays": 2,
                "classFormat": [
                    { "type": "empty", "level": 0 },
                    { "type": "vocab", "level": 1 }
                ]
            }
        }),
    );

    // The vocab slot keeps positional index 1 even behind a placeholder.
    assert_eq!(resolve_material_id(&mut stdin, &mut reader, &class_id, 1, 1), "v1_00");

    let payload = json!({
        "id": "resolve-empty",
        "method": "activity.resolve",
        "params": { "classId": class_id, "day": 1, "slot": 0 }
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let _ = child.kill();
}
