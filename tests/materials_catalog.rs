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

fn request(
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
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn catalog_ids(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    kind: &str,
    level: i64,
) -> Vec<String> {
    let res = request_ok(
        stdin,
        reader,
        &format!("catalog-{}-{}", kind, level),
        "materials.catalog",
        json!({ "kind": kind, "level": level }),
    );
    res.get("items")
        .and_then(|v| v.as_array())
        .expect("items")
        .iter()
        .map(|i| {
            i.get("id")
                .and_then(|v| v.as_str())
                .expect("item id")
                .to_string()
        })
        .collect()
}

#[test]
fn catalog_order_is_stable_and_upserts_replace() {
    let workspace = temp_dir("lessond-materials");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Insert units out of order; the catalog sorts by unit number.
    for (unit_no, id) in [(2, "reading_1_c"), (0, "reading_1_a"), (1, "reading_1_b")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "materials.reading.upsert",
            json!({
                "unit": {
                    "id": id,
                    "level": 1,
                    "unitNo": unit_no,
                    "title": format!("Unit {}", unit_no),
                    "passage": "The quick brown fox.",
                    "questions": [
                        { "question_text": "Who jumped?", "options": ["fox", "dog"], "answer": "fox" }
                    ]
                }
            }),
        );
    }

    let first = catalog_ids(&mut stdin, &mut reader, "reading", 1);
    assert_eq!(first, vec!["reading_1_a", "reading_1_b", "reading_1_c"]);
    // Repeat reads return the same ordering.
    assert_eq!(catalog_ids(&mut stdin, &mut reader, "reading", 1), first);

    // Upserting an existing id replaces the row instead of duplicating it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "replace",
        "materials.reading.upsert",
        json!({
            "unit": {
                "id": "reading_1_b",
                "level": 1,
                "unitNo": 1,
                "title": "Unit 1 (revised)",
                "passage": "The slow brown fox.",
                "questions": []
            }
        }),
    );
    assert_eq!(catalog_ids(&mut stdin, &mut reader, "reading", 1).len(), 3);

    let levels = request_ok(
        &mut stdin,
        &mut reader,
        "levels",
        "materials.levels",
        json!({ "kind": "reading" }),
    );
    let rows = levels.get("levels").and_then(|v| v.as_array()).expect("levels");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("level").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(rows[0].get("itemCount").and_then(|v| v.as_i64()), Some(3));

    let _ = child.kill();
}

#[test]
fn grammar_catalog_flattens_unit_questions() {
    let workspace = temp_dir("lessond-materials-grammar");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "materials.grammar.upsert",
        json!({
            "unit": {
                "id": "grammar_3_1",
                "level": 3,
                "unitNo": 1,
                "title": "Past tense",
                "questions": [
                    { "text": "She ___ home.", "options": ["goed", "went"], "answer": "went" },
                    { "text": "He ___ lunch.", "options": ["ate", "eated"], "answer": "ate" }
                ]
            }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "materials.grammar.upsert",
        json!({
            "unit": {
                "id": "grammar_3_2",
                "level": 3,
                "unitNo": 2,
                "title": "Articles",
                "questions": [
                    { "text": "___ apple a day.", "options": ["A", "An"], "answer": "An" }
                ]
            }
        }),
    );

    let ids = catalog_ids(&mut stdin, &mut reader, "grammar", 3);
    assert_eq!(
        ids,
        vec!["grammar_3_1-q0", "grammar_3_1-q1", "grammar_3_2-q0"]
    );

    let levels = request_ok(
        &mut stdin,
        &mut reader,
        "levels",
        "materials.levels",
        json!({ "kind": "grammar" }),
    );
    let rows = levels.get("levels").and_then(|v| v.as_array()).expect("levels");
    assert_eq!(rows[0].get("itemCount").and_then(|v| v.as_i64()), Some(3));

    let _ = child.kill();
}

#[test]
fn empty_catalog_fails_activity_start() {
    let workspace = temp_dir("lessond-materials-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "class",
        "classes.create",
        json!({
            "name": "No Materials",
            "grade": [],
            "teacherEmail": "teacher@institute1001"
        }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "cur",
        "curriculum.save",
        json!({
            "classId": class_id,
            "curriculum": {
                "numberOfDays": 1,
                "classFormat": [{ "type": "listening", "level": 5 }]
            }
        }),
    );

    let resolved = request(
        &mut stdin,
        &mut reader,
        "resolve",
        "activity.resolve",
        json!({ "classId": class_id, "day": 1, "slot": 0 }),
    );
    assert_eq!(resolved.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resolved
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("no_material_available")
    );

    let _ = child.kill();
}

#[test]
fn vocab_import_upserts_by_vocab_id() {
    let workspace = temp_dir("lessond-materials-vocab");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let words = |meaning: &str| -> serde_json::Value {
        json!({
            "words": [
                { "vocabId": "apple_1", "word": "apple", "level": 1, "wordNo": 0, "meaningKor": meaning },
                { "vocabId": "book_1", "word": "book", "level": 1, "wordNo": 1, "meaningKor": "책" }
            ]
        })
    };

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "import-1",
        "materials.vocab.import",
        words("사과"),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "import-2",
        "materials.vocab.import",
        words("사과(수정)"),
    );

    let ids = catalog_ids(&mut stdin, &mut reader, "vocab", 1);
    assert_eq!(ids, vec!["apple_1", "book_1"]);

    let _ = child.kill();
}
