use crate::catalog::{self, MaterialRef};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::resolve::{self, ActivityKind, Curriculum, ResolveError, SlotRef};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const QUIZ_QUESTION_COUNT: usize = 10;
const QUIZ_OPTION_COUNT: usize = 4;

// Fillers for levels too small to supply real distractors.
const DUMMY_OPTIONS: [&str; 6] = ["Apple", "Book", "Car", "Desk", "Run", "Study"];

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn bad_params(message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn query(e: anyhow::Error) -> HandlerErr {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

impl From<ResolveError> for HandlerErr {
    fn from(e: ResolveError) -> HandlerErr {
        HandlerErr {
            code: e.code(),
            message: e.to_string(),
            details: None,
        }
    }
}

fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn load_curriculum(conn: &Connection, class_id: &str) -> Result<Curriculum, HandlerErr> {
    db::curriculum_get(conn, class_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "class has no curriculum".to_string(),
            details: None,
        })
}

/// The slot reference for (day, slot) params, checked against the curriculum.
fn checked_slot(
    curriculum: &Curriculum,
    params: &serde_json::Value,
) -> Result<(SlotRef, ActivityKind, i64), HandlerErr> {
    let day = params
        .get("day")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing day"))?;
    let slot = params
        .get("slot")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing slot"))? as usize;

    if day < 1 || day > curriculum.number_of_days {
        return Err(HandlerErr::bad_params(format!(
            "day must be between 1 and {}",
            curriculum.number_of_days
        )));
    }
    let tpl = curriculum
        .class_format
        .get(slot)
        .ok_or_else(|| HandlerErr::bad_params("slot out of range"))?;
    if tpl.kind == ActivityKind::Empty {
        return Err(HandlerErr::bad_params("slot is an empty placeholder"));
    }
    Ok((SlotRef { day, slot }, tpl.kind, tpl.level))
}

fn override_material_id(
    conn: &Connection,
    class_id: &str,
    activity_id: &str,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT material_id FROM curriculum_overrides
         WHERE class_id = ? AND activity_id = ?",
        (class_id, activity_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Teacher overrides win; an override pointing at a material that left the
/// catalog is stale and falls back to the rotation pick.
/// Returns the chosen item and whether an override selected it.
fn resolve_material<'a>(
    conn: &Connection,
    class_id: &str,
    curriculum: &Curriculum,
    slot_ref: SlotRef,
    kind: ActivityKind,
    level: i64,
    items: &'a [MaterialRef],
) -> Result<(&'a MaterialRef, bool), HandlerErr> {
    let activity_id = resolve::activity_id(slot_ref.day, slot_ref.slot);

    if let Some(material_id) = override_material_id(conn, class_id, &activity_id)? {
        if let Some(item) = items.iter().find(|m| m.id == material_id) {
            return Ok((item, true));
        }
        log::warn!(
            "ignoring stale override for {} ({} no longer in {} level {} catalog)",
            activity_id,
            material_id,
            kind,
            level
        );
    }

    if items.is_empty() {
        return Err(ResolveError::NoMaterialAvailable { kind, level }.into());
    }
    let index = resolve::rotation_index(&curriculum.class_format, slot_ref.day, slot_ref.slot)
        .ok_or_else(|| HandlerErr::bad_params("slot is an empty placeholder"))?;
    Ok((&items[index % items.len()], false))
}

fn handle_resolve(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let curriculum = load_curriculum(conn, &class_id)?;
    let (slot_ref, kind, level) = checked_slot(&curriculum, &req.params)?;

    let items = catalog::load_catalog(conn, kind, level).map_err(HandlerErr::query)?;
    let (item, overridden) =
        resolve_material(conn, &class_id, &curriculum, slot_ref, kind, level, &items)?;

    Ok(json!({
        "activityId": resolve::activity_id(slot_ref.day, slot_ref.slot),
        "type": kind.as_str(),
        "level": level,
        "materialId": item.id,
        "material": item.body,
        "overridden": overridden
    }))
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn next_rand(state: &mut u64) -> u64 {
    // Same request must produce the same quiz, so options come from a seeded
    // generator rather than a random shuffle.
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    *state >> 33
}

fn build_options(answer: &str, pool: &[String], seed: u64) -> Vec<String> {
    let mut rng = seed;
    let mut options: Vec<String> = Vec::with_capacity(QUIZ_OPTION_COUNT);

    let candidates: Vec<&String> = pool.iter().filter(|w| w.as_str() != answer).collect();
    let mut picked: Vec<usize> = Vec::new();
    while picked.len() < QUIZ_OPTION_COUNT - 1 && picked.len() < candidates.len() {
        let idx = (next_rand(&mut rng) as usize) % candidates.len();
        if !picked.contains(&idx) {
            picked.push(idx);
        }
    }
    for idx in &picked {
        options.push(candidates[*idx].clone());
    }

    let mut dummy = DUMMY_OPTIONS.iter();
    while options.len() < QUIZ_OPTION_COUNT - 1 {
        let Some(d) = dummy.next() else { break };
        if *d != answer && !options.iter().any(|o| o == d) {
            options.push(d.to_string());
        }
    }

    let insert_at = (next_rand(&mut rng) as usize) % (options.len() + 1);
    options.insert(insert_at, answer.to_string());
    options
}

fn quiz_question(item: &MaterialRef, kind: ActivityKind, pool: &[String]) -> serde_json::Value {
    match kind {
        ActivityKind::Vocab => {
            let word = item
                .body
                .get("word")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let text = item
                .body
                .get("meaningKor")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let options = build_options(word, pool, fnv1a(&item.id));
            json!({
                "word": text,
                "options": options,
                "correctAnswer": word
            })
        }
        _ => {
            let options = item.body.get("options").cloned().unwrap_or_else(|| json!([]));
            json!({
                "word": item.body.get("text").cloned().unwrap_or_else(|| json!(item.title)),
                "options": options,
                "correctAnswer": item.body.get("answer").cloned().unwrap_or(json!(null))
            })
        }
    }
}

fn handle_quiz(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let curriculum = load_curriculum(conn, &class_id)?;
    let (slot_ref, kind, level) = checked_slot(&curriculum, &req.params)?;

    if kind != ActivityKind::Vocab && kind != ActivityKind::Grammar {
        return Err(HandlerErr::bad_params(
            "quizzes are built for vocab and grammar slots; use activity.resolve",
        ));
    }

    let items = catalog::load_catalog(conn, kind, level).map_err(HandlerErr::query)?;
    if items.is_empty() {
        return Err(ResolveError::NoMaterialAvailable { kind, level }.into());
    }
    let activity_id = resolve::activity_id(slot_ref.day, slot_ref.slot);

    // Overridden slots lead with the pinned question; otherwise the list is
    // rotated so the resolved item leads and the following days' items trail.
    let (lead, overridden) =
        resolve_material(conn, &class_id, &curriculum, slot_ref, kind, level, &items)?;
    let lead_index = items
        .iter()
        .position(|m| m.id == lead.id)
        .unwrap_or_default();

    let pool: Vec<String> = items.iter().map(|m| m.title.clone()).collect();
    let ordered: Vec<&MaterialRef> = if overridden {
        items[lead_index..]
            .iter()
            .take(1)
            .chain(items.iter().filter(|m| m.id != lead.id))
            .collect()
    } else {
        items[lead_index..].iter().chain(items[..lead_index].iter()).collect()
    };

    let questions: Vec<serde_json::Value> = ordered
        .into_iter()
        .take(QUIZ_QUESTION_COUNT)
        .map(|item| quiz_question(item, kind, &pool))
        .collect();

    let title = format!(
        "{} - Level {}",
        capitalize(kind.as_str()),
        level
    );

    Ok(json!({
        "activityId": activity_id,
        "title": title,
        "activityType": kind.as_str(),
        "questions": questions
    }))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn handle_modify(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let activity_id = required_str(&req.params, "activityId")?;
    let material_id = required_str(&req.params, "materialId")?;
    let scope = required_str(&req.params, "scope")?;
    if scope != "single" && scope != "sequential" {
        return Err(HandlerErr::bad_params("scope must be single or sequential"));
    }

    let curriculum = load_curriculum(conn, &class_id)?;
    let slot_ref = resolve::parse_activity_id(&activity_id)
        .ok_or_else(|| HandlerErr::bad_params("malformed activityId"))?;
    let tpl = curriculum
        .class_format
        .get(slot_ref.slot)
        .ok_or_else(|| HandlerErr::bad_params("slot out of range"))?;
    if tpl.kind == ActivityKind::Empty {
        return Err(HandlerErr::bad_params("slot is an empty placeholder"));
    }

    if scope == "single" {
        upsert_override(conn, &class_id, &activity_id, &material_id)?;
        return Ok(json!({ "written": 1 }));
    }

    // Sequential re-bases the rotation: the first format slot matching this
    // (type, level) advances one catalog position per day from the chosen
    // item, wrapping at the end. Unknown slots or materials are a no-op.
    let Some(first_slot) = curriculum
        .class_format
        .iter()
        .position(|t| t.kind == tpl.kind && t.level == tpl.level)
    else {
        return Ok(json!({ "written": 0 }));
    };
    let items = catalog::load_catalog(conn, tpl.kind, tpl.level).map_err(HandlerErr::query)?;
    let Some(base_index) = items.iter().position(|m| m.id == material_id) else {
        return Ok(json!({ "written": 0 }));
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut written = 0usize;
    for day in slot_ref.day..=curriculum.number_of_days {
        let target_id = resolve::activity_id(day, first_slot);
        let offset = (day - slot_ref.day) as usize;
        let material_for_day = &items[(base_index + offset) % items.len()];
        if let Err(e) = tx.execute(
            "INSERT INTO curriculum_overrides(class_id, activity_id, material_id)
             VALUES(?, ?, ?)
             ON CONFLICT(class_id, activity_id) DO UPDATE SET
                 material_id = excluded.material_id",
            (&class_id, &target_id, &material_for_day.id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "activityId": target_id })),
            });
        }
        written += 1;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "written": written }))
}

fn upsert_override(
    conn: &Connection,
    class_id: &str,
    activity_id: &str,
    material_id: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO curriculum_overrides(class_id, activity_id, material_id)
         VALUES(?, ?, ?)
         ON CONFLICT(class_id, activity_id) DO UPDATE SET
             material_id = excluded.material_id",
        (class_id, activity_id, material_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(())
}

fn handle_overrides_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;

    let mut stmt = conn
        .prepare(
            "SELECT activity_id, material_id FROM curriculum_overrides
             WHERE class_id = ? ORDER BY activity_id",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let overrides = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "activityId": row.get::<_, String>(0)?,
                "materialId": row.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "overrides": overrides }))
}

fn handle_completion_status(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_str(&req.params, "classId")?;
    let activity_id = required_str(&req.params, "activityId")?;

    let mut stmt = conn
        .prepare(
            "SELECT m.user_email, u.name,
                    EXISTS(
                        SELECT 1 FROM study_logs l
                        WHERE l.class_id = m.class_id
                          AND l.user_email = m.user_email
                          AND l.activity_id = ?2
                    )
             FROM class_members m
             LEFT JOIN users u ON u.email = m.user_email
             WHERE m.class_id = ?1
             ORDER BY m.user_email",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let students = stmt
        .query_map((&class_id, &activity_id), |row| {
            Ok(json!({
                "email": row.get::<_, String>(0)?,
                "name": row.get::<_, Option<String>>(1)?,
                "completed": row.get::<_, bool>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "activityId": activity_id, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "activity.resolve" => handle_resolve(state, req),
        "activity.quiz" => handle_quiz(state, req),
        "activity.modify" => handle_modify(state, req),
        "overrides.list" => handle_overrides_list(state, req),
        "activity.completionStatus" => handle_completion_status(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(e) => e.response(&req.id),
    })
}
