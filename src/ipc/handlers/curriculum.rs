use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::resolve::{self, Curriculum};
use rusqlite::Connection;
use serde_json::json;

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

fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

fn required_class_id(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<String, HandlerErr> {
    let class_id = params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing classId"))?;
    if !db::class_exists(conn, &class_id).map_err(HandlerErr::query)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    Ok(class_id)
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

fn curriculum_json(curriculum: &Curriculum) -> serde_json::Value {
    serde_json::to_value(curriculum).unwrap_or_else(|_| json!(null))
}

fn handle_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_class_id(conn, &req.params)?;
    let curriculum = db::curriculum_get(conn, &class_id).map_err(HandlerErr::query)?;
    Ok(json!({ "curriculum": curriculum.as_ref().map(curriculum_json) }))
}

fn handle_save(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_class_id(conn, &req.params)?;

    let raw = req
        .params
        .get("curriculum")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing curriculum"))?;
    let curriculum: Curriculum = serde_json::from_value(raw)
        .map_err(|e| HandlerErr::bad_params(format!("invalid curriculum: {}", e)))?;

    resolve::validate_curriculum(&curriculum).map_err(HandlerErr::bad_params)?;

    // Shrink guard: progress is measured against the curriculum the students
    // actually worked through, before it is replaced.
    if let Some(existing) = db::curriculum_get(conn, &class_id).map_err(HandlerErr::query)? {
        let by_student = db::completed_ids_by_student(conn, &class_id).map_err(HandlerErr::query)?;
        let min_allowed = resolve::max_completed_days(&existing, by_student.values());
        if let Err(e) = resolve::check_shrink(&curriculum, min_allowed) {
            return Err(HandlerErr {
                code: e.code(),
                message: e.to_string(),
                details: Some(json!({ "minAllowedDays": min_allowed })),
            });
        }
    }

    db::curriculum_save(conn, &class_id, &curriculum).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "classId": class_id }))
}

fn handle_start_day(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    set_day_started(state, req, true)
}

fn handle_cancel_day(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    set_day_started(state, req, false)
}

fn set_day_started(
    state: &AppState,
    req: &Request,
    started: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_class_id(conn, &req.params)?;
    let day = req
        .params
        .get("day")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing day"))?;

    let mut curriculum = load_curriculum(conn, &class_id)?;
    if day < 1 || day > curriculum.number_of_days {
        return Err(HandlerErr::bad_params(format!(
            "day must be between 1 and {}",
            curriculum.number_of_days
        )));
    }

    if started {
        if !curriculum.started_days.contains(&day) {
            curriculum.started_days.push(day);
            curriculum.started_days.sort_unstable();
        }
    } else {
        curriculum.started_days.retain(|d| *d != day);
    }

    db::curriculum_save(conn, &class_id, &curriculum).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "classId": class_id, "startedDays": curriculum.started_days }))
}

fn day_json(
    curriculum: &Curriculum,
    day: i64,
    unlocked: bool,
    completed_ids: Option<&std::collections::HashSet<String>>,
) -> serde_json::Value {
    let activities: Vec<serde_json::Value> =
        resolve::day_activities(&curriculum.class_format, day)
            .into_iter()
            .map(|a| {
                let completed = completed_ids
                    .map(|ids| ids.contains(&a.id))
                    .unwrap_or(false);
                json!({
                    "activityId": a.id,
                    "type": a.kind.as_str(),
                    "level": a.level,
                    "completed": completed
                })
            })
            .collect();
    json!({ "day": day, "unlocked": unlocked, "activities": activities })
}

fn handle_days_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_class_id(conn, &req.params)?;
    let user_email = req
        .params
        .get("userEmail")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing userEmail"))?;

    let curriculum = load_curriculum(conn, &class_id)?;
    let completed =
        db::completed_activity_ids(conn, &class_id, user_email).map_err(HandlerErr::query)?;

    let days: Vec<serde_json::Value> = resolve::day_states(&curriculum, &completed)
        .into_iter()
        .map(|day_state| {
            let mut day = day_json(&curriculum, day_state.day, day_state.unlocked, Some(&completed));
            day["completed"] = json!(day_state.completed);
            day
        })
        .collect();

    Ok(json!({ "classId": class_id, "days": days }))
}

fn handle_teacher_view(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = required_class_id(conn, &req.params)?;
    let curriculum = load_curriculum(conn, &class_id)?;

    let days: Vec<serde_json::Value> = (1..=curriculum.number_of_days)
        .map(|day| day_json(&curriculum, day, true, None))
        .collect();

    Ok(json!({ "classId": class_id, "days": days }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "curriculum.get" => handle_get(state, req),
        "curriculum.save" => handle_save(state, req),
        "curriculum.startDay" => handle_start_day(state, req),
        "curriculum.cancelDay" => handle_cancel_day(state, req),
        "days.list" => handle_days_list(state, req),
        "days.teacherView" => handle_teacher_view(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(e) => e.response(&req.id),
    })
}
