use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

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

fn parse_ts_filter(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = params.get(key).and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let parsed: DateTime<Utc> = raw
        .parse()
        .map_err(|_| HandlerErr::bad_params(format!("{} must be an RFC 3339 timestamp", key)))?;
    Ok(Some(parsed.to_rfc3339()))
}

fn handle_complete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = req
        .params
        .get("user")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing user"))?;
    let user_email = user
        .get("email")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing user.email"))?;
    let activity_id = req
        .params
        .get("activityId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing activityId"))?;
    let score = req
        .params
        .get("score")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing score"))?;
    let total_questions = req
        .params
        .get("totalQuestions")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing totalQuestions"))?;
    if score < 0 || total_questions < 0 || score > total_questions {
        return Err(HandlerErr::bad_params(
            "score must be between 0 and totalQuestions",
        ));
    }

    let row_id = Uuid::new_v4().to_string();
    let ts = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO study_logs(id, ts, user_email, user_name, institution,
             class_id, class_name, activity_type, activity_title, level,
             score, total_questions, activity_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row_id,
            &ts,
            user_email,
            user.get("name").and_then(|v| v.as_str()),
            user.get("institution").and_then(|v| v.as_str()),
            req.params.get("classId").and_then(|v| v.as_str()),
            req.params.get("className").and_then(|v| v.as_str()),
            req.params.get("activityType").and_then(|v| v.as_str()),
            req.params.get("activityTitle").and_then(|v| v.as_str()),
            req.params.get("level").and_then(|v| v.as_i64()),
            score,
            total_questions,
            activity_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "study_logs" })),
    })?;

    Ok(json!({ "id": row_id, "ts": ts }))
}

fn handle_logs(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = req.params.get("classId").and_then(|v| v.as_str());
    let user_email = req.params.get("userEmail").and_then(|v| v.as_str());
    // RFC 3339 UTC timestamps order lexicographically, so the bounds can be
    // applied as plain text comparisons.
    let since = parse_ts_filter(&req.params, "since")?;
    let until = parse_ts_filter(&req.params, "until")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, ts, user_email, user_name, institution, class_id, class_name,
                    activity_type, activity_title, level, score, total_questions, activity_id
             FROM study_logs
             WHERE (?1 IS NULL OR class_id = ?1)
               AND (?2 IS NULL OR user_email = ?2)
               AND (?3 IS NULL OR ts >= ?3)
               AND (?4 IS NULL OR ts <= ?4)
             ORDER BY ts DESC",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let logs = stmt
        .query_map((class_id, user_email, &since, &until), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "ts": row.get::<_, String>(1)?,
                "userEmail": row.get::<_, Option<String>>(2)?,
                "userName": row.get::<_, Option<String>>(3)?,
                "institution": row.get::<_, Option<String>>(4)?,
                "classId": row.get::<_, Option<String>>(5)?,
                "className": row.get::<_, Option<String>>(6)?,
                "activityType": row.get::<_, Option<String>>(7)?,
                "activityTitle": row.get::<_, Option<String>>(8)?,
                "level": row.get::<_, Option<i64>>(9)?,
                "score": row.get::<_, Option<i64>>(10)?,
                "totalQuestions": row.get::<_, Option<i64>>(11)?,
                "activityId": row.get::<_, Option<String>>(12)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "logs": logs }))
}

fn handle_summary(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing classId"))?;
    let user_email = req
        .params
        .get("userEmail")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing userEmail"))?;

    let Some(curriculum) = db::curriculum_get(conn, class_id).map_err(HandlerErr::query)? else {
        return Ok(json!({ "completedDays": 0, "totalDays": 0 }));
    };
    let completed =
        db::completed_activity_ids(conn, class_id, user_email).map_err(HandlerErr::query)?;

    // A student sits on the frontmost unlocked day, so every other unlocked
    // day counts as completed.
    let unlocked = resolve::day_states(&curriculum, &completed)
        .iter()
        .filter(|d| d.unlocked)
        .count() as i64;
    Ok(json!({
        "completedDays": (unlocked - 1).max(0),
        "totalDays": curriculum.number_of_days
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "progress.complete" => handle_complete(state, req),
        "progress.logs" => handle_logs(state, req),
        "progress.summary" => handle_summary(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(e) => e.response(&req.id),
    })
}
