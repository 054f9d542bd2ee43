use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const ROLES: [&str; 5] = ["master", "admin", "teacher", "student", "individual"];

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn query(e: rusqlite::Error) -> HandlerErr {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn log_user_action(
    conn: &Connection,
    actor: &serde_json::Value,
    action_type: &str,
    target_email: &str,
    target_name: Option<&str>,
    target_role: Option<&str>,
    institution: Option<&str>,
    details: Option<serde_json::Value>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO user_action_logs(id, ts, actor_email, actor_name, action_type,
             target_email, target_name, target_role, institution, details)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            Utc::now().to_rfc3339(),
            actor.get("email").and_then(|v| v.as_str()),
            actor.get("name").and_then(|v| v.as_str()),
            action_type,
            target_email,
            target_name,
            target_role,
            institution,
            details.map(|d| d.to_string()),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "user_action_logs" })),
    })?;
    Ok(())
}

fn user_row_to_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let email: String = row.get(0)?;
    let name: String = row.get(1)?;
    let role: String = row.get(2)?;
    let institution: Option<String> = row.get(3)?;
    let teacher_email: Option<String> = row.get(4)?;
    let grade: Option<String> = row.get(5)?;
    let student_id: Option<String> = row.get(6)?;
    let vocab_level: Option<i64> = row.get(7)?;
    let status: String = row.get(8)?;
    let archived_at: Option<String> = row.get(9)?;
    let original_email: Option<String> = row.get(10)?;
    Ok(json!({
        "email": email,
        "name": name,
        "role": role,
        "institution": institution,
        "teacherEmail": teacher_email,
        "grade": grade,
        "studentId": student_id,
        "vocabLevel": vocab_level,
        "status": status,
        "archivedAt": archived_at,
        "originalEmail": original_email
    }))
}

const USER_COLUMNS: &str = "email, name, role, institution, teacher_email, grade,
    student_id, vocab_level, status, archived_at, original_email";

fn users_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;

    let institution = req.params.get("institution").and_then(|v| v.as_str());
    let role = req.params.get("role").and_then(|v| v.as_str());
    let include_ghosts = req
        .params
        .get("includeGhosts")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let sql = format!(
        "SELECT {} FROM users
         WHERE (?1 IS NULL OR institution = ?1)
           AND (?2 IS NULL OR role = ?2)
           AND (?3 OR status != 'ghost')
         ORDER BY email",
        USER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let users = stmt
        .query_map((institution, role, include_ghosts), |row| {
            user_row_to_json(row)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "users": users }))
}

fn users_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = req.params.get("actor").cloned().unwrap_or(json!({}));
    let user = req.params.get("user").cloned().ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "missing user".to_string(),
        details: None,
    })?;

    let email = get_required_str(&user, "email")?;
    let name = get_required_str(&user, "name")?;
    let role = get_required_str(&user, "role")?;
    if !ROLES.contains(&role.as_str()) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("role must be one of: {}", ROLES.join(", ")),
            details: None,
        });
    }

    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "db_insert_failed",
            message: "email already exists".to_string(),
            details: Some(json!({ "email": email })),
        });
    }

    let digest = user
        .get("password")
        .and_then(|v| v.as_str())
        .map(password_digest);
    let institution = user.get("institution").and_then(|v| v.as_str());
    let teacher_email = user.get("teacherEmail").and_then(|v| v.as_str());
    let grade = user.get("grade").and_then(|v| v.as_str());
    let student_id = user.get("studentId").and_then(|v| v.as_str());
    let vocab_level = user.get("vocabLevel").and_then(|v| v.as_i64());

    conn.execute(
        "INSERT INTO users(email, name, role, password_digest, institution,
             teacher_email, grade, student_id, vocab_level)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &email,
            &name,
            &role,
            &digest,
            institution,
            teacher_email,
            grade,
            student_id,
            vocab_level,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;

    log_user_action(
        conn,
        &actor,
        "create_user",
        &email,
        Some(&name),
        Some(&role),
        institution,
        None,
    )?;

    Ok(json!({ "email": email }))
}

fn users_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = req.params.get("actor").cloned().unwrap_or(json!({}));
    let email = get_required_str(&req.params, "email")?;
    let fields = req.params.get("fields").cloned().ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "missing fields".to_string(),
        details: None,
    })?;

    let existing = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS),
            [&email],
            |row| user_row_to_json(row),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "user not found".to_string(),
            details: None,
        })?;

    let mut changes: Vec<serde_json::Value> = Vec::new();
    for (field, column) in [
        ("name", "name"),
        ("role", "role"),
        ("institution", "institution"),
        ("teacherEmail", "teacher_email"),
        ("grade", "grade"),
        ("studentId", "student_id"),
    ] {
        let Some(new_value) = fields.get(field).and_then(|v| v.as_str()) else {
            continue;
        };
        if field == "role" && !ROLES.contains(&new_value) {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("role must be one of: {}", ROLES.join(", ")),
                details: None,
            });
        }
        conn.execute(
            &format!("UPDATE users SET {} = ? WHERE email = ?", column),
            (new_value, &email),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
        changes.push(json!({
            "field": field,
            "from": existing.get(field).cloned().unwrap_or(json!(null)),
            "to": new_value
        }));
    }
    if let Some(level) = fields.get("vocabLevel").and_then(|v| v.as_i64()) {
        conn.execute(
            "UPDATE users SET vocab_level = ? WHERE email = ?",
            (level, &email),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
        changes.push(json!({
            "field": "vocabLevel",
            "from": existing.get("vocabLevel").cloned().unwrap_or(json!(null)),
            "to": level
        }));
    }
    if let Some(password) = fields.get("password").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE users SET password_digest = ? WHERE email = ?",
            (password_digest(password), &email),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
        // Digests stay out of the audit trail.
        changes.push(json!({ "field": "password", "from": null, "to": null }));
    }

    if !changes.is_empty() {
        log_user_action(
            conn,
            &actor,
            "update_user_info",
            &email,
            existing.get("name").and_then(|v| v.as_str()),
            existing.get("role").and_then(|v| v.as_str()),
            existing.get("institution").and_then(|v| v.as_str()),
            Some(json!({ "changes": changes })),
        )?;
    }

    Ok(json!({ "email": email, "updatedFields": changes.len() }))
}

fn users_archive(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = req.params.get("actor").cloned().unwrap_or(json!({}));
    let email = get_required_str(&req.params, "email")?;

    let existing = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS),
            [&email],
            |row| user_row_to_json(row),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "user not found".to_string(),
            details: None,
        })?;
    if existing.get("status").and_then(|v| v.as_str()) == Some("ghost") {
        return Err(HandlerErr {
            code: "bad_params",
            message: "user is already archived".to_string(),
            details: None,
        });
    }

    conn.execute(
        "UPDATE users SET status = 'ghost', archived_at = ?, original_email = email
         WHERE email = ?",
        (Utc::now().to_rfc3339(), &email),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;

    log_user_action(
        conn,
        &actor,
        "archive_user",
        &email,
        existing.get("name").and_then(|v| v.as_str()),
        existing.get("role").and_then(|v| v.as_str()),
        existing.get("institution").and_then(|v| v.as_str()),
        None,
    )?;

    Ok(json!({ "email": email, "status": "ghost" }))
}

fn users_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = req.params.get("actor").cloned().unwrap_or(json!({}));
    let email = get_required_str(&req.params, "email")?;

    let existing = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS),
            [&email],
            |row| user_row_to_json(row),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "user not found".to_string(),
            details: None,
        })?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    // Memberships go with the account; study logs stay as history.
    for sql in [
        "DELETE FROM class_members WHERE user_email = ?",
        "DELETE FROM users WHERE email = ?",
    ] {
        if let Err(e) = tx.execute(sql, [&email]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: None,
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    log_user_action(
        conn,
        &actor,
        "delete_user",
        &email,
        existing.get("name").and_then(|v| v.as_str()),
        existing.get("role").and_then(|v| v.as_str()),
        existing.get("institution").and_then(|v| v.as_str()),
        None,
    )?;

    Ok(json!({ "ok": true }))
}

fn actions_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let target = req.params.get("targetEmail").and_then(|v| v.as_str());

    let mut stmt = conn
        .prepare(
            "SELECT id, ts, actor_email, actor_name, action_type, target_email,
                    target_name, target_role, institution, details
             FROM user_action_logs
             WHERE (?1 IS NULL OR target_email = ?1)
             ORDER BY ts DESC",
        )
        .map_err(HandlerErr::query)?;
    let logs = stmt
        .query_map([target], |row| {
            let details_raw: Option<String> = row.get(9)?;
            let details: serde_json::Value = details_raw
                .and_then(|d| serde_json::from_str(&d).ok())
                .unwrap_or(serde_json::Value::Null);
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "ts": row.get::<_, String>(1)?,
                "actorEmail": row.get::<_, Option<String>>(2)?,
                "actorName": row.get::<_, Option<String>>(3)?,
                "actionType": row.get::<_, String>(4)?,
                "targetEmail": row.get::<_, String>(5)?,
                "targetName": row.get::<_, Option<String>>(6)?,
                "targetRole": row.get::<_, Option<String>>(7)?,
                "institution": row.get::<_, Option<String>>(8)?,
                "details": details
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "logs": logs }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.list" => users_list(state, req),
        "users.create" => users_create(state, req),
        "users.update" => users_update(state, req),
        "users.archive" => users_archive(state, req),
        "users.delete" => users_delete(state, req),
        "users.actions" => actions_list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(e) => e.response(&req.id),
    })
}
