use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let teacher_filter = req
        .params
        .get("teacherEmail")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Include member/day counts so the UI can show a useful dashboard.
    // Correlated subqueries avoid double-counting from joins.
    let sql = "SELECT
           c.id,
           c.name,
           c.description,
           c.grade,
           c.teacher_email,
           c.institution,
           (SELECT COUNT(*) FROM class_members m WHERE m.class_id = c.id) AS member_count,
           (SELECT cur.number_of_days FROM curriculums cur WHERE cur.class_id = c.id) AS number_of_days
         FROM classes c
         WHERE (?1 IS NULL OR c.teacher_email = ?1)
         ORDER BY c.name";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&teacher_filter], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let grade_raw: String = row.get(3)?;
            let teacher_email: String = row.get(4)?;
            let institution: Option<String> = row.get(5)?;
            let member_count: i64 = row.get(6)?;
            let number_of_days: Option<i64> = row.get(7)?;
            let grade: serde_json::Value =
                serde_json::from_str(&grade_raw).unwrap_or_else(|_| json!([]));
            Ok(json!({
                "id": id,
                "name": name,
                "description": description,
                "grade": grade,
                "teacherEmail": teacher_email,
                "institution": institution,
                "memberCount": member_count,
                "numberOfDays": number_of_days
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let teacher_email = match req.params.get("teacherEmail").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing teacherEmail", None),
    };
    let grade = req
        .params
        .get("grade")
        .cloned()
        .unwrap_or_else(|| json!([]));
    if !grade.is_array() {
        return err(&req.id, "bad_params", "grade must be an array", None);
    }
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let institution = req
        .params
        .get("institution")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, description, grade, teacher_email, institution)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &class_id,
            &name,
            &description,
            grade.to_string(),
            &teacher_email,
            &institution,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let mut updated = 0usize;
    if let Some(name) = req.params.get("name").and_then(|v| v.as_str()) {
        let name = name.trim();
        if name.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE classes SET name = ? WHERE id = ?",
            (name, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        updated += 1;
    }
    if let Some(v) = req.params.get("description") {
        let description = v.as_str().map(|s| s.to_string());
        if let Err(e) = conn.execute(
            "UPDATE classes SET description = ? WHERE id = ?",
            (&description, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        updated += 1;
    }
    if let Some(grade) = req.params.get("grade") {
        if !grade.is_array() {
            return err(&req.id, "bad_params", "grade must be an array", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE classes SET grade = ? WHERE id = ?",
            (grade.to_string(), &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        updated += 1;
    }
    if let Some(teacher_email) = req.params.get("teacherEmail").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE classes SET teacher_email = ? WHERE id = ?",
            (teacher_email, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        updated += 1;
    }
    if let Some(institution) = req.params.get("institution").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE classes SET institution = ? WHERE id = ?",
            (institution, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        updated += 1;
    }

    ok(&req.id, json!({ "classId": class_id, "updatedFields": updated }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (sql, table) in [
        (
            "DELETE FROM curriculum_overrides WHERE class_id = ?",
            "curriculum_overrides",
        ),
        ("DELETE FROM curriculums WHERE class_id = ?", "curriculums"),
        (
            "DELETE FROM class_members WHERE class_id = ?",
            "class_members",
        ),
        ("DELETE FROM study_logs WHERE class_id = ?", "study_logs"),
        ("DELETE FROM classes WHERE id = ?", "classes"),
    ] {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_members_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT m.user_email, u.name, u.status
         FROM class_members m
         LEFT JOIN users u ON u.email = m.user_email
         WHERE m.class_id = ?
         ORDER BY m.user_email",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            let email: String = row.get(0)?;
            let name: Option<String> = row.get(1)?;
            let status: Option<String> = row.get(2)?;
            Ok(json!({ "email": email, "name": name, "status": status }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(members) => ok(&req.id, json!({ "members": members })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_members_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let user_email = match req.params.get("userEmail").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing userEmail", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO class_members(class_id, user_email) VALUES(?, ?)",
        (&class_id, &user_email),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_members_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let user_email = match req.params.get("userEmail").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userEmail", None),
    };

    match conn.execute(
        "DELETE FROM class_members WHERE class_id = ? AND user_email = ?",
        (&class_id, &user_email),
    ) {
        Ok(n) => ok(&req.id, json!({ "removed": n })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "members.list" => Some(handle_members_list(state, req)),
        "members.add" => Some(handle_members_add(state, req)),
        "members.remove" => Some(handle_members_remove(state, req)),
        _ => None,
    }
}
