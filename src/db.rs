use crate::resolve::{Curriculum, SlotTemplate};
use rusqlite::{Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub const DB_FILE_NAME: &str = "lessond.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            email TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            password_digest TEXT,
            institution TEXT,
            teacher_email TEXT,
            grade TEXT,
            student_id TEXT,
            vocab_level INTEGER,
            status TEXT NOT NULL DEFAULT 'active',
            archived_at TEXT,
            original_email TEXT
        )",
        [],
    )?;
    // Workspaces created before ghost archival lack the status columns.
    ensure_users_archival_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_institution ON users(institution)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_action_logs(
            id TEXT PRIMARY KEY,
            ts TEXT NOT NULL,
            actor_email TEXT,
            actor_name TEXT,
            action_type TEXT NOT NULL,
            target_email TEXT NOT NULL,
            target_name TEXT,
            target_role TEXT,
            institution TEXT,
            details TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_action_logs_target ON user_action_logs(target_email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            grade TEXT NOT NULL,
            teacher_email TEXT NOT NULL,
            institution TEXT
        )",
        [],
    )?;
    ensure_classes_institution(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_teacher ON classes(teacher_email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_members(
            class_id TEXT NOT NULL,
            user_email TEXT NOT NULL,
            PRIMARY KEY(class_id, user_email),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_members_user ON class_members(user_email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS curriculums(
            class_id TEXT PRIMARY KEY,
            number_of_days INTEGER NOT NULL,
            class_format TEXT NOT NULL,
            started_days TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS curriculum_overrides(
            class_id TEXT NOT NULL,
            activity_id TEXT NOT NULL,
            material_id TEXT NOT NULL,
            PRIMARY KEY(class_id, activity_id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS vocab_words(
            vocab_id TEXT PRIMARY KEY,
            word TEXT NOT NULL,
            level INTEGER NOT NULL,
            word_no INTEGER NOT NULL,
            part_of_speech TEXT NOT NULL DEFAULT '',
            meaning_kor TEXT NOT NULL DEFAULT '',
            meaning_eng TEXT NOT NULL DEFAULT '',
            sentence TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_vocab_words_level ON vocab_words(level, word_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reading_units(
            id TEXT PRIMARY KEY,
            level INTEGER NOT NULL,
            unit_no INTEGER NOT NULL,
            title TEXT NOT NULL,
            passage TEXT NOT NULL DEFAULT '',
            questions TEXT NOT NULL DEFAULT '[]',
            vocab_words TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reading_units_level ON reading_units(level, unit_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS listening_units(
            id TEXT PRIMARY KEY,
            level INTEGER NOT NULL,
            unit_no INTEGER NOT NULL,
            title TEXT NOT NULL,
            script TEXT NOT NULL DEFAULT '',
            questions TEXT NOT NULL DEFAULT '[]',
            vocab_words TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_listening_units_level ON listening_units(level, unit_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grammar_units(
            id TEXT PRIMARY KEY,
            level INTEGER NOT NULL,
            unit_no INTEGER NOT NULL,
            title TEXT NOT NULL,
            questions TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grammar_units_level ON grammar_units(level, unit_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS study_logs(
            id TEXT PRIMARY KEY,
            ts TEXT NOT NULL,
            user_email TEXT,
            user_name TEXT,
            institution TEXT,
            class_id TEXT,
            class_name TEXT,
            activity_type TEXT,
            activity_title TEXT,
            level INTEGER,
            score INTEGER,
            total_questions INTEGER,
            activity_id TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_study_logs_user_class ON study_logs(user_email, class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_study_logs_class_activity ON study_logs(class_id, activity_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_users_archival_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "users", "status")? {
        conn.execute(
            "ALTER TABLE users ADD COLUMN status TEXT NOT NULL DEFAULT 'active'",
            [],
        )?;
    }
    if !table_has_column(conn, "users", "archived_at")? {
        conn.execute("ALTER TABLE users ADD COLUMN archived_at TEXT", [])?;
    }
    if !table_has_column(conn, "users", "original_email")? {
        conn.execute("ALTER TABLE users ADD COLUMN original_email TEXT", [])?;
    }
    Ok(())
}

fn ensure_classes_institution(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "classes", "institution")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE classes ADD COLUMN institution TEXT", [])?;
    Ok(())
}

pub fn curriculum_get(conn: &Connection, class_id: &str) -> anyhow::Result<Option<Curriculum>> {
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT number_of_days, class_format, started_days
             FROM curriculums WHERE class_id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let Some((number_of_days, format_raw, started_raw)) = row else {
        return Ok(None);
    };
    let class_format: Vec<SlotTemplate> = serde_json::from_str(&format_raw)?;
    let started_days: Vec<i64> = serde_json::from_str(&started_raw)?;
    Ok(Some(Curriculum {
        number_of_days,
        class_format,
        started_days,
    }))
}

pub fn curriculum_save(
    conn: &Connection,
    class_id: &str,
    curriculum: &Curriculum,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO curriculums(class_id, number_of_days, class_format, started_days)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id) DO UPDATE SET
             number_of_days = excluded.number_of_days,
             class_format = excluded.class_format,
             started_days = excluded.started_days",
        (
            class_id,
            curriculum.number_of_days,
            serde_json::to_string(&curriculum.class_format)?,
            serde_json::to_string(&curriculum.started_days)?,
        ),
    )?;
    Ok(())
}

/// Activity ids this student has at least one completion row for.
pub fn completed_activity_ids(
    conn: &Connection,
    class_id: &str,
    user_email: &str,
) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT activity_id FROM study_logs
         WHERE class_id = ? AND user_email = ? AND activity_id IS NOT NULL",
    )?;
    let ids = stmt
        .query_map((class_id, user_email), |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// One completion set per student with any row in this class, plus empty sets
/// for members who have not logged anything yet.
pub fn completed_ids_by_student(
    conn: &Connection,
    class_id: &str,
) -> anyhow::Result<HashMap<String, HashSet<String>>> {
    let mut by_student: HashMap<String, HashSet<String>> = HashMap::new();

    let mut members = conn.prepare("SELECT user_email FROM class_members WHERE class_id = ?")?;
    for email in members.query_map([class_id], |r| r.get::<_, String>(0))? {
        by_student.entry(email?).or_default();
    }

    let mut stmt = conn.prepare(
        "SELECT user_email, activity_id FROM study_logs
         WHERE class_id = ? AND user_email IS NOT NULL AND activity_id IS NOT NULL",
    )?;
    let rows = stmt.query_map([class_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (email, activity_id) = row?;
        by_student.entry(email).or_default().insert(activity_id);
    }
    Ok(by_student)
}

pub fn class_exists(conn: &Connection, class_id: &str) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
