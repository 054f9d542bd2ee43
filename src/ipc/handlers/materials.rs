use crate::catalog;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::resolve::ActivityKind;
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
}

fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

fn required_kind(params: &serde_json::Value) -> Result<ActivityKind, HandlerErr> {
    let raw = params
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing kind"))?;
    let kind = ActivityKind::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown kind: {}", raw)))?;
    if kind == ActivityKind::Empty {
        return Err(HandlerErr::bad_params("empty is not a material kind"));
    }
    Ok(kind)
}

fn required_str(obj: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn required_i64(obj: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    obj.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn vocab_import(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let words = req
        .params
        .get("words")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing words array"))?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut imported = 0usize;
    for word in words {
        let vocab_id = required_str(word, "vocabId")?;
        let text = required_str(word, "word")?;
        let level = required_i64(word, "level")?;
        let word_no = required_i64(word, "wordNo")?;
        let part_of_speech = word
            .get("partOfSpeech")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let meaning_kor = word.get("meaningKor").and_then(|v| v.as_str()).unwrap_or("");
        let meaning_eng = word.get("meaningEng").and_then(|v| v.as_str()).unwrap_or("");
        let sentence = word.get("sentence").and_then(|v| v.as_str());

        if let Err(e) = tx.execute(
            "INSERT INTO vocab_words(vocab_id, word, level, word_no, part_of_speech,
                 meaning_kor, meaning_eng, sentence)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(vocab_id) DO UPDATE SET
                 word = excluded.word,
                 level = excluded.level,
                 word_no = excluded.word_no,
                 part_of_speech = excluded.part_of_speech,
                 meaning_kor = excluded.meaning_kor,
                 meaning_eng = excluded.meaning_eng,
                 sentence = excluded.sentence",
            (
                &vocab_id,
                &text,
                level,
                word_no,
                part_of_speech,
                meaning_kor,
                meaning_eng,
                sentence,
            ),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "vocabId": vocab_id })),
            });
        }
        imported += 1;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "imported": imported }))
}

fn unit_upsert(
    state: &AppState,
    req: &Request,
    kind: ActivityKind,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let unit = req
        .params
        .get("unit")
        .ok_or_else(|| HandlerErr::bad_params("missing unit"))?;

    let id = required_str(unit, "id")?;
    let level = required_i64(unit, "level")?;
    let unit_no = required_i64(unit, "unitNo")?;
    let title = required_str(unit, "title")?;
    let questions = unit
        .get("questions")
        .cloned()
        .unwrap_or_else(|| json!([]));
    if !questions.is_array() {
        return Err(HandlerErr::bad_params("questions must be an array"));
    }

    let result = match kind {
        ActivityKind::Reading | ActivityKind::Listening => {
            let (table, text_key) = if kind == ActivityKind::Reading {
                ("reading_units", "passage")
            } else {
                ("listening_units", "script")
            };
            let text = unit.get(text_key).and_then(|v| v.as_str()).unwrap_or("");
            let vocab_words = unit
                .get("vocabWords")
                .cloned()
                .unwrap_or_else(|| json!([]));
            conn.execute(
                &format!(
                    "INSERT INTO {table}(id, level, unit_no, title, {text_key}, questions, vocab_words)
                     VALUES(?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                         level = excluded.level,
                         unit_no = excluded.unit_no,
                         title = excluded.title,
                         {text_key} = excluded.{text_key},
                         questions = excluded.questions,
                         vocab_words = excluded.vocab_words"
                ),
                (
                    &id,
                    level,
                    unit_no,
                    &title,
                    text,
                    questions.to_string(),
                    vocab_words.to_string(),
                ),
            )
        }
        ActivityKind::Grammar => conn.execute(
            "INSERT INTO grammar_units(id, level, unit_no, title, questions)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 level = excluded.level,
                 unit_no = excluded.unit_no,
                 title = excluded.title,
                 questions = excluded.questions",
            (&id, level, unit_no, &title, questions.to_string()),
        ),
        _ => return Err(HandlerErr::bad_params("unit upsert requires a unit kind")),
    };

    result.map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "id": id })),
    })?;

    Ok(json!({ "id": id }))
}

fn levels_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let kind = required_kind(&req.params)?;

    let sql = match kind {
        ActivityKind::Vocab => {
            "SELECT level, COUNT(*) FROM vocab_words GROUP BY level ORDER BY level"
        }
        ActivityKind::Reading => {
            "SELECT level, COUNT(*) FROM reading_units GROUP BY level ORDER BY level"
        }
        ActivityKind::Listening => {
            "SELECT level, COUNT(*) FROM listening_units GROUP BY level ORDER BY level"
        }
        ActivityKind::Grammar => {
            "SELECT level, COUNT(*) FROM grammar_units GROUP BY level ORDER BY level"
        }
        ActivityKind::Empty => unreachable!(),
    };

    let mut stmt = conn.prepare(sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut levels = stmt
        .query_map([], |row| {
            let level: i64 = row.get(0)?;
            let rows: i64 = row.get(1)?;
            Ok((level, rows))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    // Grammar levels count flattened questions, not unit rows; that is the
    // catalog length the rotation walks.
    if kind == ActivityKind::Grammar {
        let mut out = Vec::with_capacity(levels.len());
        for (level, _) in levels.drain(..) {
            let items = catalog::load_catalog(conn, kind, level).map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
            out.push((level, items.len() as i64));
        }
        levels = out;
    }

    let levels: Vec<serde_json::Value> = levels
        .into_iter()
        .map(|(level, count)| json!({ "level": level, "itemCount": count }))
        .collect();
    Ok(json!({ "kind": kind.as_str(), "levels": levels }))
}

fn catalog_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let kind = required_kind(&req.params)?;
    let level = required_i64(&req.params, "level")?;

    let items = catalog::load_catalog(conn, kind, level).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let items: Vec<serde_json::Value> = items
        .into_iter()
        .map(|item| json!({ "id": item.id, "title": item.title }))
        .collect();

    Ok(json!({
        "kind": kind.as_str(),
        "level": level,
        "items": items
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "materials.vocab.import" => vocab_import(state, req),
        "materials.reading.upsert" => unit_upsert(state, req, ActivityKind::Reading),
        "materials.listening.upsert" => unit_upsert(state, req, ActivityKind::Listening),
        "materials.grammar.upsert" => unit_upsert(state, req, ActivityKind::Grammar),
        "materials.levels" => levels_list(state, req),
        "materials.catalog" => catalog_list(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(e) => e.response(&req.id),
    })
}
