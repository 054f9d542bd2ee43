use crate::resolve::ActivityKind;
use rusqlite::Connection;
use serde_json::json;

/// One interchangeable content item for a `(kind, level)` pair, in stable
/// catalog order. `body` is the full payload handed to the student UI.
#[derive(Debug, Clone)]
pub struct MaterialRef {
    pub id: String,
    pub title: String,
    pub body: serde_json::Value,
}

/// The ordered catalog the rotation indexes into. Vocab and grammar items are
/// single questions; reading and listening items are whole units. Order is
/// fixed by `(word_no|unit_no, id)` so equal-keyed rows cannot swap between
/// reads.
pub fn load_catalog(
    conn: &Connection,
    kind: ActivityKind,
    level: i64,
) -> anyhow::Result<Vec<MaterialRef>> {
    match kind {
        ActivityKind::Vocab => load_vocab(conn, level),
        ActivityKind::Grammar => load_grammar(conn, level),
        ActivityKind::Reading => load_units(conn, "reading_units", "passage", level),
        ActivityKind::Listening => load_units(conn, "listening_units", "script", level),
        ActivityKind::Empty => Ok(Vec::new()),
    }
}

fn load_vocab(conn: &Connection, level: i64) -> anyhow::Result<Vec<MaterialRef>> {
    let mut stmt = conn.prepare(
        "SELECT vocab_id, word, word_no, part_of_speech, meaning_kor, meaning_eng, sentence
         FROM vocab_words
         WHERE level = ?
         ORDER BY word_no, vocab_id",
    )?;
    let rows = stmt.query_map([level], |row| {
        let vocab_id: String = row.get(0)?;
        let word: String = row.get(1)?;
        let word_no: i64 = row.get(2)?;
        let part_of_speech: String = row.get(3)?;
        let meaning_kor: String = row.get(4)?;
        let meaning_eng: String = row.get(5)?;
        let sentence: Option<String> = row.get(6)?;
        Ok(MaterialRef {
            id: vocab_id.clone(),
            title: word.clone(),
            body: json!({
                "vocabId": vocab_id,
                "word": word,
                "level": level,
                "wordNo": word_no,
                "partOfSpeech": part_of_speech,
                "meaningKor": meaning_kor,
                "meaningEng": meaning_eng,
                "sentence": sentence
            }),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn load_grammar(conn: &Connection, level: i64) -> anyhow::Result<Vec<MaterialRef>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, questions FROM grammar_units
         WHERE level = ?
         ORDER BY unit_no, id",
    )?;
    let units = stmt
        .query_map([level], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let questions: String = row.get(2)?;
            Ok((id, title, questions))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    for (unit_id, unit_title, questions_raw) in units {
        let questions: Vec<serde_json::Value> =
            serde_json::from_str(&questions_raw).unwrap_or_default();
        for (n, q) in questions.into_iter().enumerate() {
            let question_id = format!("{}-q{}", unit_id, n);
            let text = q
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            // Malformed rows may hold non-object entries; keep the slot but
            // with an empty payload rather than dropping catalog positions.
            let mut body = if q.is_object() { q } else { json!({}) };
            body["id"] = json!(question_id);
            body["unitId"] = json!(unit_id);
            body["unitTitle"] = json!(unit_title);
            out.push(MaterialRef {
                id: question_id,
                title: text,
                body,
            });
        }
    }
    Ok(out)
}

fn load_units(
    conn: &Connection,
    table: &str,
    text_column: &str,
    level: i64,
) -> anyhow::Result<Vec<MaterialRef>> {
    let sql = format!(
        "SELECT id, unit_no, title, {}, questions, vocab_words
         FROM {}
         WHERE level = ?
         ORDER BY unit_no, id",
        text_column, table
    );
    let text_key = if text_column == "passage" {
        "passage"
    } else {
        "script"
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([level], |row| {
        let id: String = row.get(0)?;
        let unit_no: i64 = row.get(1)?;
        let title: String = row.get(2)?;
        let text: String = row.get(3)?;
        let questions_raw: String = row.get(4)?;
        let vocab_raw: String = row.get(5)?;
        let questions: serde_json::Value =
            serde_json::from_str(&questions_raw).unwrap_or_else(|_| json!([]));
        let vocab_words: serde_json::Value =
            serde_json::from_str(&vocab_raw).unwrap_or_else(|_| json!([]));
        Ok(MaterialRef {
            id: id.clone(),
            title: title.clone(),
            body: json!({
                "id": id,
                "level": level,
                "unitNo": unit_no,
                "title": title,
                text_key: text,
                "questions": questions,
                "vocabWords": vocab_words
            }),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
