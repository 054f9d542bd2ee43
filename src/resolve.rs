use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

pub const MAX_FORMAT_SLOTS: usize = 6;
pub const MAX_CURRICULUM_DAYS: i64 = 30;
pub const MAX_DIFFICULTY_LEVEL: i64 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Vocab,
    Listening,
    Reading,
    Grammar,
    Empty,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Vocab => "vocab",
            ActivityKind::Listening => "listening",
            ActivityKind::Reading => "reading",
            ActivityKind::Grammar => "grammar",
            ActivityKind::Empty => "empty",
        }
    }

    pub fn parse(s: &str) -> Option<ActivityKind> {
        match s {
            "vocab" => Some(ActivityKind::Vocab),
            "listening" => Some(ActivityKind::Listening),
            "reading" => Some(ActivityKind::Reading),
            "grammar" => Some(ActivityKind::Grammar),
            "empty" => Some(ActivityKind::Empty),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One position in a class's activity format. The format is fixed for every
/// day of the curriculum; `empty` slots are placeholders that still occupy a
/// positional index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTemplate {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub level: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Curriculum {
    pub number_of_days: i64,
    pub class_format: Vec<SlotTemplate>,
    #[serde(default)]
    pub started_days: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteActivity {
    pub id: String,
    pub kind: ActivityKind,
    pub level: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub day: i64,
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayState {
    pub day: i64,
    pub unlocked: bool,
    pub completed: bool,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no material available for {kind} level {level}")]
    NoMaterialAvailable { kind: ActivityKind, level: i64 },

    #[error("cannot shrink curriculum to {requested} days; a student has completed {min_allowed}")]
    ShrinkRejected { requested: i64, min_allowed: i64 },
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::NoMaterialAvailable { .. } => "no_material_available",
            ResolveError::ShrinkRejected { .. } => "curriculum_shrink_rejected",
        }
    }
}

/// Derived id for the activity at (day, slot). Stable only for as long as the
/// class format keeps its ordering: reordering the format re-keys every day's
/// activities, which orphans stored overrides and completion matches.
pub fn activity_id(day: i64, slot: usize) -> String {
    format!("day-{}-activity-{}", day, slot)
}

pub fn parse_activity_id(id: &str) -> Option<SlotRef> {
    let rest = id.strip_prefix("day-")?;
    let (day_part, rest) = rest.split_once("-activity-")?;
    let day: i64 = day_part.parse().ok()?;
    let slot: usize = rest.parse().ok()?;
    if day < 1 {
        return None;
    }
    Some(SlotRef { day, slot })
}

/// Every activity of one day, empty placeholders included.
pub fn day_activities(format: &[SlotTemplate], day: i64) -> Vec<ConcreteActivity> {
    format
        .iter()
        .enumerate()
        .map(|(slot, tpl)| ConcreteActivity {
            id: activity_id(day, slot),
            kind: tpl.kind,
            level: tpl.level,
        })
        .collect()
}

/// Index into the ordered catalog for (day, slot), before the modulo wrap.
///
/// Slots sharing a (type, level) within one day each get a distinct ordinal,
/// and consecutive days advance by the number of such slots, so the class
/// walks the whole catalog before any item repeats. Returns `None` for empty
/// or out-of-range slots.
pub fn rotation_index(format: &[SlotTemplate], day: i64, slot: usize) -> Option<usize> {
    if day < 1 {
        return None;
    }
    let tpl = format.get(slot)?;
    if tpl.kind == ActivityKind::Empty {
        return None;
    }

    let same_slot_count = format
        .iter()
        .filter(|t| t.kind == tpl.kind && t.level == tpl.level)
        .count();
    let ordinal_among_same = format[..slot]
        .iter()
        .filter(|t| t.kind == tpl.kind && t.level == tpl.level)
        .count();

    Some((day as usize - 1) * same_slot_count + ordinal_among_same)
}

/// Day lock states for one student, recomputed from the completion set on
/// every call. Day 1 is always unlocked; later days unlock when the previous
/// day is fully completed or the teacher has started them explicitly.
pub fn day_states(curriculum: &Curriculum, completed_ids: &HashSet<String>) -> Vec<DayState> {
    let started: HashSet<i64> = curriculum.started_days.iter().copied().collect();
    let mut out = Vec::with_capacity(curriculum.number_of_days.max(0) as usize);
    let mut previous_completed = true;

    for day in 1..=curriculum.number_of_days {
        let completed = day_completed(&curriculum.class_format, day, completed_ids);
        let unlocked = day == 1 || previous_completed || started.contains(&day);
        out.push(DayState {
            day,
            unlocked,
            completed,
        });
        previous_completed = completed;
    }
    out
}

fn day_completed(format: &[SlotTemplate], day: i64, completed_ids: &HashSet<String>) -> bool {
    format.iter().enumerate().all(|(slot, tpl)| {
        tpl.kind == ActivityKind::Empty || completed_ids.contains(&activity_id(day, slot))
    })
}

/// Days this student has fully worked through: the unlocked prefix minus the
/// day they are currently on. Stops at the first locked day, so a gap the
/// teacher opened further ahead does not count as progress.
pub fn completed_day_count(curriculum: &Curriculum, completed_ids: &HashSet<String>) -> i64 {
    let started: HashSet<i64> = curriculum.started_days.iter().copied().collect();
    let mut unlocked_prefix = 0;
    let mut previous_completed = true;

    for day in 1..=curriculum.number_of_days {
        let unlocked = day == 1 || previous_completed || started.contains(&day);
        if !unlocked {
            break;
        }
        unlocked_prefix = day;
        previous_completed = day_completed(&curriculum.class_format, day, completed_ids);
    }

    (unlocked_prefix - 1).max(0)
}

/// Shrink-guard input: the furthest any single student has progressed.
pub fn max_completed_days<'a, I>(curriculum: &Curriculum, per_student: I) -> i64
where
    I: IntoIterator<Item = &'a HashSet<String>>,
{
    per_student
        .into_iter()
        .map(|completed| completed_day_count(curriculum, completed))
        .max()
        .unwrap_or(0)
}

pub fn check_shrink(curriculum: &Curriculum, min_allowed: i64) -> Result<(), ResolveError> {
    if curriculum.number_of_days < min_allowed {
        return Err(ResolveError::ShrinkRejected {
            requested: curriculum.number_of_days,
            min_allowed,
        });
    }
    Ok(())
}

pub fn validate_curriculum(curriculum: &Curriculum) -> Result<(), String> {
    if curriculum.number_of_days < 1 || curriculum.number_of_days > MAX_CURRICULUM_DAYS {
        return Err(format!(
            "numberOfDays must be between 1 and {}",
            MAX_CURRICULUM_DAYS
        ));
    }
    if curriculum.class_format.is_empty() || curriculum.class_format.len() > MAX_FORMAT_SLOTS {
        return Err(format!(
            "classFormat must have between 1 and {} entries",
            MAX_FORMAT_SLOTS
        ));
    }
    for (slot, tpl) in curriculum.class_format.iter().enumerate() {
        if tpl.kind != ActivityKind::Empty
            && (tpl.level < 1 || tpl.level > MAX_DIFFICULTY_LEVEL)
        {
            return Err(format!(
                "slot {} level must be between 1 and {}",
                slot, MAX_DIFFICULTY_LEVEL
            ));
        }
    }
    for day in &curriculum.started_days {
        if *day < 1 {
            return Err("startedDays entries must be >= 1".to_string());
        }
    }
    Ok(())
}
