use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Template every training starts from; seeded on workspace open.
pub const SITE_TEMPLATE_ID: i64 = 0;
pub const SITE_TEMPLATE_NAME: &str = "Site";

/// Stored placement record version.
const RECORD_VERSION: u32 = 1;

/// Placements must sit on a page; anything past a metre is a typo.
pub const MAX_POSITION_MM: f64 = 1000.0;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {0} not found")]
    NotFound(i64),
    #[error("unknown field kind: {0}")]
    UnknownKind(String),
    #[error("cannot decode {kind} placement: {reason}")]
    Decode { kind: String, reason: String },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontFamily {
    Courier,
    Helvetica,
    Times,
}

impl FontFamily {
    const ORDER: [Self; 3] = [Self::Courier, Self::Helvetica, Self::Times];

    pub fn code(self) -> &'static str {
        match self {
            Self::Courier => "courier",
            Self::Helvetica => "helvetica",
            Self::Times => "times",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|f| f.code() == s.to_ascii_lowercase())
    }

    pub fn legacy_index(self) -> usize {
        self as usize
    }

    pub fn from_legacy_index(i: usize) -> Option<Self> {
        Self::ORDER.get(i).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emphasis {
    Regular,
    Bold,
    Italic,
}

impl Emphasis {
    const ORDER: [Self; 3] = [Self::Regular, Self::Bold, Self::Italic];

    pub fn code(self) -> &'static str {
        match self {
            Self::Regular => "",
            Self::Bold => "B",
            Self::Italic => "I",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|e| e.code() == s.to_ascii_uppercase())
    }

    pub fn legacy_index(self) -> usize {
        self as usize
    }

    pub fn from_legacy_index(i: usize) -> Option<Self> {
        Self::ORDER.get(i).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Right,
    Center,
    Justify,
}

impl Alignment {
    const ORDER: [Self; 4] = [Self::Left, Self::Right, Self::Center, Self::Justify];

    pub fn code(self) -> &'static str {
        match self {
            Self::Left => "L",
            Self::Right => "R",
            Self::Center => "C",
            Self::Justify => "J",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|a| a.code() == s.to_ascii_uppercase())
    }

    pub fn legacy_index(self) -> usize {
        self as usize
    }

    pub fn from_legacy_index(i: usize) -> Option<Self> {
        Self::ORDER.get(i).copied()
    }
}

/// Point sizes offered by the template form, in form order.
pub const FONT_SIZES: [u16; 26] = [
    6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 18, 20, 22, 24, 26, 28, 32, 36, 40, 44, 48, 54, 60, 66,
    72,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontSize(u16);

impl FontSize {
    pub fn new(points: u16) -> Option<Self> {
        FONT_SIZES.contains(&points).then_some(Self(points))
    }

    pub fn points(self) -> u16 {
        self.0
    }

    pub fn legacy_index(self) -> usize {
        FONT_SIZES.iter().position(|s| *s == self.0).unwrap_or(0)
    }

    pub fn from_legacy_index(i: usize) -> Option<Self> {
        FONT_SIZES.get(i).map(|s| Self(*s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Font {
    pub family: FontFamily,
    pub emphasis: Emphasis,
    pub size: FontSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldKind {
    LearnerName,
    TrainingName,
    Period,
    TotalMinutes,
    Activities,
    Background,
}

impl FieldKind {
    pub const ALL: [Self; 6] = [
        Self::LearnerName,
        Self::TrainingName,
        Self::Period,
        Self::TotalMinutes,
        Self::Activities,
        Self::Background,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::LearnerName => "learnername",
            Self::TrainingName => "trainingname",
            Self::Period => "period",
            Self::TotalMinutes => "totalminutes",
            Self::Activities => "activities",
            Self::Background => "background",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextPlacement {
    pub kind: FieldKind,
    /// Millimetres from the left edge.
    pub x: f64,
    /// Millimetres from the top edge.
    pub y: f64,
    pub font: Font,
    pub align: Alignment,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldPlacement {
    Text(TextPlacement),
    Background { filename: String },
}

impl FieldPlacement {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(t) => t.kind,
            Self::Background { .. } => FieldKind::Background,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Background { filename } => json!({
                "kind": FieldKind::Background.code(),
                "filename": filename,
            }),
            Self::Text(t) => json!({
                "kind": t.kind.code(),
                "x": t.x,
                "y": t.y,
                "fontFamily": t.font.family.code(),
                "emphasis": t.font.emphasis.code(),
                "fontSize": t.font.size.points(),
                "align": t.align.code(),
                "formIndex": {
                    "fontFamily": t.font.family.legacy_index(),
                    "emphasis": t.font.emphasis.legacy_index(),
                    "fontSize": t.font.size.legacy_index(),
                    "align": t.align.legacy_index(),
                }
            }),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredFont {
    family: String,
    emphasis: String,
    size: u16,
}

#[derive(Serialize, Deserialize)]
struct StoredLocation {
    x: f64,
    y: f64,
}

#[derive(Serialize, Deserialize)]
struct StoredText {
    v: u32,
    font: StoredFont,
    location: StoredLocation,
    align: String,
}

#[derive(Serialize, Deserialize)]
struct StoredBackground {
    v: u32,
    filename: String,
}

fn encode(p: &FieldPlacement) -> Result<String, TemplateError> {
    let out = match p {
        FieldPlacement::Background { filename } => serde_json::to_string(&StoredBackground {
            v: RECORD_VERSION,
            filename: filename.clone(),
        }),
        FieldPlacement::Text(t) => serde_json::to_string(&StoredText {
            v: RECORD_VERSION,
            font: StoredFont {
                family: t.font.family.code().to_string(),
                emphasis: t.font.emphasis.code().to_string(),
                size: t.font.size.points(),
            },
            location: StoredLocation { x: t.x, y: t.y },
            align: t.align.code().to_string(),
        }),
    };
    out.map_err(|e| TemplateError::Invalid(e.to_string()))
}

fn decode(kind_code: &str, data: &str) -> Result<FieldPlacement, TemplateError> {
    let kind = FieldKind::parse(kind_code)
        .ok_or_else(|| TemplateError::UnknownKind(kind_code.to_string()))?;
    let fail = |reason: String| TemplateError::Decode {
        kind: kind_code.to_string(),
        reason,
    };
    if kind == FieldKind::Background {
        let rec: StoredBackground = serde_json::from_str(data).map_err(|e| fail(e.to_string()))?;
        if rec.v != RECORD_VERSION {
            return Err(fail(format!("unsupported record version {}", rec.v)));
        }
        return Ok(FieldPlacement::Background {
            filename: rec.filename,
        });
    }

    let rec: StoredText = serde_json::from_str(data).map_err(|e| fail(e.to_string()))?;
    if rec.v != RECORD_VERSION {
        return Err(fail(format!("unsupported record version {}", rec.v)));
    }
    let family = FontFamily::parse(&rec.font.family)
        .ok_or_else(|| fail(format!("unknown font family {}", rec.font.family)))?;
    let emphasis = Emphasis::parse(&rec.font.emphasis)
        .ok_or_else(|| fail(format!("unknown emphasis {}", rec.font.emphasis)))?;
    let size = FontSize::new(rec.font.size)
        .ok_or_else(|| fail(format!("unsupported font size {}", rec.font.size)))?;
    let align =
        Alignment::parse(&rec.align).ok_or_else(|| fail(format!("unknown alignment {}", rec.align)))?;
    Ok(FieldPlacement::Text(TextPlacement {
        kind,
        x: rec.location.x,
        y: rec.location.y,
        font: Font {
            family,
            emphasis,
            size,
        },
        align,
    }))
}

/// Reads one placement from request params. Enumerated fields accept either
/// their code or the legacy form index.
pub fn placement_from_json(v: &Value) -> Result<FieldPlacement, TemplateError> {
    let kind_code = v
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or_else(|| TemplateError::Invalid("placement kind must be a string".into()))?;
    let kind = FieldKind::parse(kind_code)
        .ok_or_else(|| TemplateError::UnknownKind(kind_code.to_string()))?;
    if kind == FieldKind::Background {
        let filename = v
            .get("filename")
            .and_then(|f| f.as_str())
            .ok_or_else(|| TemplateError::Invalid("background filename must be a string".into()))?;
        return Ok(FieldPlacement::Background {
            filename: filename.to_string(),
        });
    }

    let coord = |key: &str| -> Result<f64, TemplateError> {
        v.get(key)
            .and_then(|n| n.as_f64())
            .ok_or_else(|| TemplateError::Invalid(format!("{} {} must be a number", kind_code, key)))
    };
    let x = coord("x")?;
    let y = coord("y")?;

    let family = enum_field(v, "fontFamily", FontFamily::Helvetica, FontFamily::parse, FontFamily::from_legacy_index)?;
    let emphasis = enum_field(v, "emphasis", Emphasis::Regular, Emphasis::parse, Emphasis::from_legacy_index)?;
    let align = enum_field(v, "align", Alignment::Left, Alignment::parse, Alignment::from_legacy_index)?;
    let size = match v.get("fontSize") {
        None | Some(Value::Null) => FontSize(12),
        Some(n) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .and_then(FontSize::new)
            .ok_or_else(|| TemplateError::Invalid(format!("unsupported font size {}", n)))?,
    };
    let size = match v.get("fontSizeIndex").and_then(|i| i.as_u64()) {
        Some(i) => FontSize::from_legacy_index(i as usize)
            .ok_or_else(|| TemplateError::Invalid(format!("font size index {} out of range", i)))?,
        None => size,
    };

    Ok(FieldPlacement::Text(TextPlacement {
        kind,
        x,
        y,
        font: Font {
            family,
            emphasis,
            size,
        },
        align,
    }))
}

fn enum_field<T>(
    v: &Value,
    key: &str,
    default: T,
    by_code: fn(&str) -> Option<T>,
    by_index: fn(usize) -> Option<T>,
) -> Result<T, TemplateError> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(s)) => {
            by_code(s).ok_or_else(|| TemplateError::Invalid(format!("unknown {}: {}", key, s)))
        }
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|i| by_index(i as usize))
            .ok_or_else(|| TemplateError::Invalid(format!("{} index {} out of range", key, n))),
        Some(other) => Err(TemplateError::Invalid(format!(
            "{} must be a code or index, got {}",
            key, other
        ))),
    }
}

pub fn validate_placements(placements: &[FieldPlacement]) -> Result<(), TemplateError> {
    let mut seen = Vec::new();
    for p in placements {
        let kind = p.kind();
        if seen.contains(&kind) {
            return Err(TemplateError::Invalid(format!(
                "duplicate placement for {}",
                kind.code()
            )));
        }
        seen.push(kind);
        match p {
            FieldPlacement::Text(t) => {
                if t.kind == FieldKind::Background {
                    return Err(TemplateError::Invalid(
                        "background placement carries a filename, not a position".into(),
                    ));
                }
                for (axis, value) in [("x", t.x), ("y", t.y)] {
                    if !value.is_finite() || !(0.0..=MAX_POSITION_MM).contains(&value) {
                        return Err(TemplateError::Invalid(format!(
                            "{} {} must be within 0..={} mm",
                            t.kind.code(),
                            axis,
                            MAX_POSITION_MM
                        )));
                    }
                }
            }
            FieldPlacement::Background { filename } => {
                if filename.trim().is_empty() {
                    return Err(TemplateError::Invalid("background filename is empty".into()));
                }
            }
        }
    }
    Ok(())
}

fn text(kind: FieldKind, x: f64, y: f64, emphasis: Emphasis, size: u16, align: Alignment) -> FieldPlacement {
    FieldPlacement::Text(TextPlacement {
        kind,
        x,
        y,
        font: Font {
            family: FontFamily::Helvetica,
            emphasis,
            size: FontSize::new(size).unwrap_or(FontSize(12)),
        },
        align,
    })
}

pub fn default_placements() -> Vec<FieldPlacement> {
    vec![
        text(FieldKind::LearnerName, 10.0, 60.0, Emphasis::Bold, 20, Alignment::Center),
        text(FieldKind::TrainingName, 10.0, 80.0, Emphasis::Regular, 16, Alignment::Center),
        text(FieldKind::Period, 10.0, 95.0, Emphasis::Italic, 12, Alignment::Center),
        text(FieldKind::TotalMinutes, 10.0, 110.0, Emphasis::Bold, 14, Alignment::Center),
        text(FieldKind::Activities, 25.0, 130.0, Emphasis::Regular, 11, Alignment::Left),
    ]
}

/// Seeds the site template on first open. Existing placements are left alone.
pub fn ensure_site_default(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO templates(id, name) VALUES(?, ?)",
        (SITE_TEMPLATE_ID, SITE_TEMPLATE_NAME),
    )?;
    let existing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM template_details WHERE template_id = ?",
        [SITE_TEMPLATE_ID],
        |r| r.get(0),
    )?;
    if existing == 0 {
        TemplateStore::new(conn).save(SITE_TEMPLATE_ID, &default_placements())?;
        tracing::info!("seeded site template");
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSummary {
    pub id: i64,
    pub name: String,
    pub training_count: i64,
}

pub struct TemplateStore<'a> {
    conn: &'a Connection,
}

impl<'a> TemplateStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn list(&self) -> Result<Vec<TemplateSummary>, TemplateError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.name,
                    (SELECT COUNT(*) FROM train_template tt WHERE tt.template_id = t.id)
             FROM templates t
             ORDER BY t.id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(TemplateSummary {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    training_count: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn name(&self, template_id: i64) -> Result<Option<String>, TemplateError> {
        Ok(self
            .conn
            .query_row(
                "SELECT name FROM templates WHERE id = ?",
                [template_id],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn require(&self, template_id: i64) -> Result<(), TemplateError> {
        match self.name(template_id)? {
            Some(_) => Ok(()),
            None => Err(TemplateError::NotFound(template_id)),
        }
    }

    pub fn load(&self, template_id: i64) -> Result<Vec<FieldPlacement>, TemplateError> {
        self.require(template_id)?;
        let mut stmt = self
            .conn
            .prepare("SELECT type, data FROM template_details WHERE template_id = ?")?;
        let rows = stmt
            .query_map([template_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = rows
            .iter()
            .map(|(kind, data)| decode(kind, data))
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|p| p.kind());
        Ok(out)
    }

    pub fn background(&self, template_id: i64) -> Result<Option<String>, TemplateError> {
        Ok(self.load(template_id)?.into_iter().find_map(|p| match p {
            FieldPlacement::Background { filename } => Some(filename),
            FieldPlacement::Text(_) => None,
        }))
    }

    /// Replaces every placement of the template.
    pub fn save(&self, template_id: i64, placements: &[FieldPlacement]) -> Result<(), TemplateError> {
        validate_placements(placements)?;
        self.require(template_id)?;
        let encoded = placements
            .iter()
            .map(|p| Ok((p.kind().code(), encode(p)?)))
            .collect::<Result<Vec<_>, TemplateError>>()?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM template_details WHERE template_id = ?",
            [template_id],
        )?;
        for (kind, data) in &encoded {
            tx.execute(
                "INSERT INTO template_details(template_id, type, data) VALUES(?, ?, ?)",
                (template_id, kind, data),
            )?;
        }
        tx.commit()?;
        tracing::info!(template_id, placements = encoded.len(), "template saved");
        Ok(())
    }

    /// Records the background file name, keeping the text placements.
    pub fn set_background(&self, template_id: i64, filename: &str) -> Result<(), TemplateError> {
        let mut placements: Vec<FieldPlacement> = self
            .load(template_id)?
            .into_iter()
            .filter(|p| p.kind() != FieldKind::Background)
            .collect();
        placements.push(FieldPlacement::Background {
            filename: filename.to_string(),
        });
        self.save(template_id, &placements)
    }

    pub fn create(&self, name: &str) -> Result<i64, TemplateError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TemplateError::Invalid("template name must not be empty".into()));
        }
        let tx = self.conn.unchecked_transaction()?;
        let id = clone_site_template(&tx, name)?;
        tx.commit()?;
        tracing::info!(template_id = id, name, "template created");
        Ok(id)
    }

    /// Template dedicated to a training, cloned from the site template the
    /// first time the training asks for one.
    pub fn ensure_for_training(&self, training_id: i64) -> Result<i64, TemplateError> {
        let tx = self.conn.unchecked_transaction()?;
        let training_name: Option<String> = tx
            .query_row(
                "SELECT name FROM trainings WHERE id = ?",
                [training_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(training_name) = training_name else {
            return Err(TemplateError::Invalid(format!(
                "training {} does not exist",
                training_id
            )));
        };
        let current: Option<i64> = tx
            .query_row(
                "SELECT template_id FROM train_template WHERE training_id = ?",
                [training_id],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = current.filter(|id| *id != SITE_TEMPLATE_ID) {
            return Ok(id);
        }

        let label = if training_name.trim().is_empty() {
            format!("Training {}", training_id)
        } else {
            training_name
        };
        let id = clone_site_template(&tx, &label)?;
        tx.execute(
            "UPDATE templates SET owner_training_id = ? WHERE id = ?",
            (training_id, id),
        )?;
        tx.execute(
            "INSERT INTO train_template(training_id, template_id) VALUES(?, ?)
             ON CONFLICT(training_id) DO UPDATE SET template_id = excluded.template_id",
            (training_id, id),
        )?;
        tx.commit()?;
        tracing::info!(training_id, template_id = id, "training template created");
        Ok(id)
    }
}

fn clone_site_template(conn: &Connection, name: &str) -> Result<i64, TemplateError> {
    let id: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) + 1 FROM templates",
        [],
        |r| r.get(0),
    )?;
    conn.execute("INSERT INTO templates(id, name) VALUES(?, ?)", (id, name))?;
    conn.execute(
        "INSERT INTO template_details(template_id, type, data)
         SELECT ?, type, data FROM template_details
         WHERE template_id = ? AND type != 'background'",
        (id, SITE_TEMPLATE_ID),
    )?;
    Ok(id)
}
