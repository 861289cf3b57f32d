//! Certificate rendering, single and batch generation, and the generation
//! audit trail (`launch_log` > `certif_log` > `value_log`).

use crate::credits::{
    aggregate, format_group_lines, group_lines, parse_minutes_to_hours, CreditSummary, DateRange,
    GroupKey,
};
use crate::factories::{CategoriesFactory, ModuleNames, TrainingTemplate, TrainingsFactory};
use crate::model::{Learner, Training, ValidatedActivity};
use crate::pdf::{decode_background, render_page, Background, Orientation, PageSetup, PdfError, TextBlock};
use crate::storage::{FileStore, WriteOutcome};
use crate::template::{FieldKind, FieldPlacement, TemplateError, TemplateStore};
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use thiserror::Error;
use uuid::Uuid;

pub const SETTINGS_KEY: &str = "setup.certificates";
const FALLBACK_DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, Error)]
pub enum CertificateError {
    #[error("no template is associated with training {0}")]
    NoTemplate(i64),
    #[error("no validated activity in the period")]
    NoActivities,
    #[error("background file {0} is missing")]
    MissingBackground(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("pdf failure: {0}")]
    Pdf(String),
    #[error("database failure: {0}")]
    Db(String),
}

impl CertificateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoTemplate(_) => "no_template",
            Self::NoActivities => "no_activities",
            Self::MissingBackground(_) => "missing_background",
            Self::Storage(_) => "storage_failed",
            Self::Pdf(_) => "pdf_failed",
            Self::Db(_) => "db_query_failed",
        }
    }

    fn db(e: impl std::fmt::Display) -> Self {
        Self::Db(e.to_string())
    }

    fn storage(e: anyhow::Error) -> Self {
        Self::Storage(format!("{:#}", e))
    }
}

impl From<PdfError> for CertificateError {
    fn from(e: PdfError) -> Self {
        Self::Pdf(e.to_string())
    }
}

impl From<rusqlite::Error> for CertificateError {
    fn from(e: rusqlite::Error) -> Self {
        Self::db(e)
    }
}

impl From<TemplateError> for CertificateError {
    fn from(e: TemplateError) -> Self {
        match e {
            TemplateError::NotFound(id) => Self::NoTemplate(id),
            other => Self::db(other),
        }
    }
}

/// Workspace settings that shape certificates.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateSettings {
    pub date_format: String,
    pub orientation: Orientation,
    pub compress: bool,
    pub all_time_label: String,
    pub filename_prefix: String,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            date_format: FALLBACK_DATE_FORMAT.to_string(),
            orientation: Orientation::Portrait,
            compress: true,
            all_time_label: "All time".to_string(),
            filename_prefix: "certificate".to_string(),
        }
    }
}

impl CertificateSettings {
    pub fn to_json(&self) -> Value {
        json!({
            "dateFormat": self.date_format,
            "orientation": match self.orientation {
                Orientation::Portrait => "portrait",
                Orientation::Landscape => "landscape",
            },
            "compressPdf": self.compress,
            "periodAllTimeLabel": self.all_time_label,
            "filenamePrefix": self.filename_prefix,
        })
    }

    /// Missing or malformed entries fall back to their defaults.
    pub fn from_json(v: &Value) -> Self {
        let d = Self::default();
        let text = |key: &str, fallback: &str| {
            v.get(key)
                .and_then(|s| s.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| fallback.to_string())
        };
        let date_format = text("dateFormat", &d.date_format);
        Self {
            date_format: if is_valid_date_format(&date_format) {
                date_format
            } else {
                tracing::warn!(date_format, "ignoring invalid saved date format");
                d.date_format
            },
            orientation: v
                .get("orientation")
                .and_then(|s| s.as_str())
                .and_then(Orientation::parse)
                .unwrap_or(d.orientation),
            compress: v
                .get("compressPdf")
                .and_then(|b| b.as_bool())
                .unwrap_or(d.compress),
            all_time_label: text("periodAllTimeLabel", &d.all_time_label),
            filename_prefix: text("filenamePrefix", &d.filename_prefix),
        }
    }

    pub fn load(conn: &Connection) -> Self {
        match crate::db::settings_get_json(conn, SETTINGS_KEY) {
            Ok(Some(v)) => Self::from_json(&v),
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "certificate settings unreadable, using defaults");
                Self::default()
            }
        }
    }

    fn page_setup(&self) -> PageSetup {
        PageSetup {
            orientation: self.orientation,
            compress: self.compress,
        }
    }
}

pub fn is_valid_date_format(fmt: &str) -> bool {
    !fmt.is_empty()
        && chrono::format::StrftimeItems::new(fmt)
            .all(|item| !matches!(item, chrono::format::Item::Error))
}

pub fn format_date(d: NaiveDate, fmt: &str) -> String {
    let mut out = String::new();
    if write!(out, "{}", d.format(fmt)).is_err() {
        return d.format(FALLBACK_DATE_FORMAT).to_string();
    }
    out
}

pub fn period_text(range: &DateRange, settings: &CertificateSettings) -> String {
    let f = |d: NaiveDate| format_date(d, &settings.date_format);
    match (range.begin, range.end) {
        (Some(b), Some(e)) => format!("From {} to {}", f(b), f(e)),
        (Some(b), None) => format!("Since {}", f(b)),
        (None, Some(e)) => format!("Until {}", f(e)),
        (None, None) => settings.all_time_label.clone(),
    }
}

/// `<prefix>_<lastname><firstname>_<learner>_<training>_<begin|all>_<end|all>.pdf`,
/// restricted to `[A-Za-z0-9._-]`. The learner id keeps homonyms apart.
pub fn certificate_filename(
    prefix: &str,
    learner: &Learner,
    training_id: i64,
    range: &DateRange,
) -> String {
    let raw = format!(
        "{}_{}{}_{}_{}_{}_{}.pdf",
        prefix,
        learner.lastname,
        learner.firstname,
        learner.id,
        training_id,
        range.begin_str().unwrap_or_else(|| "all".into()),
        range.end_str().unwrap_or_else(|| "all".into()),
    );
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// A training with everything certificate generation needs resolved.
pub struct TrainingContext {
    pub training: Training,
    pub display_name: String,
    pub template: TrainingTemplate,
}

impl TrainingContext {
    pub fn group_keys(&self) -> (GroupKey, Option<GroupKey>) {
        let key1 = GroupKey::parse(&self.template.group1).unwrap_or_else(|| {
            tracing::warn!(group = %self.template.group1, "unknown grouping key, using course name");
            GroupKey::CourseName
        });
        let key2 = self.template.group2.as_deref().and_then(GroupKey::parse);
        (key1, key2)
    }
}

pub fn load_context(
    conn: &Connection,
    module_names: &mut ModuleNames,
    training_id: i64,
) -> Result<Option<TrainingContext>, CertificateError> {
    let mut trainings = TrainingsFactory::new(conn, module_names);
    let Some(training) = trainings
        .retrieve_training_by_id(training_id)
        .map_err(CertificateError::db)?
    else {
        return Ok(None);
    };
    let template = trainings
        .template_of(training.id)
        .map_err(CertificateError::db)?
        .ok_or(CertificateError::NoTemplate(training.id))?;
    let category_name = CategoriesFactory::new(conn)
        .get_category(training.category_id)
        .map_err(CertificateError::db)?
        .map(|c| c.name)
        .unwrap_or_default();
    let display_name = training.display_name(&category_name).to_string();
    Ok(Some(TrainingContext {
        training,
        display_name,
        template,
    }))
}

/// Placements of a template with its background already decoded.
pub struct PreparedTemplate {
    pub template_id: i64,
    pub placements: Vec<FieldPlacement>,
    pub background: Option<Background>,
}

/// Values printed in the text placements.
pub struct CertificateText {
    pub learner_name: String,
    pub training_name: String,
    pub period: String,
    pub total: String,
    pub activities: String,
}

impl CertificateText {
    fn for_kind(&self, kind: FieldKind) -> &str {
        match kind {
            FieldKind::LearnerName => self.learner_name.as_str(),
            FieldKind::TrainingName => self.training_name.as_str(),
            FieldKind::Period => self.period.as_str(),
            FieldKind::TotalMinutes => self.total.as_str(),
            FieldKind::Activities => self.activities.as_str(),
            FieldKind::Background => "",
        }
    }
}

fn build_text(
    learner_name: String,
    training_name: String,
    summary: &CreditSummary,
    range: &DateRange,
    keys: (GroupKey, Option<GroupKey>),
    settings: &CertificateSettings,
) -> CertificateText {
    let lines = group_lines(summary, keys.0, keys.1);
    CertificateText {
        learner_name,
        training_name,
        period: period_text(range, settings),
        total: parse_minutes_to_hours(summary.total_minutes),
        activities: format_group_lines(&lines).join("\n"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CertificateStatus {
    New,
    Overwritten,
    Error,
}

impl CertificateStatus {
    pub fn code(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Overwritten => "OVERWRITTEN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedCertificate {
    pub filename: String,
    pub status: CertificateStatus,
    pub sha256: String,
    pub summary: CreditSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerOutcome {
    pub learner_id: i64,
    pub learner_name: String,
    pub certificate_id: String,
    pub filename: String,
    pub status: CertificateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub launch_id: String,
    pub created: usize,
    pub overwritten: usize,
    pub failed: usize,
    pub outcomes: Vec<LearnerOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleReport {
    pub path: String,
    pub included: Vec<String>,
    pub missing: Vec<i64>,
}

pub struct CertificateGenerator<'a> {
    conn: &'a Connection,
    files: &'a FileStore,
    settings: CertificateSettings,
}

impl<'a> CertificateGenerator<'a> {
    pub fn new(conn: &'a Connection, files: &'a FileStore, settings: CertificateSettings) -> Self {
        Self {
            conn,
            files,
            settings,
        }
    }

    pub fn prepare(&self, template_id: i64) -> Result<PreparedTemplate, CertificateError> {
        let placements = TemplateStore::new(self.conn).load(template_id)?;
        let filename = placements.iter().find_map(|p| match p {
            FieldPlacement::Background { filename } => Some(filename.clone()),
            FieldPlacement::Text(_) => None,
        });
        let background = match filename {
            None => None,
            Some(name) => {
                let path = self
                    .files
                    .background_path(template_id, &name)
                    .map_err(CertificateError::storage)?;
                if !path.is_file() {
                    return Err(CertificateError::MissingBackground(name));
                }
                let bytes = self.files.read(&path).map_err(CertificateError::storage)?;
                Some(decode_background(&bytes)?)
            }
        };
        Ok(PreparedTemplate {
            template_id,
            placements,
            background,
        })
    }

    pub fn render(
        &self,
        prepared: &PreparedTemplate,
        text: &CertificateText,
    ) -> Result<Vec<u8>, CertificateError> {
        let blocks: Vec<TextBlock> = prepared
            .placements
            .iter()
            .filter_map(|p| match p {
                FieldPlacement::Text(t) => Some(t),
                FieldPlacement::Background { .. } => None,
            })
            .filter(|t| !text.for_kind(t.kind).is_empty())
            .map(|t| TextBlock {
                x: t.x,
                y: t.y,
                font: t.font,
                align: t.align,
                text: text.for_kind(t.kind).to_string(),
            })
            .collect();
        Ok(render_page(
            &self.settings.page_setup(),
            prepared.background.as_ref(),
            &blocks,
        )?)
    }

    fn generate_with(
        &self,
        ctx: &TrainingContext,
        prepared: &PreparedTemplate,
        learner: &Learner,
        range: &DateRange,
    ) -> Result<GeneratedCertificate, CertificateError> {
        let summary = aggregate(learner, range, &ctx.training);
        if summary.counted == 0 {
            return Err(CertificateError::NoActivities);
        }
        let text = build_text(
            learner.full_name(),
            ctx.display_name.clone(),
            &summary,
            range,
            ctx.group_keys(),
            &self.settings,
        );
        let bytes = self.render(prepared, &text)?;

        let filename = certificate_filename(
            &self.settings.filename_prefix,
            learner,
            ctx.training.id,
            range,
        );
        let path = self
            .files
            .certificate_path(&filename)
            .map_err(CertificateError::storage)?;
        let status = match self.files.write(&path, &bytes).map_err(CertificateError::storage)? {
            WriteOutcome::Created => CertificateStatus::New,
            WriteOutcome::Replaced => CertificateStatus::Overwritten,
        };
        Ok(GeneratedCertificate {
            filename,
            status,
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            summary,
        })
    }

    /// One learner's certificate. Errors go back to the caller; nothing is
    /// logged.
    pub fn generate_one(
        &self,
        ctx: &TrainingContext,
        learner: &Learner,
        range: &DateRange,
    ) -> Result<GeneratedCertificate, CertificateError> {
        let prepared = self.prepare(ctx.template.template_id)?;
        let generated = self.generate_with(ctx, &prepared, learner, range)?;
        tracing::info!(
            training_id = ctx.training.id,
            template_id = prepared.template_id,
            learner_id = learner.id,
            status = generated.status.code(),
            "certificate generated"
        );
        Ok(generated)
    }

    /// Certificates for the whole roster. A learner's failure is recorded as
    /// an `ERROR` entry and the batch moves on; only audit-log writes abort.
    pub fn generate_all(
        &self,
        ctx: &TrainingContext,
        range: &DateRange,
        operator_id: Option<i64>,
    ) -> Result<BatchReport, CertificateError> {
        let launch_id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO launch_log(id, time_generated, begin_date, end_date, operator_id)
             VALUES(?, ?, ?, ?, ?)",
            (
                &launch_id,
                Utc::now().timestamp(),
                range.begin_str(),
                range.end_str(),
                operator_id,
            ),
        )?;

        let prepared = self.prepare(ctx.template.template_id);
        let mut report = BatchReport {
            launch_id: launch_id.clone(),
            created: 0,
            overwritten: 0,
            failed: 0,
            outcomes: Vec::new(),
        };

        for learner in ctx.training.sorted_learners() {
            let certificate_id = Uuid::new_v4().to_string();
            let result = match &prepared {
                Ok(p) => self.generate_with(ctx, p, learner, range),
                Err(e) => Err(e.clone()),
            };
            let outcome = match result {
                Ok(g) => {
                    self.log_success(&launch_id, &certificate_id, ctx.training.id, learner.id, &g)?;
                    match g.status {
                        CertificateStatus::Overwritten => report.overwritten += 1,
                        _ => report.created += 1,
                    }
                    tracing::info!(
                        launch_id = %launch_id,
                        learner_id = learner.id,
                        status = g.status.code(),
                        "certificate generated"
                    );
                    LearnerOutcome {
                        learner_id: learner.id,
                        learner_name: learner.full_name(),
                        certificate_id,
                        filename: g.filename,
                        status: g.status,
                        error_code: None,
                        message: None,
                    }
                }
                Err(e) => {
                    let filename = certificate_filename(
                        &self.settings.filename_prefix,
                        learner,
                        ctx.training.id,
                        range,
                    );
                    self.conn.execute(
                        "INSERT INTO certif_log(id, filename, status, training_id, learner_id, launch_id, sha256, message)
                         VALUES(?, ?, ?, ?, ?, ?, NULL, ?)",
                        (
                            &certificate_id,
                            &filename,
                            CertificateStatus::Error.code(),
                            ctx.training.id,
                            learner.id,
                            &launch_id,
                            e.to_string(),
                        ),
                    )?;
                    report.failed += 1;
                    tracing::warn!(
                        launch_id = %launch_id,
                        learner_id = learner.id,
                        error = %e,
                        "certificate generation failed"
                    );
                    LearnerOutcome {
                        learner_id: learner.id,
                        learner_name: learner.full_name(),
                        certificate_id,
                        filename,
                        status: CertificateStatus::Error,
                        error_code: Some(e.code().to_string()),
                        message: Some(e.to_string()),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        tracing::info!(
            launch_id = %launch_id,
            training_id = ctx.training.id,
            created = report.created,
            overwritten = report.overwritten,
            failed = report.failed,
            "batch generation finished"
        );
        Ok(report)
    }

    fn log_success(
        &self,
        launch_id: &str,
        certificate_id: &str,
        training_id: i64,
        learner_id: i64,
        g: &GeneratedCertificate,
    ) -> Result<(), CertificateError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO certif_log(id, filename, status, training_id, learner_id, launch_id, sha256, message)
             VALUES(?, ?, ?, ?, ?, ?, ?, NULL)",
            (
                certificate_id,
                &g.filename,
                g.status.code(),
                training_id,
                learner_id,
                launch_id,
                &g.sha256,
            ),
        )?;
        for a in &g.summary.activities {
            tx.execute(
                "INSERT INTO value_log(certificate_id, module_id, credited_time) VALUES(?, ?, ?)",
                (certificate_id, a.activity_id, a.milestone),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Zips the certificates already generated for the roster and range.
    pub fn bundle(&self, ctx: &TrainingContext, range: &DateRange) -> Result<BundleReport, CertificateError> {
        let mut included = Vec::new();
        let mut missing = Vec::new();
        for learner in ctx.training.sorted_learners() {
            let filename = certificate_filename(
                &self.settings.filename_prefix,
                learner,
                ctx.training.id,
                range,
            );
            let path = self
                .files
                .certificate_path(&filename)
                .map_err(CertificateError::storage)?;
            if path.is_file() {
                included.push(filename);
            } else {
                missing.push(learner.id);
            }
        }
        let bundle_name = format!(
            "certificates_{}_{}_{}.zip",
            ctx.training.id,
            range.begin_str().unwrap_or_else(|| "all".into()),
            range.end_str().unwrap_or_else(|| "all".into()),
        );
        let summary = self
            .files
            .bundle_certificates(&bundle_name, &included)
            .map_err(CertificateError::storage)?;
        tracing::debug!(path = %summary.path.display(), entries = summary.entry_count, "zip written");
        Ok(BundleReport {
            path: summary.path.to_string_lossy().to_string(),
            included,
            missing,
        })
    }

    /// Renders a template with sample values. No log entries are written.
    pub fn preview(&self, template_id: i64) -> Result<String, CertificateError> {
        let prepared = self.prepare(template_id)?;
        let name = TemplateStore::new(self.conn)
            .name(template_id)?
            .unwrap_or_default();
        let today = Utc::now().date_naive();
        let range = DateRange::new(NaiveDate::from_ymd_opt(today.year(), 1, 1), Some(today));
        let summary = sample_summary();
        let text = build_text(
            "Firstname Lastname".to_string(),
            name,
            &summary,
            &range,
            (GroupKey::CourseName, None),
            &self.settings,
        );
        let bytes = self.render(&prepared, &text)?;
        let path = self
            .files
            .preview_path(&format!("template_{}.pdf", template_id))
            .map_err(CertificateError::storage)?;
        self.files
            .write(&path, &bytes)
            .map_err(CertificateError::storage)?;
        Ok(path.to_string_lossy().to_string())
    }
}

fn sample_summary() -> CreditSummary {
    let sample = |id: i64, course: &str, name: &str, minutes: i64| ValidatedActivity {
        activity_id: id,
        activity_name: name.to_string(),
        module_type: "quiz".to_string(),
        course_id: id,
        course_name: course.to_string(),
        milestone: Some(minutes),
        completed_at: 0,
    };
    let activities = vec![
        sample(1, "Course A", "Activity 1", 90),
        sample(2, "Course A", "Activity 2", 30),
        sample(3, "Course B", "Activity 3", 45),
    ];
    CreditSummary {
        learner_id: 0,
        training_id: 0,
        total_minutes: activities.iter().filter_map(|a| a.milestone).sum(),
        counted: activities.len(),
        credited: activities.len(),
        activities,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueLogEntry {
    pub module_id: i64,
    pub credited_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateLogEntry {
    pub id: String,
    pub filename: String,
    pub status: String,
    pub training_id: i64,
    pub learner_id: i64,
    pub sha256: Option<String>,
    pub message: Option<String>,
    pub values: Vec<ValueLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchLogEntry {
    pub id: String,
    pub time_generated: i64,
    pub begin_date: Option<String>,
    pub end_date: Option<String>,
    pub operator_id: Option<i64>,
    pub certificates: Vec<CertificateLogEntry>,
}

/// Generation history, newest launch first. `training_id` keeps only the
/// certificates of that training.
pub fn read_logs(conn: &Connection, training_id: Option<i64>) -> rusqlite::Result<Vec<LaunchLogEntry>> {
    let mut launches_stmt = conn.prepare(
        "SELECT id, time_generated, begin_date, end_date, operator_id
         FROM launch_log ORDER BY time_generated DESC, rowid DESC",
    )?;
    let mut launches = launches_stmt
        .query_map([], |r| {
            Ok(LaunchLogEntry {
                id: r.get(0)?,
                time_generated: r.get(1)?,
                begin_date: r.get(2)?,
                end_date: r.get(3)?,
                operator_id: r.get(4)?,
                certificates: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cert_stmt = conn.prepare(
        "SELECT id, filename, status, training_id, learner_id, sha256, message
         FROM certif_log
         WHERE launch_id = ?1 AND (?2 IS NULL OR training_id = ?2)
         ORDER BY rowid",
    )?;
    let mut value_stmt = conn.prepare(
        "SELECT module_id, credited_time FROM value_log WHERE certificate_id = ? ORDER BY rowid",
    )?;
    for launch in &mut launches {
        let certs = cert_stmt
            .query_map((&launch.id, training_id), |r| {
                Ok(CertificateLogEntry {
                    id: r.get(0)?,
                    filename: r.get(1)?,
                    status: r.get(2)?,
                    training_id: r.get(3)?,
                    learner_id: r.get(4)?,
                    sha256: r.get(5)?,
                    message: r.get(6)?,
                    values: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for mut cert in certs {
            cert.values = value_stmt
                .query_map([&cert.id], |r| {
                    Ok(ValueLogEntry {
                        module_id: r.get(0)?,
                        credited_time: r.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            launch.certificates.push(cert);
        }
    }
    if training_id.is_some() {
        launches.retain(|l| !l.certificates.is_empty());
    }
    Ok(launches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::factories::fixtures::seed_host;
    use crate::template::{Alignment, Emphasis, Font, FontFamily, FontSize, TextPlacement};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn learner(first: &str, last: &str) -> Learner {
        Learner {
            id: 7,
            firstname: first.into(),
            lastname: last.into(),
            completions: Vec::new(),
        }
    }

    fn setup() -> (Connection, tempfile::TempDir, FileStore, TrainingContext) {
        let conn = open_in_memory().expect("db");
        seed_host(&conn);
        let mut names = ModuleNames::default();
        TrainingsFactory::new(&conn, &mut names)
            .persist_training(1, true)
            .expect("flag");
        let ctx = load_context(&conn, &mut names, 1)
            .expect("context")
            .expect("training");
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FileStore::new(dir.path());
        (conn, dir, files, ctx)
    }

    fn uncompressed() -> CertificateSettings {
        CertificateSettings {
            compress: false,
            ..CertificateSettings::default()
        }
    }

    #[test]
    fn filename_drops_unsafe_characters() {
        let range = DateRange::new(Some(day(2024, 1, 1)), None);
        let name = certificate_filename("certificate", &learner("Zoé", "O'Neil"), 3, &range);
        assert_eq!(name, "certificate_ONeilZo_7_3_2024-01-01_all.pdf");
    }

    #[test]
    fn period_wording() {
        let s = CertificateSettings::default();
        let b = Some(day(2024, 1, 5));
        let e = Some(day(2024, 2, 1));
        assert_eq!(period_text(&DateRange::new(b, e), &s), "From 05/01/2024 to 01/02/2024");
        assert_eq!(period_text(&DateRange::new(b, None), &s), "Since 05/01/2024");
        assert_eq!(period_text(&DateRange::new(None, e), &s), "Until 01/02/2024");
        assert_eq!(period_text(&DateRange::default(), &s), "All time");
    }

    #[test]
    fn date_format_validation() {
        assert!(is_valid_date_format("%Y-%m-%d"));
        assert!(!is_valid_date_format("%Q"));
        assert!(!is_valid_date_format(""));
        let s = CertificateSettings::from_json(&json!({ "dateFormat": "%Q", "compressPdf": false }));
        assert_eq!(s.date_format, FALLBACK_DATE_FORMAT);
        assert!(!s.compress);
    }

    #[test]
    fn single_certificate_reports_new_then_overwritten() {
        let (conn, _dir, files, ctx) = setup();
        let generator = CertificateGenerator::new(&conn, &files, uncompressed());
        let ada = &ctx.training.learners[&7];
        let range = DateRange::default();

        let first = generator.generate_one(&ctx, ada, &range).expect("first");
        assert_eq!(first.status, CertificateStatus::New);
        assert_eq!(first.summary.total_minutes, 15);
        assert_eq!(first.filename, "certificate_LovelaceAda_7_1_all_all.pdf");
        let second = generator.generate_one(&ctx, ada, &range).expect("second");
        assert_eq!(second.status, CertificateStatus::Overwritten);
        assert_eq!(first.sha256, second.sha256);

        let bytes = std::fs::read(files.certificate_path(&first.filename).expect("path")).expect("read");
        let needle = b"Ada Lovelace";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
        let total = b"0h15";
        assert!(bytes.windows(total.len()).any(|w| w == total));
    }

    #[test]
    fn learner_without_activity_is_an_error() {
        let (conn, _dir, files, ctx) = setup();
        let generator = CertificateGenerator::new(&conn, &files, uncompressed());
        let alan = &ctx.training.learners[&8];
        let err = generator
            .generate_one(&ctx, alan, &DateRange::default())
            .expect_err("no activities");
        assert!(matches!(err, CertificateError::NoActivities));
    }

    #[test]
    fn missing_background_is_reported() {
        let (conn, _dir, files, ctx) = setup();
        TemplateStore::new(&conn)
            .set_background(ctx.template.template_id, "gone.png")
            .expect("bg");
        let generator = CertificateGenerator::new(&conn, &files, uncompressed());
        let ada = &ctx.training.learners[&7];
        let err = generator
            .generate_one(&ctx, ada, &DateRange::default())
            .expect_err("missing");
        assert!(matches!(err, CertificateError::MissingBackground(ref f) if f == "gone.png"));
    }

    #[test]
    fn batch_logs_every_learner_and_continues_after_failure() {
        let (conn, _dir, files, ctx) = setup();
        let generator = CertificateGenerator::new(&conn, &files, uncompressed());
        let report = generator
            .generate_all(&ctx, &DateRange::default(), Some(2))
            .expect("batch");
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 1);
        // ordered by last name: Lovelace, Turing
        assert_eq!(report.outcomes[0].status, CertificateStatus::New);
        assert_eq!(report.outcomes[1].status, CertificateStatus::Error);
        assert_eq!(report.outcomes[1].error_code.as_deref(), Some("no_activities"));

        let logs = read_logs(&conn, Some(ctx.training.id)).expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].operator_id, Some(2));
        let certs = &logs[0].certificates;
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].status, "NEW");
        assert_eq!(certs[0].sha256.as_ref().map(|s| s.len()), Some(64));
        let values: Vec<(i64, Option<i64>)> = certs[0]
            .values
            .iter()
            .map(|v| (v.module_id, v.credited_time))
            .collect();
        assert_eq!(values, vec![(1000, Some(10)), (1001, None), (2000, Some(5))]);
        assert_eq!(certs[1].status, "ERROR");
        assert!(certs[1].sha256.is_none());
        assert!(certs[1].message.is_some());
        assert!(certs[1].values.is_empty());

        let again = generator
            .generate_all(&ctx, &DateRange::default(), None)
            .expect("batch");
        assert_eq!(again.overwritten, 1);
        assert_eq!(read_logs(&conn, None).expect("logs").len(), 2);
    }

    #[test]
    fn homonyms_get_their_own_certificate() {
        let (conn, _dir, files, mut ctx) = setup();
        let ada = ctx.training.learners[&7].clone();
        let twin = ctx.training.learners.get_mut(&8).expect("learner 8");
        twin.firstname = ada.firstname.clone();
        twin.lastname = ada.lastname.clone();
        twin.completions = ada.completions.clone();

        let generator = CertificateGenerator::new(&conn, &files, uncompressed());
        let report = generator
            .generate_all(&ctx, &DateRange::default(), None)
            .expect("batch");
        assert_eq!(report.created, 2);
        assert_eq!(report.overwritten, 0);
        let names: Vec<&str> = report.outcomes.iter().map(|o| o.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "certificate_LovelaceAda_7_1_all_all.pdf",
                "certificate_LovelaceAda_8_1_all_all.pdf"
            ]
        );
        for name in names {
            assert!(files.certificate_path(name).expect("path").is_file());
        }
        let bundle = generator.bundle(&ctx, &DateRange::default()).expect("bundle");
        assert_eq!(bundle.included.len(), 2);
        assert!(bundle.missing.is_empty());
    }

    #[test]
    fn bundle_lists_missing_learners() {
        let (conn, _dir, files, ctx) = setup();
        let generator = CertificateGenerator::new(&conn, &files, uncompressed());
        generator
            .generate_all(&ctx, &DateRange::default(), None)
            .expect("batch");
        let report = generator.bundle(&ctx, &DateRange::default()).expect("bundle");
        assert_eq!(report.included, vec!["certificate_LovelaceAda_7_1_all_all.pdf".to_string()]);
        assert_eq!(report.missing, vec![8]);
        assert!(std::path::Path::new(&report.path).is_file());
    }

    #[test]
    fn preview_renders_sample_values_without_logging() {
        let (conn, _dir, files, _ctx) = setup();
        let store = TemplateStore::new(&conn);
        let id = store.create("Spring").expect("create");
        store
            .save(
                id,
                &[FieldPlacement::Text(TextPlacement {
                    kind: FieldKind::Activities,
                    x: 20.0,
                    y: 100.0,
                    font: Font {
                        family: FontFamily::Courier,
                        emphasis: Emphasis::Regular,
                        size: FontSize::new(10).expect("size"),
                    },
                    align: Alignment::Left,
                })],
            )
            .expect("save");
        let generator = CertificateGenerator::new(&conn, &files, uncompressed());
        let path = generator.preview(id).expect("preview");
        let bytes = std::fs::read(path).expect("read");
        let needle = b"Course A : 2h00";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
        assert!(read_logs(&conn, None).expect("logs").is_empty());
    }
}
