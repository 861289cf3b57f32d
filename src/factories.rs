//! Builders that turn host records into the in-memory object graph
//! (category -> training -> courses -> activities, courses -> learners).
//!
//! Factories borrow the request's connection and are dropped with it. The only
//! state that outlives a request is [`ModuleNames`], which memoises module id to
//! table name lookups; it is cleared whenever host records are re-imported.

use crate::milestone::extract_milestone;
use crate::model::{Activity, Category, Completion, Course, Learner, Training};
use crate::template::SITE_TEMPLATE_ID;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Completion state the host uses for "activity validated".
pub const COMPLETION_VALIDATED: i64 = 1;
pub const STUDENT_ROLE: &str = "student";

#[derive(Debug, Clone)]
struct ModuleInfo {
    name: String,
    is_resource: bool,
}

#[derive(Debug, Default)]
pub struct ModuleNames {
    by_id: HashMap<i64, ModuleInfo>,
}

impl ModuleNames {
    fn lookup(&mut self, conn: &Connection, module_id: i64) -> anyhow::Result<ModuleInfo> {
        if let Some(info) = self.by_id.get(&module_id) {
            return Ok(info.clone());
        }
        let info = conn
            .query_row(
                "SELECT name, is_resource FROM modules WHERE id = ?",
                [module_id],
                |r| {
                    Ok(ModuleInfo {
                        name: r.get(0)?,
                        is_resource: r.get::<_, i64>(1)? != 0,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("unknown module id {}", module_id))?;
        self.by_id.insert(module_id, info.clone());
        Ok(info)
    }

    /// Forgets every cached name; module rows may have changed.
    pub fn clear(&mut self) {
        self.by_id.clear();
    }

    #[cfg(test)]
    pub fn cached_count(&self) -> usize {
        self.by_id.len()
    }
}

pub struct ActivitiesFactory<'a> {
    conn: &'a Connection,
    module_names: &'a mut ModuleNames,
}

impl<'a> ActivitiesFactory<'a> {
    pub fn new(conn: &'a Connection, module_names: &'a mut ModuleNames) -> Self {
        Self { conn, module_names }
    }

    /// Activities of a course in section order. The milestone is the value an
    /// administrator saved, falling back to the one embedded in the description.
    pub fn retrieve_activities_by_course(&mut self, course_id: i64) -> anyhow::Result<Vec<Activity>> {
        let saved = self.saved_milestones(course_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT id, module_id, instance_id, visible, availability
             FROM course_modules
             WHERE course_id = ? AND deletion_in_progress = 0
             ORDER BY section, sort_order, id",
        )?;
        let rows = stmt
            .query_map([course_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut activities = Vec::with_capacity(rows.len());
        for (id, module_id, instance_id, visible, availability) in rows {
            let module = self.module_names.lookup(self.conn, module_id)?;
            let instance: Option<(String, Option<String>)> = self
                .conn
                .query_row(
                    "SELECT name, intro FROM module_instances WHERE module_id = ? AND id = ?",
                    (module_id, instance_id),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((name, intro)) = instance else {
                tracing::warn!(
                    course_module = id,
                    module = %module.name,
                    instance_id,
                    "course module has no instance record, skipped"
                );
                continue;
            };
            let description = intro.unwrap_or_default();
            let milestone = match saved.get(&id) {
                Some(v) => Some(*v),
                None => extract_milestone(&description),
            };
            activities.push(Activity {
                id,
                instance_id,
                name,
                description,
                module_type: module.name,
                milestone,
                visible: visible != 0,
                restricted: availability
                    .as_deref()
                    .map(|a| !a.trim().is_empty())
                    .unwrap_or(false),
                is_resource: module.is_resource,
            });
        }
        Ok(activities)
    }

    fn saved_milestones(&self, course_id: i64) -> anyhow::Result<HashMap<i64, i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.module_id, m.credited_time
             FROM milestones m
             JOIN course_modules cm ON cm.id = m.module_id
             WHERE cm.course_id = ?",
        )?;
        let out = stmt
            .query_map([course_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(out)
    }
}

pub struct LearnersFactory<'a> {
    conn: &'a Connection,
}

impl<'a> LearnersFactory<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn learner_ids_by_course(&self, course_id: i64) -> anyhow::Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT u.id, u.lastname
             FROM users u
             JOIN enrolments e ON e.user_id = u.id
             WHERE e.course_id = ? AND e.role = ?
             ORDER BY u.lastname, u.id",
        )?;
        let ids = stmt
            .query_map((course_id, STUDENT_ROLE), |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Student-role learners of a course, ordered by last name, each with
    /// every activity they validated on the platform.
    pub fn retrieve_learners_by_course(&self, course_id: i64) -> anyhow::Result<Vec<Learner>> {
        self.learner_ids_by_course(course_id)?
            .into_iter()
            .filter_map(|id| self.retrieve_learner(id).transpose())
            .collect()
    }

    pub fn retrieve_learner(&self, learner_id: i64) -> anyhow::Result<Option<Learner>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT firstname, lastname FROM users WHERE id = ?",
                [learner_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((firstname, lastname)) = row else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "SELECT course_module_id, time_modified
             FROM completions
             WHERE user_id = ? AND completion_state = ?
             ORDER BY time_modified, course_module_id",
        )?;
        let completions = stmt
            .query_map((learner_id, COMPLETION_VALIDATED), |r| {
                Ok(Completion {
                    activity_id: r.get(0)?,
                    completed_at: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Learner {
            id: learner_id,
            firstname,
            lastname,
            completions,
        }))
    }
}

pub struct CoursesFactory<'a> {
    conn: &'a Connection,
    module_names: &'a mut ModuleNames,
}

/// A course with its student-role learners.
#[derive(Debug, Clone)]
pub struct EnrolledCourse {
    pub course: Course,
    pub learners: Vec<Learner>,
}

impl<'a> CoursesFactory<'a> {
    pub fn new(conn: &'a Connection, module_names: &'a mut ModuleNames) -> Self {
        Self { conn, module_names }
    }

    /// Completion-enabled courses in the category or any category below it.
    pub fn retrieve_courses_childof_category(
        &mut self,
        category_id: i64,
    ) -> anyhow::Result<Vec<EnrolledCourse>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fullname
             FROM courses
             WHERE enable_completion = 1
               AND (category_id = ?1
                    OR category_id IN (SELECT id FROM categories
                                       WHERE path LIKE '%/' || ?1 || '/%'))
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([category_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let learners = LearnersFactory::new(self.conn);
        let mut out = Vec::with_capacity(rows.len());
        for (id, name) in rows {
            let activities = ActivitiesFactory::new(self.conn, self.module_names)
                .retrieve_activities_by_course(id)?;
            out.push(EnrolledCourse {
                course: Course {
                    id,
                    name,
                    activities,
                },
                learners: learners.retrieve_learners_by_course(id)?,
            });
        }
        Ok(out)
    }
}

pub struct CategoriesFactory<'a> {
    conn: &'a Connection,
}

impl<'a> CategoriesFactory<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get_category(&self, category_id: i64) -> anyhow::Result<Option<Category>> {
        let row: Option<(String, String, Option<i64>, String)> = self
            .conn
            .query_row(
                "SELECT name, description, parent_id, path FROM categories WHERE id = ?",
                [category_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((name, description, parent_id, path)) = row else {
            return Ok(None);
        };

        let mut hierarchy = Vec::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let Ok(id) = part.parse::<i64>() else {
                continue;
            };
            let n: Option<String> = self
                .conn
                .query_row("SELECT name FROM categories WHERE id = ?", [id], |r| r.get(0))
                .optional()?;
            if let Some(n) = n {
                hierarchy.push(n);
            }
        }
        if hierarchy.is_empty() {
            hierarchy.push(name.clone());
        }

        let is_training = self
            .conn
            .query_row(
                "SELECT 1 FROM trainings WHERE category_id = ?",
                [category_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some();

        Ok(Some(Category {
            id: category_id,
            name,
            description,
            parent_id,
            hierarchy,
            is_training,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRow {
    pub id: i64,
    pub name: String,
    pub category_id: i64,
    pub category_name: String,
    pub hierarchy: String,
    pub description: String,
}

/// Template association and display grouping of a training.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingTemplate {
    pub template_id: i64,
    pub group1: String,
    pub group2: Option<String>,
}

pub struct TrainingsFactory<'a> {
    conn: &'a Connection,
    module_names: &'a mut ModuleNames,
}

impl<'a> TrainingsFactory<'a> {
    pub fn new(conn: &'a Connection, module_names: &'a mut ModuleNames) -> Self {
        Self { conn, module_names }
    }

    pub fn list(&self) -> anyhow::Result<Vec<TrainingRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.name, t.category_id
             FROM trainings t
             ORDER BY t.id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let categories = CategoriesFactory::new(self.conn);
        let mut out = Vec::with_capacity(rows.len());
        for (id, name, category_id) in rows {
            // Trainings whose category vanished from the host are not listed.
            let Some(cat) = categories.get_category(category_id)? else {
                continue;
            };
            out.push(TrainingRow {
                id,
                name: if name.trim().is_empty() {
                    cat.name.clone()
                } else {
                    name
                },
                category_id,
                category_name: cat.name.clone(),
                hierarchy: cat.hierarchy.join(" / "),
                description: cat.description.clone(),
            });
        }
        Ok(out)
    }

    pub fn has_training(&self, category_id: i64) -> anyhow::Result<bool> {
        Ok(self.training_id(category_id)?.is_some())
    }

    pub fn training_id(&self, category_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM trainings WHERE category_id = ?",
                [category_id],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Fully populated training of a category, or `None` when the category is
    /// not flagged as a training.
    pub fn retrieve_training(&mut self, category_id: i64) -> anyhow::Result<Option<Training>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, name FROM trainings WHERE category_id = ?",
                [category_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((id, name)) = row else {
            return Ok(None);
        };

        let enrolled = CoursesFactory::new(self.conn, self.module_names)
            .retrieve_courses_childof_category(category_id)?;

        let mut learners: BTreeMap<i64, Learner> = BTreeMap::new();
        let mut courses = Vec::with_capacity(enrolled.len());
        for ec in enrolled {
            for l in ec.learners {
                learners.entry(l.id).or_insert(l);
            }
            courses.push(ec.course);
        }

        Ok(Some(Training {
            id,
            name,
            category_id,
            courses,
            learners,
        }))
    }

    pub fn retrieve_training_by_id(&mut self, training_id: i64) -> anyhow::Result<Option<Training>> {
        let category_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT category_id FROM trainings WHERE id = ?",
                [training_id],
                |r| r.get(0),
            )
            .optional()?;
        match category_id {
            Some(c) => self.retrieve_training(c),
            None => Ok(None),
        }
    }

    /// Trainings a learner is enrolled in through any of their courses.
    pub fn trainings_of_learner(&mut self, learner_id: i64) -> anyhow::Result<Vec<Training>> {
        let category_ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT category_id FROM trainings ORDER BY id")?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        let mut out = Vec::new();
        for category_id in category_ids {
            if let Some(t) = self.retrieve_training(category_id)? {
                if t.learners.contains_key(&learner_id) {
                    out.push(t);
                }
            }
        }
        Ok(out)
    }

    /// Flags or unflags a category as a training. A new training is bound to
    /// the site template and grouped by course name. Unflagging drops the
    /// template dedicated to the training; their ids are returned.
    pub fn persist_training(&self, category_id: i64, is_training: bool) -> anyhow::Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction()?;
        if is_training {
            if self.training_id(category_id)?.is_none() {
                tx.execute(
                    "INSERT INTO trainings(name, category_id) VALUES('', ?)",
                    [category_id],
                )?;
                let training_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO train_template(training_id, template_id, grp_criteria1, grp_criteria2)
                     VALUES(?, ?, 'coursename', NULL)",
                    (training_id, SITE_TEMPLATE_ID),
                )?;
            }
        } else if let Some(training_id) = self.training_id(category_id)? {
            tx.execute(
                "DELETE FROM train_template WHERE training_id = ?",
                [training_id],
            )?;
            tx.execute("DELETE FROM trainings WHERE id = ?", [training_id])?;
            // the training's own template goes with it unless another
            // training picked it since
            let owned: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM templates
                     WHERE owner_training_id = ?1
                       AND id NOT IN (SELECT template_id FROM train_template)",
                )?;
                let rows = stmt.query_map([training_id], |r| r.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            for template_id in &owned {
                tx.execute(
                    "DELETE FROM template_details WHERE template_id = ?",
                    [template_id],
                )?;
                tx.execute("DELETE FROM templates WHERE id = ?", [template_id])?;
            }
            tx.execute(
                "UPDATE templates SET owner_training_id = NULL WHERE owner_training_id = ?",
                [training_id],
            )?;
            tx.commit().context("failed to persist training flag")?;
            return Ok(owned);
        }
        tx.commit().context("failed to persist training flag")?;
        Ok(Vec::new())
    }

    pub fn rename(&self, training_id: i64, name: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE trainings SET name = ? WHERE id = ?",
            (name, training_id),
        )?;
        Ok(())
    }

    pub fn template_of(&self, training_id: i64) -> anyhow::Result<Option<TrainingTemplate>> {
        Ok(self
            .conn
            .query_row(
                "SELECT template_id, grp_criteria1, grp_criteria2
                 FROM train_template WHERE training_id = ?",
                [training_id],
                |r| {
                    let group1: String = r.get(1)?;
                    let group2: Option<String> = r.get(2)?;
                    Ok(TrainingTemplate {
                        template_id: r.get(0)?,
                        group1: if group1.trim().is_empty() {
                            "coursename".to_string()
                        } else {
                            group1
                        },
                        group2: group2.filter(|g| !g.trim().is_empty()),
                    })
                },
            )
            .optional()?)
    }

    pub fn set_template(&self, training_id: i64, tt: &TrainingTemplate) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO train_template(training_id, template_id, grp_criteria1, grp_criteria2)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(training_id) DO UPDATE SET
                template_id = excluded.template_id,
                grp_criteria1 = excluded.grp_criteria1,
                grp_criteria2 = excluded.grp_criteria2",
            (training_id, tt.template_id, &tt.group1, &tt.group2),
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fixtures {
    use rusqlite::Connection;

    /// Category 1 (training) > category 2; course 10 in 1, course 20 in 2,
    /// course 30 in 1 without completion tracking.
    pub fn seed_host(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO categories(id, name, description, parent_id, path) VALUES
                (1, 'Nursing', 'Nursing school', NULL, '/1'),
                (2, 'Year 1', '', 1, '/1/2'),
                (3, 'Other', '', NULL, '/3');
             INSERT INTO courses(id, category_id, fullname, enable_completion) VALUES
                (10, 1, 'Anatomy', 1),
                (20, 2, 'Hygiene', 1),
                (30, 1, 'Untracked', 0),
                (40, 3, 'Elsewhere', 1);
             INSERT INTO modules(id, name, visible, is_resource) VALUES
                (1, 'quiz', 1, 0),
                (2, 'resource', 1, 1);
             INSERT INTO module_instances(module_id, id, name, intro) VALUES
                (1, 100, 'Bones quiz', '<p>Quiz <span class=\"tps_jalon\">10</span></p>'),
                (2, 101, 'Skeleton notes', '<p>no time</p>'),
                (1, 102, 'Hands quiz', '<span class=''tps_jalon''>5</span>'),
                (1, 103, 'Elsewhere quiz', '<span class=\"tps_jalon\">50</span>');
             INSERT INTO course_modules(id, course_id, module_id, instance_id, section, sort_order, visible, availability) VALUES
                (1000, 10, 1, 100, 1, 0, 1, NULL),
                (1001, 10, 2, 101, 1, 1, 0, '{\"op\":\"&\"}'),
                (2000, 20, 1, 102, 0, 0, 1, NULL),
                (4000, 40, 1, 103, 0, 0, 1, NULL);
             INSERT INTO users(id, firstname, lastname) VALUES
                (7, 'Ada', 'Lovelace'),
                (8, 'Alan', 'Turing'),
                (9, 'Grace', 'Hopper');
             INSERT INTO enrolments(course_id, user_id, role) VALUES
                (10, 7, 'student'), (20, 7, 'student'),
                (10, 8, 'student'),
                (10, 9, 'editingteacher'), (40, 9, 'student');
             INSERT INTO completions(course_module_id, user_id, completion_state, time_modified) VALUES
                (1000, 7, 1, 1704067200),
                (1001, 7, 1, 1704153600),
                (2000, 7, 1, 1706745600),
                (1000, 8, 0, 1704067200),
                (4000, 9, 1, 1704067200);",
        )
        .expect("seed host tables");
    }
}
