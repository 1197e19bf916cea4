use anyhow::{anyhow, Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::models::{JobPosting, NewJobPosting, PostingKey};
use crate::stage::Stage;

const POSTING_COLUMNS: &str = "id, user_id, title, company, location, employment_type, remote_type,
     salary_min, salary_max, currency, description, ai_summary, skills, responsibilities,
     qualifications, source_url, posted_at, match_score, stage, note, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The uniqueness key already exists, either found by the pre-check or
    /// raised by the UNIQUE constraint when a concurrent insert won the race.
    Duplicate,
}

pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "scout") {
            Ok(proj_dirs.data_dir().join("scout.db"))
        } else {
            Ok(PathBuf::from("scout.db"))
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS job_postings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT '',
                employment_type TEXT NOT NULL DEFAULT '',
                remote_type TEXT NOT NULL DEFAULT '',
                salary_min INTEGER NOT NULL DEFAULT 0,
                salary_max INTEGER NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                ai_summary TEXT NOT NULL DEFAULT '',
                skills TEXT NOT NULL DEFAULT '[]',
                responsibilities TEXT NOT NULL DEFAULT '[]',
                qualifications TEXT NOT NULL DEFAULT '[]',
                source_url TEXT NOT NULL,
                posted_at TEXT,
                match_score INTEGER NOT NULL DEFAULT 0 CHECK (match_score BETWEEN 0 AND 100),
                stage TEXT NOT NULL DEFAULT 'DEFAULT'
                    CHECK (stage IN ('DEFAULT', 'WISHLIST', 'APPLIED', 'INTERVIEW', 'OFFER', 'REJECTED')),
                note TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (user_id, title, company, source_url)
            );

            CREATE INDEX IF NOT EXISTS idx_postings_user_stage ON job_postings(user_id, stage);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='job_postings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'scout init' first."));
        }
        Ok(())
    }

    // --- Posting operations ---

    pub fn find_by_key(&self, key: &PostingKey<'_>) -> Result<Option<i64>> {
        self.conn()?
            .query_row(
                "SELECT id FROM job_postings
                 WHERE user_id = ?1 AND title = ?2 AND company = ?3 AND source_url = ?4",
                params![key.user_id, key.title, key.company, key.source_url],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up posting key")
    }

    /// Inserts unless the uniqueness key is already taken.
    pub fn insert_posting(&self, posting: &NewJobPosting) -> Result<InsertOutcome> {
        if self.find_by_key(&posting.key())?.is_some() {
            return Ok(InsertOutcome::Duplicate);
        }

        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO job_postings (user_id, title, company, location, employment_type,
                 remote_type, salary_min, salary_max, currency, description, ai_summary, skills,
                 responsibilities, qualifications, source_url, posted_at, match_score, stage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                posting.user_id,
                posting.title,
                posting.company,
                posting.location,
                posting.employment_type,
                posting.remote_type,
                posting.salary_min,
                posting.salary_max,
                posting.currency,
                posting.description,
                posting.ai_summary,
                serde_json::to_string(&posting.skills)?,
                serde_json::to_string(&posting.responsibilities)?,
                serde_json::to_string(&posting.qualifications)?,
                posting.source_url,
                posting.posted_at,
                posting.match_score.min(100),
                posting.stage,
            ],
        );

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(conn.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e).context("Failed to insert posting"),
        }
    }

    pub fn get_posting(&self, id: i64) -> Result<Option<JobPosting>> {
        let sql = format!("SELECT {POSTING_COLUMNS} FROM job_postings WHERE id = ?1");
        self.conn()?
            .query_row(&sql, [id], Self::row_to_posting)
            .optional()
            .context("Failed to load posting")
    }

    pub fn list_postings(&self, user_id: Option<&str>, stage: Option<Stage>) -> Result<Vec<JobPosting>> {
        let mut sql = format!("SELECT {POSTING_COLUMNS} FROM job_postings WHERE 1=1");
        let mut params: Vec<String> = vec![];

        if let Some(user) = user_id {
            sql.push_str(&format!(" AND user_id = ?{}", params.len() + 1));
            params.push(user.to_string());
        }

        if let Some(stage) = stage {
            sql.push_str(&format!(" AND stage = ?{}", params.len() + 1));
            params.push(stage.as_str().to_string());
        }

        sql.push_str(" ORDER BY match_score DESC, id DESC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), Self::row_to_posting)?;

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list postings")
    }

    /// Moves a posting to `to` only if it is still in `from`. Returns `false`
    /// when the stored stage no longer matches.
    pub fn update_stage(&self, id: i64, from: Stage, to: Stage) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE job_postings SET stage = ?1, updated_at = datetime('now') WHERE id = ?2 AND stage = ?3",
            params![to, id, from],
        )?;
        Ok(changed > 0)
    }

    pub fn set_note(&self, id: i64, note: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            "UPDATE job_postings SET note = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![note, id],
        )?;
        Ok(())
    }

    pub fn delete_posting(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM job_postings WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn count_for_user(&self, user_id: &str) -> Result<i64> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM job_postings WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_posting(row: &rusqlite::Row) -> rusqlite::Result<JobPosting> {
        Ok(JobPosting {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            company: row.get(3)?,
            location: row.get(4)?,
            employment_type: row.get(5)?,
            remote_type: row.get(6)?,
            salary_min: row.get(7)?,
            salary_max: row.get(8)?,
            currency: row.get(9)?,
            description: row.get(10)?,
            ai_summary: row.get(11)?,
            skills: json_list(row, 12)?,
            responsibilities: json_list(row, 13)?,
            qualifications: json_list(row, 14)?,
            source_url: row.get(15)?,
            posted_at: row.get(16)?,
            match_score: row.get(17)?,
            stage: row.get(18)?,
            note: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
        })
    }
}

fn json_list(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(Vec::new()),
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl ToSql for Stage {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Stage {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn posting(user: &str, title: &str, url: &str) -> NewJobPosting {
        NewJobPosting {
            user_id: user.to_string(),
            title: title.to_string(),
            company: "Acme".to_string(),
            source_url: url.to_string(),
            skills: vec!["rust".to_string(), "sql".to_string()],
            match_score: 72,
            ..Default::default()
        }
    }

    #[test]
    fn test_ensure_initialized_requires_init() {
        let db = Database::open_in_memory().unwrap();
        let err = db.ensure_initialized().unwrap_err();
        assert!(err.to_string().contains("scout init"));
        db.init().unwrap();
        assert!(db.ensure_initialized().is_ok());
    }

    #[test]
    fn test_insert_and_get_round_trips_arrays_and_stage() {
        let db = test_db();
        let outcome = db
            .insert_posting(&posting("u1", "Backend Engineer", "https://jobs.lever.co/acme/1"))
            .unwrap();
        let InsertOutcome::Inserted(id) = outcome else {
            panic!("expected insert, got {:?}", outcome);
        };

        let stored = db.get_posting(id).unwrap().unwrap();
        assert_eq!(stored.title, "Backend Engineer");
        assert_eq!(stored.skills, vec!["rust".to_string(), "sql".to_string()]);
        assert!(stored.responsibilities.is_empty());
        assert_eq!(stored.stage, Stage::Default);
        assert_eq!(stored.match_score, 72);
        assert!(stored.note.is_none());
    }

    #[test]
    fn test_duplicate_key_is_skipped() {
        let db = test_db();
        let new = posting("u1", "Backend Engineer", "https://jobs.lever.co/acme/1");
        assert!(matches!(db.insert_posting(&new).unwrap(), InsertOutcome::Inserted(_)));
        assert_eq!(db.insert_posting(&new).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(db.count_for_user("u1").unwrap(), 1);

        // Same posting for another user is a separate key
        let other = posting("u2", "Backend Engineer", "https://jobs.lever.co/acme/1");
        assert!(matches!(db.insert_posting(&other).unwrap(), InsertOutcome::Inserted(_)));
    }

    #[test]
    fn test_unique_constraint_maps_to_duplicate() {
        let db = test_db();
        let new = posting("u1", "Backend Engineer", "https://jobs.lever.co/acme/1");
        db.insert_posting(&new).unwrap();

        // Bypass the pre-check to hit the constraint the way a racing insert would
        let conn = db.conn().unwrap();
        let err = conn
            .execute(
                "INSERT INTO job_postings (user_id, title, company, source_url) VALUES (?1, ?2, ?3, ?4)",
                params![new.user_id, new.title, new.company, new.source_url],
            )
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn test_check_constraint_is_not_a_duplicate() {
        let db = test_db();
        let conn = db.conn().unwrap();
        let err = conn
            .execute(
                "INSERT INTO job_postings (user_id, title, company, source_url, match_score)
                 VALUES ('u1', 't', 'c', 'https://x', 150)",
                [],
            )
            .unwrap_err();
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn test_update_stage_requires_expected_stage() {
        let db = test_db();
        let InsertOutcome::Inserted(id) = db
            .insert_posting(&posting("u1", "Backend Engineer", "https://a/1"))
            .unwrap()
        else {
            panic!("expected insert");
        };

        assert!(!db.update_stage(id, Stage::Wishlist, Stage::Applied).unwrap());
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Default);

        assert!(db.update_stage(id, Stage::Default, Stage::Applied).unwrap());
        assert!(!db.update_stage(id, Stage::Default, Stage::Wishlist).unwrap());
        assert_eq!(db.get_posting(id).unwrap().unwrap().stage, Stage::Applied);
    }

    #[test]
    fn test_list_filters_by_user_and_stage() {
        let db = test_db();
        db.insert_posting(&posting("u1", "Backend Engineer", "https://a/1")).unwrap();
        let InsertOutcome::Inserted(id) = db
            .insert_posting(&posting("u1", "Data Engineer", "https://a/2"))
            .unwrap()
        else {
            panic!("expected insert");
        };
        db.insert_posting(&posting("u2", "SRE", "https://a/3")).unwrap();

        assert!(db.update_stage(id, Stage::Default, Stage::Applied).unwrap());

        assert_eq!(db.list_postings(Some("u1"), None).unwrap().len(), 2);
        let applied = db.list_postings(Some("u1"), Some(Stage::Applied)).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].title, "Data Engineer");
        assert_eq!(db.list_postings(None, None).unwrap().len(), 3);
    }

    #[test]
    fn test_note_and_delete() {
        let db = test_db();
        let InsertOutcome::Inserted(id) = db
            .insert_posting(&posting("u1", "Backend Engineer", "https://a/1"))
            .unwrap()
        else {
            panic!("expected insert");
        };

        db.set_note(id, Some("recruiter replied")).unwrap();
        assert_eq!(
            db.get_posting(id).unwrap().unwrap().note.as_deref(),
            Some("recruiter replied")
        );

        assert!(db.delete_posting(id).unwrap());
        assert!(!db.delete_posting(id).unwrap());
        assert!(db.get_posting(id).unwrap().is_none());
    }
}
