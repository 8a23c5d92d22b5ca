//! SQLite persistence for cases, frames and notifications.
//!
//! One connection guarded by a mutex; every statement is short, so callers on
//! worker threads and the D-Bus handlers simply take turns.

use crate::collaborators::{
    CollaboratorError, Frame, FrameId, FrameRepository, FrameState, Notification, NotificationSink,
    UserId,
};
use chrono::{DateTime, Utc};
use lookout_core::CaseId;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cases (
    id          TEXT PRIMARY KEY,
    reporter    TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('ACTIVE', 'CLOSED')),
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS frames (
    id              TEXT PRIMARY KEY,
    image_path      TEXT NOT NULL,
    captured_at     TEXT NOT NULL,
    state           TEXT NOT NULL,
    matched_case_id TEXT
);
CREATE INDEX IF NOT EXISTS frames_state ON frames (state);
CREATE TABLE IF NOT EXISTS notifications (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id             TEXT NOT NULL,
    case_id             TEXT NOT NULL,
    message             TEXT NOT NULL,
    matched_image       TEXT NOT NULL,
    similarity          REAL NOT NULL,
    status              TEXT NOT NULL DEFAULT 'PENDING',
    detection_timestamp TEXT NOT NULL,
    created_at          TEXT NOT NULL
);
";

/// Case row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseRecord {
    pub id: CaseId,
    pub reporter: UserId,
    pub active: bool,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, CollaboratorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CollaboratorError::Invalid(format!("{}: {e}", parent.display())))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CollaboratorError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CollaboratorError> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CollaboratorError> {
        self.conn.lock().map_err(|_| CollaboratorError::LockPoisoned)
    }

    /// Insert a case as ACTIVE, or reactivate an existing one.
    pub fn upsert_active_case(&self, id: &CaseId, reporter: &UserId) -> Result<(), CollaboratorError> {
        self.conn()?.execute(
            "INSERT INTO cases (id, reporter, status, updated_at) VALUES (?1, ?2, 'ACTIVE', ?3)
             ON CONFLICT(id) DO UPDATE SET reporter = excluded.reporter, status = 'ACTIVE',
                                           updated_at = excluded.updated_at",
            params![id.as_str(), reporter.0, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Flip an ACTIVE case to CLOSED. Returns false if it was not ACTIVE.
    pub fn close_case(&self, id: &CaseId) -> Result<bool, CollaboratorError> {
        let changed = self.conn()?.execute(
            "UPDATE cases SET status = 'CLOSED', updated_at = ?2 WHERE id = ?1 AND status = 'ACTIVE'",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    pub fn case(&self, id: &CaseId) -> Result<Option<CaseRecord>, CollaboratorError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT reporter, status FROM cases WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(reporter, status)| CaseRecord {
            id: id.clone(),
            reporter: UserId(reporter),
            active: status == "ACTIVE",
        }))
    }

    pub fn active_case_ids(&self) -> Result<Vec<CaseId>, CollaboratorError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM cases WHERE status = 'ACTIVE'")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(CaseId::new).collect())
    }

    pub fn notifications_for(&self, user: &UserId) -> Result<Vec<Notification>, CollaboratorError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT case_id, matched_image, detection_timestamp, similarity
             FROM notifications WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(case_id, image_path, detected_at, similarity)| {
                Ok(Notification {
                    user: user.clone(),
                    case_id: CaseId::new(case_id),
                    image_path,
                    detected_at: parse_time(&detected_at)?,
                    similarity: similarity as f32,
                })
            })
            .collect()
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, CollaboratorError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CollaboratorError::Invalid(format!("timestamp {s:?}: {e}")))
}

impl FrameRepository for Database {
    fn insert(&self, frame: &Frame) -> Result<(), CollaboratorError> {
        self.conn()?.execute(
            "INSERT INTO frames (id, image_path, captured_at, state, matched_case_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                frame.id.0,
                frame.image_path,
                frame.captured_at.to_rfc3339(),
                frame.state.as_str(),
                frame.matched_case.as_ref().map(|c| c.as_str().to_string()),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &FrameId) -> Result<Option<Frame>, CollaboratorError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT image_path, captured_at, state, matched_case_id FROM frames WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((image_path, captured_at, state, matched)) = row else {
            return Ok(None);
        };
        let state = FrameState::parse(&state)
            .ok_or_else(|| CollaboratorError::Invalid(format!("frame state {state:?}")))?;
        Ok(Some(Frame {
            id: id.clone(),
            image_path,
            captured_at: parse_time(&captured_at)?,
            state,
            matched_case: matched.map(CaseId::new),
        }))
    }

    fn mark_processing(&self, id: &FrameId) -> Result<(), CollaboratorError> {
        let changed = self.conn()?.execute(
            "UPDATE frames SET state = 'processing' WHERE id = ?1 AND state != 'completed'",
            params![id.0],
        )?;
        if changed == 0 {
            return Err(CollaboratorError::NotFound(id.0.clone()));
        }
        Ok(())
    }

    fn complete(&self, id: &FrameId, matched_case: Option<&CaseId>) -> Result<(), CollaboratorError> {
        self.conn()?.execute(
            "UPDATE frames SET state = 'completed', matched_case_id = ?2
             WHERE id = ?1 AND state != 'completed'",
            params![id.0, matched_case.map(|c| c.as_str().to_string())],
        )?;
        Ok(())
    }

    fn unfinished(&self) -> Result<Vec<FrameId>, CollaboratorError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM frames WHERE state != 'completed' ORDER BY captured_at",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(FrameId).collect())
    }
}

impl NotificationSink for Database {
    fn emit(&self, n: &Notification) -> Result<(), CollaboratorError> {
        self.conn()?.execute(
            "INSERT INTO notifications
                (user_id, case_id, message, matched_image, similarity, detection_timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                n.user.0,
                n.case_id.as_str(),
                format!("Potential match detected for case {}", n.case_id),
                n.image_path,
                n.similarity as f64,
                n.detected_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::info!(user = %n.user, case_id = %n.case_id, similarity = n.similarity, "notification recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str) -> Frame {
        Frame {
            id: FrameId(id.into()),
            image_path: format!("frames/{id}.png"),
            captured_at: Utc::now(),
            state: FrameState::Received,
            matched_case: None,
        }
    }

    #[test]
    fn test_frame_state_machine() {
        let db = Database::open_in_memory().unwrap();
        let f = frame("f1");
        db.insert(&f).unwrap();
        assert_eq!(db.get(&f.id).unwrap().unwrap().state, FrameState::Received);

        db.mark_processing(&f.id).unwrap();
        assert_eq!(db.get(&f.id).unwrap().unwrap().state, FrameState::Processing);

        let case = CaseId::from("c1");
        db.complete(&f.id, Some(&case)).unwrap();
        let done = db.get(&f.id).unwrap().unwrap();
        assert!(done.processed());
        assert_eq!(done.matched_case, Some(case));
    }

    #[test]
    fn test_complete_happens_once() {
        let db = Database::open_in_memory().unwrap();
        let f = frame("f1");
        db.insert(&f).unwrap();
        db.complete(&f.id, Some(&CaseId::from("c1"))).unwrap();
        db.complete(&f.id, None).unwrap();
        assert_eq!(db.get(&f.id).unwrap().unwrap().matched_case, Some(CaseId::from("c1")));
        assert!(db.mark_processing(&f.id).is_err());
    }

    #[test]
    fn test_unfinished_frames() {
        let db = Database::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            db.insert(&frame(id)).unwrap();
        }
        db.mark_processing(&FrameId("b".into())).unwrap();
        db.complete(&FrameId("c".into()), None).unwrap();

        let mut pending: Vec<String> = db.unfinished().unwrap().into_iter().map(|f| f.0).collect();
        pending.sort();
        assert_eq!(pending, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_frame_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get(&FrameId("nope".into())).unwrap().is_none());
    }

    #[test]
    fn test_case_lifecycle_rows() {
        let db = Database::open_in_memory().unwrap();
        let id = CaseId::from("c1");
        db.upsert_active_case(&id, &UserId("alice".into())).unwrap();
        assert_eq!(db.active_case_ids().unwrap(), vec![id.clone()]);

        assert!(db.close_case(&id).unwrap());
        assert!(!db.close_case(&id).unwrap(), "second close is not a transition");
        assert!(db.active_case_ids().unwrap().is_empty());
        assert!(!db.case(&id).unwrap().unwrap().active);
    }

    #[test]
    fn test_notifications_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId("alice".into());
        let n = Notification {
            user: user.clone(),
            case_id: CaseId::from("c1"),
            image_path: "frames/f1.png".into(),
            detected_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").unwrap().with_timezone(&Utc),
            similarity: 0.75,
        };
        db.emit(&n).unwrap();
        assert_eq!(db.notifications_for(&user).unwrap(), vec![n]);
    }
}
