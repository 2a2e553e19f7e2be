//! SQLite event store implementation.

use crate::{Event, EventKind, Result, SessionId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;

/// SQLite-backed event store.
pub struct EventStore {
    conn: Connection,
}

/// Summary of one stored session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: usize,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    // `seq` gives a total order; timestamps can tie within one turn.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session
                ON events(session_id, seq);
            "#,
        )?;
        Ok(())
    }

    /// Append an event to the store.
    pub fn append(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, session_id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.session_id.to_string(),
                event.timestamp.to_rfc3339(),
                event.kind.name(),
                serde_json::to_string(&event.kind)?,
            ],
        )?;
        Ok(())
    }

    /// Whether any event exists for the session.
    pub fn has_session(&self, session_id: SessionId) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE session_id = ?1",
            [session_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Load all events for a session, in insertion order.
    pub fn load_session(&self, session_id: SessionId) -> Result<Vec<Event>> {
        self.load_events(session_id, None)
    }

    /// Load events for a session, optionally filtered by kind name.
    ///
    /// Rows that no longer decode are skipped.
    pub fn load_events(&self, session_id: SessionId, kind: Option<&str>) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, timestamp, data FROM events
             WHERE session_id = ?1 AND (?2 IS NULL OR kind = ?2) ORDER BY seq",
        )?;

        let rows = stmt.query_map(params![session_id.to_string(), kind], |row| {
            let id: String = row.get(0)?;
            let session_id: String = row.get(1)?;
            let timestamp: String = row.get(2)?;
            let data: String = row.get(3)?;
            Ok((id, session_id, timestamp, data))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, session_id, timestamp, data) = row?;
            if let Some(event) = decode_event(&id, &session_id, &timestamp, &data) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Load the serialized messages of a session, in insertion order.
    pub fn load_messages(&self, session_id: SessionId) -> Result<Vec<serde_json::Value>> {
        let messages = self
            .load_events(session_id, Some("message"))?
            .into_iter()
            .filter_map(|event| match event.kind {
                EventKind::Message { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        Ok(messages)
    }

    /// List sessions, most recently started first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id,
                    MIN(timestamp),
                    MAX(CASE WHEN kind = 'session_end' THEN timestamp END),
                    SUM(CASE WHEN kind = 'message' THEN 1 ELSE 0 END)
             FROM events
             GROUP BY session_id
             ORDER BY MIN(seq) DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let started: String = row.get(1)?;
            let ended: Option<String> = row.get(2)?;
            let count: i64 = row.get(3)?;
            Ok((id, started, ended, count))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, started, ended, count) = row?;
            let Ok(id) = id.parse::<SessionId>() else {
                continue;
            };
            let Ok(started_at) = started.parse::<DateTime<Utc>>() else {
                continue;
            };
            sessions.push(SessionSummary {
                id,
                started_at,
                ended_at: ended.and_then(|e| e.parse().ok()),
                message_count: usize::try_from(count).unwrap_or(0),
            });
        }
        Ok(sessions)
    }

    /// Sessions whose id starts with `prefix`.
    pub fn find_session(&self, prefix: &str) -> Result<Vec<SessionId>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .map(|s| s.id)
            .filter(|id| id.to_string().starts_with(prefix))
            .collect())
    }
}

fn decode_event(id: &str, session_id: &str, timestamp: &str, data: &str) -> Option<Event> {
    Some(Event {
        id: id.parse().ok()?,
        session_id: session_id.parse().ok()?,
        timestamp: timestamp.parse().ok()?,
        kind: serde_json::from_str(data).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use serde_json::json;

    #[test]
    fn append_and_load_preserves_order() {
        let store = EventStore::in_memory().unwrap();
        let id = SessionId::new();
        store.append(&Event::new(id, EventKind::SessionStart)).unwrap();
        for i in 0..5 {
            store
                .append(&Event::message(id, Role::User, json!({ "n": i })))
                .unwrap();
        }

        let messages = store.load_messages(id).unwrap();
        let ns: Vec<i64> = messages.iter().map(|m| m["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.load_session(id).unwrap().len(), 6);
    }

    #[test]
    fn kind_filter() {
        let store = EventStore::in_memory().unwrap();
        let id = SessionId::new();
        store.append(&Event::new(id, EventKind::SessionStart)).unwrap();
        store
            .append(&Event::message(id, Role::Assistant, json!({})))
            .unwrap();
        store.append(&Event::new(id, EventKind::SessionEnd)).unwrap();

        let ends = store.load_events(id, Some("session_end")).unwrap();
        assert_eq!(ends.len(), 1);
        assert!(matches!(ends[0].kind, EventKind::SessionEnd));
    }

    #[test]
    fn list_sessions_summarizes() {
        let store = EventStore::in_memory().unwrap();
        let first = SessionId::new();
        let second = SessionId::new();

        store.append(&Event::new(first, EventKind::SessionStart)).unwrap();
        store
            .append(&Event::message(first, Role::User, json!({})))
            .unwrap();
        store.append(&Event::new(first, EventKind::SessionEnd)).unwrap();
        store.append(&Event::new(second, EventKind::SessionStart)).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, second);
        assert!(sessions[0].ended_at.is_none());
        assert_eq!(sessions[1].message_count, 1);
        assert!(sessions[1].ended_at.is_some());
    }

    #[test]
    fn find_session_by_prefix() {
        let store = EventStore::in_memory().unwrap();
        let id = SessionId::new();
        store.append(&Event::new(id, EventKind::SessionStart)).unwrap();

        let prefix = &id.to_string()[..8];
        assert_eq!(store.find_session(prefix).unwrap(), vec![id]);
        assert!(store.has_session(id).unwrap());
        assert!(!store.has_session(SessionId::new()).unwrap());
    }

    #[test]
    fn reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let id = SessionId::new();
        {
            let store = EventStore::open(&path).unwrap();
            store
                .append(&Event::message(id, Role::User, json!({"content": "hi"})))
                .unwrap();
        }
        let store = EventStore::open(&path).unwrap();
        assert_eq!(store.load_messages(id).unwrap()[0]["content"], "hi");
    }
}
