//! Durable delayed-task queue backing the reply scheduler.
//!
//! Delivery is at-least-once: rows are claimed by flipping them to `running`
//! and deleted only after the task finishes. Rows left `running` by a crashed
//! process are released at startup.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::Database;
use crate::models::{TaskKind, TaskRow, get_dt, get_opt_uuid, get_uuid};

/// Insert a task row on the caller's connection, so a send and the work it
/// schedules commit together.
pub fn enqueue(
    conn: &Connection,
    kind: TaskKind,
    conversation_id: Uuid,
    message_id: Option<Uuid>,
    run_at: DateTime<Utc>,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO scheduled_tasks (id, kind, conversation_id, message_id, run_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            kind.as_str(),
            conversation_id.to_string(),
            message_id.map(|m| m.to_string()),
            run_at.timestamp_millis(),
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(id)
}

impl Database {
    pub fn enqueue_task(
        &self,
        kind: TaskKind,
        conversation_id: Uuid,
        message_id: Option<Uuid>,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.with_conn(|conn| enqueue(conn, kind, conversation_id, message_id, run_at))
    }

    /// Claim up to `limit` due tasks, oldest first.
    pub fn claim_due_tasks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<TaskRow>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE scheduled_tasks SET status = 'running', attempts = attempts + 1
                 WHERE id IN (
                     SELECT id FROM scheduled_tasks
                     WHERE status = 'pending' AND run_at <= ?1
                     ORDER BY run_at
                     LIMIT ?2
                 )
                 RETURNING id, kind, conversation_id, message_id, run_at, attempts",
            )?;
            let rows = stmt
                .query_map(params![now.timestamp_millis(), limit], |row| {
                    let kind: String = row.get(1)?;
                    Ok((kind, TaskRow {
                        id: get_uuid(row, 0)?,
                        kind: TaskKind::Reply,
                        conversation_id: get_uuid(row, 2)?,
                        message_id: get_opt_uuid(row, 3)?,
                        run_at: get_dt(row, 4)?,
                        attempts: row.get(5)?,
                    }))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut tasks = Vec::with_capacity(rows.len());
            for (kind, mut task) in rows {
                match TaskKind::parse(&kind) {
                    Some(k) => {
                        task.kind = k;
                        tasks.push(task);
                    }
                    None => {
                        tx.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [task.id.to_string()])?;
                    }
                }
            }
            tasks.sort_by_key(|t| t.run_at);
            Ok::<_, anyhow::Error>(tasks)
        })
    }

    pub fn complete_task(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
    }

    /// Put a claimed task back in the queue to run again at `run_at`.
    pub fn retry_task(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = 'pending', run_at = ?2 WHERE id = ?1",
                params![id.to_string(), run_at.timestamp_millis()],
            )?;
            Ok(())
        })
    }

    /// Return tasks orphaned in `running` to the queue. Call once at startup.
    pub fn release_running_tasks(&self) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE scheduled_tasks SET status = 'pending' WHERE status = 'running'",
                [],
            )?)
        })
    }

    /// Pending and running tasks for one message.
    pub fn tasks_for_message(&self, message_id: Uuid) -> Result<Vec<TaskRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, conversation_id, message_id, run_at, attempts
                 FROM scheduled_tasks WHERE message_id = ?1 ORDER BY run_at",
            )?;
            let rows = stmt
                .query_map([message_id.to_string()], |row| {
                    let kind: String = row.get(1)?;
                    Ok(TaskRow {
                        id: get_uuid(row, 0)?,
                        kind: TaskKind::parse(&kind).unwrap_or(TaskKind::Reply),
                        conversation_id: get_uuid(row, 2)?,
                        message_id: get_opt_uuid(row, 3)?,
                        run_at: get_dt(row, 4)?,
                        attempts: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_due_tasks_are_claimed_and_claims_are_exclusive() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let conv = Uuid::new_v4();
        let msg = Uuid::new_v4();

        db.enqueue_task(TaskKind::Reply, conv, Some(msg), now - chrono::Duration::seconds(1)).unwrap();
        db.enqueue_task(TaskKind::Moderate, conv, Some(msg), now + chrono::Duration::seconds(30)).unwrap();

        let claimed = db.claim_due_tasks(now, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].kind, TaskKind::Reply);
        assert_eq!(claimed[0].attempts, 1);

        assert!(db.claim_due_tasks(now, 10).unwrap().is_empty());

        db.complete_task(claimed[0].id).unwrap();
        assert_eq!(db.tasks_for_message(msg).unwrap().len(), 1);
    }

    #[test]
    fn orphaned_claims_are_released() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.enqueue_task(TaskKind::Transcribe, Uuid::new_v4(), None, now).unwrap();
        assert_eq!(db.claim_due_tasks(now, 10).unwrap().len(), 1);

        assert_eq!(db.release_running_tasks().unwrap(), 1);
        let again = db.claim_due_tasks(now, 10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }

    #[test]
    fn retried_task_waits_for_its_new_run_at() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let msg = Uuid::new_v4();
        db.enqueue_task(TaskKind::Moderate, Uuid::new_v4(), Some(msg), now).unwrap();
        let claimed = db.claim_due_tasks(now, 10).unwrap();

        let later = now + chrono::Duration::seconds(5);
        db.retry_task(claimed[0].id, later).unwrap();
        assert!(db.claim_due_tasks(now, 10).unwrap().is_empty());

        let again = db.claim_due_tasks(later, 10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
    }
}
