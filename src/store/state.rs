// =============================================================================
// Scheduler-State Repository — single-row persistence for crash recovery
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{parse_ts, StoreError, StoreResult};
use crate::types::SchedulerState;

#[derive(Clone)]
pub struct SchedulerStateRepo {
    conn: Arc<Mutex<Connection>>,
}

impl SchedulerStateRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Single-row upsert of the current scheduler state.
    pub fn save(&self, state: &SchedulerState) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scheduler_state (id, state_json, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET state_json = ?1, updated_at = ?2",
            params![serde_json::to_string(state)?, state.updated_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load the persisted state together with its write timestamp.
    pub fn load(&self) -> StoreResult<Option<(SchedulerState, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT state_json, updated_at FROM scheduler_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(json, updated_at)| {
            let state: SchedulerState =
                serde_json::from_str(&json).map_err(StoreError::from)?;
            Ok((state, parse_ts(&updated_at)?))
        })
        .transpose()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::SchedulerPhase;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 20, 15, 0).unwrap()
    }

    #[test]
    fn load_before_save_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.scheduler_state().load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_reconstructs_the_same_state() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.scheduler_state();

        let mut state = SchedulerState::fresh(now());
        state.current_state = SchedulerPhase::Waiting;
        state.api_calls_today = 42;
        state.api_calls_this_hour = 7;
        state.consecutive_failures = 2;
        state.backoff_until = Some(now() + chrono::Duration::seconds(120));
        state.next_collection_at = Some(now() + chrono::Duration::hours(20));
        repo.save(&state).unwrap();

        let (loaded, updated_at) = repo.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(updated_at, now());
    }

    #[test]
    fn save_is_a_single_row_upsert() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.scheduler_state();
        repo.save(&SchedulerState::fresh(now())).unwrap();
        let mut second = SchedulerState::fresh(now() + chrono::Duration::minutes(1));
        second.api_calls_today = 9;
        repo.save(&second).unwrap();

        let (loaded, _) = repo.load().unwrap().unwrap();
        assert_eq!(loaded.api_calls_today, 9);
    }
}
