//! SQLite storage engine.
//!
//! Single connection behind a mutex, with every call dispatched through
//! `spawn_blocking` so the async runtime never blocks on the database.
//! All state transitions are conditional updates checked by affected-row
//! count; `jobs_assign_one` is the portable optimistic loop (read
//! candidates, attempt a conditional pending→assigned update, skip on zero
//! rows).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use ulid::Ulid;

use crate::config::TableNames;
use crate::model::{
    DownlinkAudience, DownlinkKind, DownlinkMessage, FailureKind, Identity, Job, JobMode,
    JobState, LogChunk, LogStream, Role, Worker, WorkerStatus,
};
use crate::repo::{
    pick_candidate, Assignment, JobFilter, NewLogLine, RepoError, RepoResult, TransitionUpdate,
    WorkerCandidate, WorkerRegistration,
};

const JOB_COLUMNS: &str = "job_id, submitter_id, assignee_id, state, binary, argv, \
     required_variables, mode, transport_choice, heartbeat_interval_s, created_at_ms, \
     state_entered_at_ms, assigned_at_ms, started_at_ms, ended_at_ms, last_heartbeat_at_ms, \
     client_last_seen_at_ms, exit_code, failure_kind, ever_eligible";

const ACTIVE_STATES_SQL: &str = "('assigned', 'running', 'canceling')";
const TERMINAL_STATES_SQL: &str = "('completed', 'failed', 'canceled')";

#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
    tables: Arc<TableNames>,
}

impl SqliteRepository {
    pub fn open(path: &Path, tables: TableNames) -> RepoResult<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::from_connection(conn, tables)
    }

    /// Private throwaway database, used by tests.
    pub fn open_in_memory(tables: TableNames) -> RepoResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn, tables)
    }

    fn from_connection(conn: Connection, tables: TableNames) -> RepoResult<Self> {
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: Arc::new(tables),
        };
        repo.migrate()?;
        Ok(repo)
    }

    /// Forward-only migrations keyed by a monotonic integer stored in
    /// `PRAGMA user_version`.
    fn migrate(&self) -> RepoResult<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(storage_err)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(storage_err)?;

        if version < 1 {
            let t = &self.tables;
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {identities} (
                  client_id TEXT PRIMARY KEY,
                  role TEXT NOT NULL,
                  hmac_key TEXT NOT NULL,
                  key_id TEXT,
                  allowed_cidrs TEXT NOT NULL,
                  created_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS {workers} (
                  worker_id TEXT PRIMARY KEY,
                  status TEXT NOT NULL,
                  registered_at_ms INTEGER NOT NULL,
                  last_seen_at_ms INTEGER NOT NULL,
                  registration_interval_s INTEGER NOT NULL,
                  version TEXT NOT NULL,
                  binaries TEXT NOT NULL,
                  variables TEXT NOT NULL,
                  transport_choice TEXT
                );

                CREATE TABLE IF NOT EXISTS {jobs} (
                  job_id TEXT PRIMARY KEY,
                  submitter_id TEXT NOT NULL,
                  assignee_id TEXT,
                  state TEXT NOT NULL,
                  binary TEXT NOT NULL,
                  argv TEXT NOT NULL,
                  required_variables TEXT NOT NULL,
                  mode TEXT NOT NULL,
                  transport_choice TEXT,
                  heartbeat_interval_s INTEGER NOT NULL,
                  created_at_ms INTEGER NOT NULL,
                  state_entered_at_ms INTEGER NOT NULL,
                  assigned_at_ms INTEGER,
                  started_at_ms INTEGER,
                  ended_at_ms INTEGER,
                  last_heartbeat_at_ms INTEGER,
                  client_last_seen_at_ms INTEGER,
                  exit_code INTEGER,
                  failure_kind TEXT,
                  ever_eligible INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_{jobs}_state ON {jobs}(state, job_id);
                CREATE INDEX IF NOT EXISTS idx_{jobs}_assignee ON {jobs}(assignee_id, state);
                CREATE INDEX IF NOT EXISTS idx_{jobs}_submitter ON {jobs}(submitter_id, job_id);

                CREATE TABLE IF NOT EXISTS {job_logs} (
                  job_id TEXT NOT NULL,
                  seq INTEGER NOT NULL,
                  stream TEXT NOT NULL,
                  text TEXT NOT NULL,
                  emitted_at_ms INTEGER NOT NULL,
                  PRIMARY KEY (job_id, seq)
                );

                CREATE TABLE IF NOT EXISTS {downlink} (
                  message_id TEXT PRIMARY KEY,
                  recipient_id TEXT NOT NULL,
                  kind TEXT NOT NULL,
                  job_id TEXT,
                  payload TEXT NOT NULL,
                  created_at_ms INTEGER NOT NULL,
                  delivered_at_ms INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_{downlink}_recipient
                  ON {downlink}(recipient_id, message_id);

                PRAGMA user_version = 1;
                "#,
                identities = t.identities,
                workers = t.workers,
                jobs = t.jobs,
                job_logs = t.job_logs,
                downlink = t.downlink_messages,
            ))
            .map_err(storage_err)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }

    /// Run a blocking closure against the connection off the async runtime.
    async fn call<T, F>(&self, f: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &TableNames) -> RepoResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let tables = self.tables.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().expect("sqlite connection mutex poisoned");
            f(&mut guard, &tables)
        })
        .await
        .map_err(|e| RepoError::Storage(format!("sqlite task join: {e}")))?
    }

    // --- identities ---------------------------------------------------

    pub async fn identity_put(&self, identity: Identity) -> RepoResult<()> {
        self.call(move |conn, t| {
            let cidrs = to_json(&identity.allowed_cidrs)?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (client_id, role, hmac_key, key_id, allowed_cidrs, created_at_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(client_id) DO UPDATE SET \
                       role = excluded.role, hmac_key = excluded.hmac_key, \
                       key_id = excluded.key_id, allowed_cidrs = excluded.allowed_cidrs",
                    t.identities
                ),
                params![
                    identity.client_id,
                    identity.role.as_str(),
                    identity.hmac_key_stored,
                    identity.key_id,
                    cidrs,
                    ms(identity.created_at),
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn identity_get(&self, client_id: &str) -> RepoResult<Option<Identity>> {
        let client_id = client_id.to_string();
        self.call(move |conn, t| {
            conn.query_row(
                &format!(
                    "SELECT client_id, role, hmac_key, key_id, allowed_cidrs, created_at_ms \
                     FROM {} WHERE client_id = ?1",
                    t.identities
                ),
                params![client_id],
                row_to_identity,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
    }

    pub async fn identity_delete(&self, client_id: &str) -> RepoResult<bool> {
        let client_id = client_id.to_string();
        self.call(move |conn, t| {
            let n = conn
                .execute(
                    &format!("DELETE FROM {} WHERE client_id = ?1", t.identities),
                    params![client_id],
                )
                .map_err(storage_err)?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn identity_list(&self) -> RepoResult<Vec<Identity>> {
        self.call(move |conn, t| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT client_id, role, hmac_key, key_id, allowed_cidrs, created_at_ms \
                     FROM {} ORDER BY client_id",
                    t.identities
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], row_to_identity)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    pub async fn identities_not_using_key(
        &self,
        key_id: Option<&str>,
        limit: usize,
    ) -> RepoResult<Vec<String>> {
        let key_id = key_id.map(str::to_string);
        self.call(move |conn, t| {
            let (clause, params_vec): (&str, Vec<SqlValue>) = match &key_id {
                None => (
                    "key_id IS NOT NULL AND key_id != ''",
                    vec![SqlValue::Integer(limit as i64)],
                ),
                Some(target) => (
                    "key_id IS NULL OR key_id != ?1",
                    vec![
                        SqlValue::Text(target.clone()),
                        SqlValue::Integer(limit as i64),
                    ],
                ),
            };
            let limit_idx = params_vec.len();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT client_id FROM {} WHERE {clause} ORDER BY client_id LIMIT ?{limit_idx}",
                    t.identities
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params_from_iter(params_vec), |row| row.get::<_, String>(0))
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    // --- workers ------------------------------------------------------

    pub async fn worker_register(
        &self,
        reg: WorkerRegistration,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        self.call(move |conn, t| {
            let binaries = to_json(&reg.advertised_binaries)?;
            let variables = to_json(&reg.advertised_variables)?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (worker_id, status, registered_at_ms, last_seen_at_ms, \
                       registration_interval_s, version, binaries, variables, transport_choice) \
                     VALUES (?1, 'online', ?2, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(worker_id) DO UPDATE SET \
                       status = 'online', last_seen_at_ms = excluded.last_seen_at_ms, \
                       registration_interval_s = excluded.registration_interval_s, \
                       version = excluded.version, binaries = excluded.binaries, \
                       variables = excluded.variables, \
                       transport_choice = excluded.transport_choice",
                    t.workers
                ),
                params![
                    reg.worker_id,
                    ms(now),
                    reg.registration_interval_s,
                    reg.version,
                    binaries,
                    variables,
                    reg.transport_choice,
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn worker_get(&self, worker_id: &str) -> RepoResult<Option<Worker>> {
        let worker_id = worker_id.to_string();
        self.call(move |conn, t| {
            conn.query_row(
                &format!(
                    "SELECT worker_id, status, registered_at_ms, last_seen_at_ms, \
                       registration_interval_s, version, binaries, variables, transport_choice \
                     FROM {} WHERE worker_id = ?1",
                    t.workers
                ),
                params![worker_id],
                row_to_worker,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
    }

    pub async fn worker_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> RepoResult<()> {
        let worker_id = worker_id.to_string();
        self.call(move |conn, t| {
            let n = conn
                .execute(
                    &format!(
                        "UPDATE {} SET last_seen_at_ms = MAX(last_seen_at_ms, ?1) \
                         WHERE worker_id = ?2",
                        t.workers
                    ),
                    params![ms(now), worker_id],
                )
                .map_err(storage_err)?;
            if n == 0 {
                return Err(RepoError::UnknownWorker(worker_id));
            }
            Ok(())
        })
        .await
    }

    pub async fn worker_mark_offline(&self, worker_id: &str) -> RepoResult<()> {
        let worker_id = worker_id.to_string();
        self.call(move |conn, t| {
            conn.execute(
                &format!("UPDATE {} SET status = 'offline' WHERE worker_id = ?1", t.workers),
                params![worker_id],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn workers_by_status(&self, status: WorkerStatus) -> RepoResult<Vec<Worker>> {
        self.call(move |conn, t| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT worker_id, status, registered_at_ms, last_seen_at_ms, \
                       registration_interval_s, version, binaries, variables, transport_choice \
                     FROM {} WHERE status = ?1 ORDER BY worker_id",
                    t.workers
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![status.as_str()], row_to_worker)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    pub async fn workers_stale(&self, now: DateTime<Utc>, factor: f64) -> RepoResult<Vec<Worker>> {
        self.call(move |conn, t| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT worker_id, status, registered_at_ms, last_seen_at_ms, \
                       registration_interval_s, version, binaries, variables, transport_choice \
                     FROM {} WHERE status = 'online' \
                       AND last_seen_at_ms + CAST(registration_interval_s * ?1 AS INTEGER) < ?2",
                    t.workers
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![factor * 1000.0, ms(now)], row_to_worker)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    pub async fn worker_load(&self) -> RepoResult<HashMap<String, usize>> {
        self.call(move |conn, t| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT assignee_id, COUNT(*) FROM {} \
                     WHERE state IN {ACTIVE_STATES_SQL} AND assignee_id IS NOT NULL \
                     GROUP BY assignee_id",
                    t.jobs
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
                })
                .map_err(storage_err)?
                .collect::<Result<HashMap<_, _>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    // --- jobs ---------------------------------------------------------

    pub async fn jobs_submit(&self, job: Job) -> RepoResult<()> {
        self.call(move |conn, t| {
            let argv = to_json(&job.argv)?;
            let required = to_json(&job.required_variables)?;
            conn.execute(
                &format!(
                    "INSERT INTO {} ({JOB_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                             ?16, ?17, ?18, ?19, ?20)",
                    t.jobs
                ),
                params![
                    job.job_id.to_string(),
                    job.submitter_id,
                    job.assignee_id,
                    job.state.as_str(),
                    job.binary,
                    argv,
                    required,
                    job.mode.as_str(),
                    job.transport_choice,
                    job.heartbeat_interval_s,
                    ms(job.created_at),
                    ms(job.state_entered_at),
                    job.assigned_at.map(ms),
                    job.started_at.map(ms),
                    job.ended_at.map(ms),
                    job.last_heartbeat_at.map(ms),
                    job.client_last_seen_at.map(ms),
                    job.exit_code,
                    job.failure_kind.map(|k| k.as_str()),
                    job.ever_eligible as i64,
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn job_get(&self, job_id: Ulid) -> RepoResult<Option<Job>> {
        self.call(move |conn, t| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM {} WHERE job_id = ?1", t.jobs),
                params![job_id.to_string()],
                row_to_job,
            )
            .optional()
            .map_err(storage_err)
        })
        .await
    }

    pub async fn jobs_assign_one(
        &self,
        candidates: &[WorkerCandidate],
        soft_limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<Assignment>> {
        let candidates = candidates.to_vec();
        self.call(move |conn, t| {
            // Optimistic loop: read the pending queue, then race a
            // conditional update per job. Losing a race just moves on to the
            // next job.
            let pending: Vec<(String, String, BTreeSet<String>, bool)> = {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT job_id, binary, required_variables, ever_eligible FROM {} \
                         WHERE state = 'pending' ORDER BY job_id ASC",
                        t.jobs
                    ))
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)? != 0,
                        ))
                    })
                    .map_err(storage_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(storage_err)?;
                rows.into_iter()
                    .map(|(id, binary, required, ever)| {
                        Ok((id, binary, from_json(&required)?, ever))
                    })
                    .collect::<RepoResult<Vec<_>>>()?
            };

            for (job_id, binary, required, ever_eligible) in pending {
                let (any_capable, chosen) =
                    pick_candidate(&candidates, &binary, &required, soft_limit);

                if any_capable && !ever_eligible {
                    conn.execute(
                        &format!(
                            "UPDATE {} SET ever_eligible = 1 \
                             WHERE job_id = ?1 AND state = 'pending'",
                            t.jobs
                        ),
                        params![job_id],
                    )
                    .map_err(storage_err)?;
                }

                if let Some(candidate) = chosen {
                    let n = conn
                        .execute(
                            &format!(
                                "UPDATE {} SET state = 'assigned', assignee_id = ?1, \
                                   assigned_at_ms = ?2, state_entered_at_ms = ?2 \
                                 WHERE job_id = ?3 AND state = 'pending'",
                                t.jobs
                            ),
                            params![candidate.worker_id, ms(now), job_id],
                        )
                        .map_err(storage_err)?;
                    if n == 1 {
                        let job_id = Ulid::from_string(&job_id)
                            .map_err(|e| RepoError::Serialization(e.to_string()))?;
                        return Ok(Some(Assignment {
                            job_id,
                            worker_id: candidate.worker_id.clone(),
                        }));
                    }
                    // Raced: another caller moved the job. Fall through.
                }
            }
            Ok(None)
        })
        .await
    }

    pub async fn job_transition(
        &self,
        job_id: Ulid,
        from: &[JobState],
        to: JobState,
        update: TransitionUpdate,
        now: DateTime<Utc>,
    ) -> RepoResult<Job> {
        let from = from.to_vec();
        self.call(move |conn, t| {
            let mut sets = vec![
                "state = ?".to_string(),
                "state_entered_at_ms = ?".to_string(),
            ];
            let mut values: Vec<SqlValue> = vec![
                SqlValue::Text(to.as_str().to_string()),
                SqlValue::Integer(ms(now)),
            ];

            match to {
                JobState::Assigned => {
                    sets.push("assigned_at_ms = ?".to_string());
                    values.push(SqlValue::Integer(ms(now)));
                }
                JobState::Running => {
                    sets.push("started_at_ms = ?".to_string());
                    values.push(SqlValue::Integer(ms(now)));
                    sets.push("last_heartbeat_at_ms = ?".to_string());
                    values.push(SqlValue::Integer(ms(now)));
                }
                JobState::Completed | JobState::Failed | JobState::Canceled => {
                    sets.push("ended_at_ms = ?".to_string());
                    values.push(SqlValue::Integer(ms(now)));
                }
                JobState::Pending | JobState::Canceling => {}
            }
            if let Some(assignee) = &update.assignee {
                sets.push("assignee_id = ?".to_string());
                values.push(match assignee {
                    Some(id) => SqlValue::Text(id.clone()),
                    None => SqlValue::Null,
                });
            }
            if let Some(exit_code) = update.exit_code {
                sets.push("exit_code = ?".to_string());
                values.push(SqlValue::Integer(i64::from(exit_code)));
            }
            if let Some(kind) = update.failure_kind {
                sets.push("failure_kind = ?".to_string());
                values.push(SqlValue::Text(kind.as_str().to_string()));
            }

            let from_list = sql_state_list(&from);
            // Positional placeholders: rewrite ? into ?N in order.
            let set_clause = number_placeholders(&sets.join(", "), 1);
            let where_start = values.len() + 1;
            values.push(SqlValue::Text(job_id.to_string()));
            let sql = format!(
                "UPDATE {} SET {set_clause} WHERE job_id = ?{where_start} AND state IN {from_list}",
                t.jobs
            );

            let n = conn
                .execute(&sql, params_from_iter(values))
                .map_err(storage_err)?;
            if n == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        &format!("SELECT 1 FROM {} WHERE job_id = ?1", t.jobs),
                        params![job_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(storage_err)?;
                return Err(match exists {
                    Some(_) => RepoError::Conflict(job_id),
                    None => RepoError::NotFound(format!("job {job_id}")),
                });
            }

            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM {} WHERE job_id = ?1", t.jobs),
                params![job_id.to_string()],
                row_to_job,
            )
            .map_err(storage_err)
        })
        .await
    }

    pub async fn job_heartbeat(&self, job_id: Ulid, now: DateTime<Utc>) -> RepoResult<()> {
        self.call(move |conn, t| {
            let n = conn
                .execute(
                    &format!(
                        "UPDATE {} SET last_heartbeat_at_ms = MAX(COALESCE(last_heartbeat_at_ms, 0), ?1) \
                         WHERE job_id = ?2 AND state IN {ACTIVE_STATES_SQL}",
                        t.jobs
                    ),
                    params![ms(now), job_id.to_string()],
                )
                .map_err(storage_err)?;
            if n == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        &format!("SELECT 1 FROM {} WHERE job_id = ?1", t.jobs),
                        params![job_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(storage_err)?;
                return Err(match exists {
                    Some(_) => RepoError::Conflict(job_id),
                    None => RepoError::NotFound(format!("job {job_id}")),
                });
            }
            Ok(())
        })
        .await
    }

    pub async fn job_client_heartbeat(&self, job_id: Ulid, now: DateTime<Utc>) -> RepoResult<()> {
        self.call(move |conn, t| {
            let n = conn
                .execute(
                    &format!(
                        "UPDATE {} SET client_last_seen_at_ms = \
                           MAX(COALESCE(client_last_seen_at_ms, 0), ?1) WHERE job_id = ?2",
                        t.jobs
                    ),
                    params![ms(now), job_id.to_string()],
                )
                .map_err(storage_err)?;
            if n == 0 {
                return Err(RepoError::NotFound(format!("job {job_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn job_append_log(
        &self,
        job_id: Ulid,
        lines: Vec<NewLogLine>,
    ) -> RepoResult<(u64, u64)> {
        if lines.is_empty() {
            return Err(RepoError::Serialization("empty log batch".to_string()));
        }
        self.call(move |conn, t| {
            let tx = conn.transaction().map_err(storage_err)?;

            let exists: Option<i64> = tx
                .query_row(
                    &format!("SELECT 1 FROM {} WHERE job_id = ?1", t.jobs),
                    params![job_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_err)?;
            if exists.is_none() {
                return Err(RepoError::NotFound(format!("job {job_id}")));
            }

            let (first, last_emitted): (i64, Option<i64>) = tx
                .query_row(
                    &format!(
                        "SELECT COALESCE(MAX(seq) + 1, 0), MAX(emitted_at_ms) \
                         FROM {} WHERE job_id = ?1",
                        t.job_logs
                    ),
                    params![job_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(storage_err)?;

            // emitted_at is kept nondecreasing across the whole job so
            // readers can rely on (seq, emitted_at) agreeing on order.
            let mut floor = last_emitted.unwrap_or(i64::MIN);
            let mut seq = first;
            for line in &lines {
                let emitted_at_ms = ms(line.emitted_at).max(floor);
                floor = emitted_at_ms;
                tx.execute(
                    &format!(
                        "INSERT INTO {} (job_id, seq, stream, text, emitted_at_ms) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        t.job_logs
                    ),
                    params![
                        job_id.to_string(),
                        seq,
                        line.stream.as_str(),
                        line.text,
                        emitted_at_ms,
                    ],
                )
                .map_err(storage_err)?;
                seq += 1;
            }
            tx.commit().map_err(storage_err)?;
            Ok((first as u64, (seq - 1) as u64))
        })
        .await
    }

    pub async fn job_logs(
        &self,
        job_id: Ulid,
        since_seq: Option<u64>,
        limit: Option<usize>,
    ) -> RepoResult<Vec<LogChunk>> {
        self.call(move |conn, t| {
            let after = since_seq.map(|s| s as i64).unwrap_or(-1);
            let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT job_id, seq, stream, text, emitted_at_ms FROM {} \
                     WHERE job_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
                    t.job_logs
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![job_id.to_string(), after, limit], row_to_log_chunk)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    pub async fn jobs_query(&self, filter: &JobFilter) -> RepoResult<Vec<Job>> {
        let filter = filter.clone();
        self.call(move |conn, t| {
            let mut clauses: Vec<String> = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();

            if let Some(submitter) = &filter.submitter {
                values.push(SqlValue::Text(submitter.clone()));
                clauses.push(format!("submitter_id = ?{}", values.len()));
            }
            if let Some(assignee) = &filter.assignee {
                values.push(SqlValue::Text(assignee.clone()));
                clauses.push(format!("assignee_id = ?{}", values.len()));
            }
            if let Some(states) = &filter.states {
                clauses.push(format!("state IN {}", sql_state_list(states)));
            }
            if let Some(before) = filter.before_id {
                values.push(SqlValue::Text(before.to_string()));
                clauses.push(format!("job_id < ?{}", values.len()));
            }
            if let Some(cutoff) = filter.ended_after {
                values.push(SqlValue::Integer(ms(cutoff)));
                clauses.push(format!(
                    "(state NOT IN {TERMINAL_STATES_SQL} \
                     OR (ended_at_ms IS NOT NULL AND ended_at_ms > ?{}))",
                    values.len()
                ));
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            values.push(SqlValue::Integer(
                filter.limit.map(|l| l as i64).unwrap_or(i64::MAX),
            ));
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM {} {where_clause} ORDER BY job_id DESC LIMIT ?{}",
                t.jobs,
                values.len()
            );

            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(params_from_iter(values), row_to_job)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    pub async fn jobs_for_worker_in(
        &self,
        worker_id: &str,
        states: &[JobState],
    ) -> RepoResult<Vec<Job>> {
        let worker_id = worker_id.to_string();
        let states = states.to_vec();
        self.call(move |conn, t| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM {} \
                     WHERE assignee_id = ?1 AND state IN {} ORDER BY job_id ASC",
                    t.jobs,
                    sql_state_list(&states)
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![worker_id], row_to_job)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    // --- janitor scans ------------------------------------------------

    pub async fn jobs_stale_assigned(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        self.scan_jobs(
            "state = 'assigned' AND assigned_at_ms IS NOT NULL AND assigned_at_ms + ?1 < ?2",
            vec![
                SqlValue::Integer((timeout_s * 1000) as i64),
                SqlValue::Integer(ms(now)),
            ],
        )
        .await
    }

    pub async fn jobs_stale_heartbeat(
        &self,
        now: DateTime<Utc>,
        factor: f64,
    ) -> RepoResult<Vec<Job>> {
        self.scan_jobs(
            "state IN ('running', 'canceling') AND last_heartbeat_at_ms IS NOT NULL \
             AND last_heartbeat_at_ms + CAST(heartbeat_interval_s * ?1 AS INTEGER) < ?2",
            vec![SqlValue::Real(factor * 1000.0), SqlValue::Integer(ms(now))],
        )
        .await
    }

    pub async fn jobs_stale_pending(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        self.scan_jobs(
            "state = 'pending' AND ever_eligible = 0 AND created_at_ms + ?1 < ?2",
            vec![
                SqlValue::Integer((timeout_s * 1000) as i64),
                SqlValue::Integer(ms(now)),
            ],
        )
        .await
    }

    pub async fn jobs_stale_canceling(
        &self,
        now: DateTime<Utc>,
        timeout_s: u64,
    ) -> RepoResult<Vec<Job>> {
        self.scan_jobs(
            "state = 'canceling' AND state_entered_at_ms + ?1 < ?2",
            vec![
                SqlValue::Integer((timeout_s * 1000) as i64),
                SqlValue::Integer(ms(now)),
            ],
        )
        .await
    }

    pub async fn jobs_stale_client(
        &self,
        now: DateTime<Utc>,
        factor: f64,
    ) -> RepoResult<Vec<Job>> {
        self.scan_jobs(
            "mode = 'active' AND state NOT IN ('completed', 'failed', 'canceled') \
             AND client_last_seen_at_ms IS NOT NULL \
             AND client_last_seen_at_ms + CAST(heartbeat_interval_s * ?1 AS INTEGER) < ?2",
            vec![SqlValue::Real(factor * 1000.0), SqlValue::Integer(ms(now))],
        )
        .await
    }

    async fn scan_jobs(&self, clause: &str, values: Vec<SqlValue>) -> RepoResult<Vec<Job>> {
        let clause = clause.to_string();
        self.call(move |conn, t| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM {} WHERE {clause} ORDER BY job_id ASC",
                    t.jobs
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params_from_iter(values), row_to_job)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })
        .await
    }

    pub async fn logs_prune(&self, now: DateTime<Utc>, retention_s: u64) -> RepoResult<usize> {
        self.call(move |conn, t| {
            let n = conn
                .execute(
                    &format!(
                        "DELETE FROM {logs} WHERE job_id IN \
                           (SELECT job_id FROM {jobs} WHERE state IN {TERMINAL_STATES_SQL} \
                              AND ended_at_ms IS NOT NULL AND ended_at_ms + ?1 < ?2) \
                         OR job_id NOT IN (SELECT job_id FROM {jobs})",
                        logs = t.job_logs,
                        jobs = t.jobs,
                    ),
                    params![(retention_s * 1000) as i64, ms(now)],
                )
                .map_err(storage_err)?;
            Ok(n)
        })
        .await
    }

    pub async fn downlink_prune(&self, now: DateTime<Utc>, ttl_s: u64) -> RepoResult<usize> {
        self.call(move |conn, t| {
            let n = conn
                .execute(
                    &format!(
                        "DELETE FROM {} WHERE created_at_ms + ?1 < ?2",
                        t.downlink_messages
                    ),
                    params![(ttl_s * 1000) as i64, ms(now)],
                )
                .map_err(storage_err)?;
            Ok(n)
        })
        .await
    }

    // --- downlink -----------------------------------------------------

    pub async fn downlink_enqueue(&self, msg: DownlinkMessage) -> RepoResult<()> {
        self.call(move |conn, t| {
            let payload = serde_json::to_string(&msg.payload)
                .map_err(|e| RepoError::Serialization(e.to_string()))?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (message_id, recipient_id, kind, job_id, payload, \
                       created_at_ms, delivered_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                    t.downlink_messages
                ),
                params![
                    msg.message_id.to_string(),
                    msg.recipient_id,
                    msg.kind.as_str(),
                    msg.job_id.map(|id| id.to_string()),
                    payload,
                    ms(msg.created_at),
                ],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    pub async fn downlink_drain(
        &self,
        recipient: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<DownlinkMessage>> {
        let recipient = recipient.to_string();
        self.call(move |conn, t| {
            let tx = conn.transaction().map_err(storage_err)?;
            let mut drained = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT message_id, recipient_id, kind, job_id, payload, created_at_ms \
                         FROM {} WHERE recipient_id = ?1 ORDER BY message_id ASC LIMIT ?2",
                        t.downlink_messages
                    ))
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map(params![recipient, max as i64], row_to_downlink)
                    .map_err(storage_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(storage_err)?;
                rows
            };
            for msg in &mut drained {
                tx.execute(
                    &format!("DELETE FROM {} WHERE message_id = ?1", t.downlink_messages),
                    params![msg.message_id.to_string()],
                )
                .map_err(storage_err)?;
                msg.delivered_at = Some(now);
            }
            tx.commit().map_err(storage_err)?;
            Ok(drained)
        })
        .await
    }
}

// --- row mapping and helpers ------------------------------------------

fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn storage_err(err: rusqlite::Error) -> RepoError {
    RepoError::Storage(err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> RepoResult<String> {
    serde_json::to_string(value).map_err(|e| RepoError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> RepoResult<T> {
    serde_json::from_str(raw).map_err(|e| RepoError::Serialization(e.to_string()))
}

fn sql_state_list(states: &[JobState]) -> String {
    let quoted: Vec<String> = states.iter().map(|s| format!("'{}'", s.as_str())).collect();
    format!("({})", quoted.join(", "))
}

/// Rewrite bare `?` placeholders into `?N` starting at `start`.
fn number_placeholders(sql: &str, start: usize) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = start;
    for c in sql.chars() {
        if c == '?' {
            out.push('?');
            out.push_str(&n.to_string());
            n += 1;
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_col<T>(idx: usize, raw: &str, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value: {raw}").into(),
        )
    })
}

fn json_col<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn ulid_col(idx: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let role_raw: String = row.get(1)?;
    let cidrs_raw: String = row.get(4)?;
    Ok(Identity {
        client_id: row.get(0)?,
        role: parse_col(1, &role_raw, Role::parse)?,
        hmac_key_stored: row.get(2)?,
        key_id: row.get(3)?,
        allowed_cidrs: json_col(4, &cidrs_raw)?,
        created_at: from_ms(row.get(5)?)?,
    })
}

fn row_to_worker(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let status_raw: String = row.get(1)?;
    let binaries_raw: String = row.get(6)?;
    let variables_raw: String = row.get(7)?;
    Ok(Worker {
        worker_id: row.get(0)?,
        status: parse_col(1, &status_raw, WorkerStatus::parse)?,
        registered_at: from_ms(row.get(2)?)?,
        last_seen_at: from_ms(row.get(3)?)?,
        registration_interval_s: row.get(4)?,
        version: row.get(5)?,
        advertised_binaries: json_col(6, &binaries_raw)?,
        advertised_variables: json_col(7, &variables_raw)?,
        transport_choice: row.get(8)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let job_id_raw: String = row.get(0)?;
    let state_raw: String = row.get(3)?;
    let argv_raw: String = row.get(5)?;
    let required_raw: String = row.get(6)?;
    let mode_raw: String = row.get(7)?;
    let failure_raw: Option<String> = row.get(18)?;
    Ok(Job {
        job_id: ulid_col(0, &job_id_raw)?,
        submitter_id: row.get(1)?,
        assignee_id: row.get(2)?,
        state: parse_col(3, &state_raw, JobState::parse)?,
        binary: row.get(4)?,
        argv: json_col(5, &argv_raw)?,
        required_variables: json_col(6, &required_raw)?,
        mode: parse_col(7, &mode_raw, JobMode::parse)?,
        transport_choice: row.get(8)?,
        heartbeat_interval_s: row.get(9)?,
        created_at: from_ms(row.get(10)?)?,
        state_entered_at: from_ms(row.get(11)?)?,
        assigned_at: row.get::<_, Option<i64>>(12)?.map(from_ms).transpose()?,
        started_at: row.get::<_, Option<i64>>(13)?.map(from_ms).transpose()?,
        ended_at: row.get::<_, Option<i64>>(14)?.map(from_ms).transpose()?,
        last_heartbeat_at: row.get::<_, Option<i64>>(15)?.map(from_ms).transpose()?,
        client_last_seen_at: row.get::<_, Option<i64>>(16)?.map(from_ms).transpose()?,
        exit_code: row.get(17)?,
        failure_kind: failure_raw
            .as_deref()
            .map(|raw| parse_col(18, raw, FailureKind::parse))
            .transpose()?,
        ever_eligible: row.get::<_, i64>(19)? != 0,
    })
}

fn row_to_log_chunk(row: &Row<'_>) -> rusqlite::Result<LogChunk> {
    let job_id_raw: String = row.get(0)?;
    let stream_raw: String = row.get(2)?;
    Ok(LogChunk {
        job_id: ulid_col(0, &job_id_raw)?,
        seq: row.get::<_, i64>(1)? as u64,
        stream: parse_col(2, &stream_raw, LogStream::parse)?,
        text: row.get(3)?,
        emitted_at: from_ms(row.get(4)?)?,
    })
}

fn row_to_downlink(row: &Row<'_>) -> rusqlite::Result<DownlinkMessage> {
    let message_id_raw: String = row.get(0)?;
    let kind_raw: String = row.get(2)?;
    let job_id_raw: Option<String> = row.get(3)?;
    let payload_raw: String = row.get(4)?;
    Ok(DownlinkMessage {
        message_id: ulid_col(0, &message_id_raw)?,
        recipient_id: row.get(1)?,
        kind: parse_col(2, &kind_raw, DownlinkKind::parse)?,
        job_id: job_id_raw.as_deref().map(|raw| ulid_col(3, raw)).transpose()?,
        // Audience only matters for broker topic routing; drained messages
        // went over http_polling, which ignores it.
        audience: DownlinkAudience::Client,
        payload: json_col(4, &payload_raw)?,
        created_at: from_ms(row.get(5)?)?,
        delivered_at: None,
    })
}
