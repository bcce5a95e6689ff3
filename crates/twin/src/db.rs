use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TwinError;
use crate::id::{LatestId, format_id, next_seq, scope_prefix};
use crate::types::{AllocationStrategy, CreateRecordParams, EntityKind, Event, KindCount, Record};

const RESERVED_FIELDS: [&str; 2] = ["id", "object_id"];

pub struct Db {
    pub conn: Connection,
    pub twin_dir: PathBuf,
    pub strategy: AllocationStrategy,
}

fn parse_dt(idx: usize, s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn record_from_row(row: &rusqlite::Row) -> Result<Record, rusqlite::Error> {
    let kind_str: String = row.get("kind")?;
    let data_str: String = row.get("data")?;
    let created_at_str: String = row.get("created_at")?;
    let updated_at_str: String = row.get("updated_at")?;

    let kind = kind_str.parse::<EntityKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into())
    })?;
    let data: Map<String, Value> = serde_json::from_str(&data_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    Ok(Record {
        id: row.get("id")?,
        object_id: row.get("object_id")?,
        kind,
        data,
        created_at: parse_dt(0, &created_at_str)?,
        updated_at: parse_dt(0, &updated_at_str)?,
    })
}

pub(crate) fn event_from_row(row: &rusqlite::Row) -> Result<Event, rusqlite::Error> {
    let created_at_str: String = row.get("created_at")?;
    Ok(Event {
        seq: row.get("seq")?,
        record_id: row.get("record_id")?,
        event_type: row.get("event_type")?,
        actor: row.get("actor")?,
        detail: row.get("detail")?,
        created_at: parse_dt(0, &created_at_str)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn check_reserved(data: &Map<String, Value>) -> Result<(), TwinError> {
    if let Some(field) = RESERVED_FIELDS.iter().find(|f| data.contains_key(**f)) {
        return Err(TwinError::Validation(format!(
            "field `{field}` is assigned by the store and cannot be set"
        )));
    }
    Ok(())
}

fn check_required(kind: EntityKind, data: &Map<String, Value>) -> Result<(), TwinError> {
    let missing: Vec<&str> = kind
        .required_fields()
        .iter()
        .copied()
        .filter(|f| data.get(*f).is_none_or(is_blank))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TwinError::Validation(format!(
            "{kind} requires {}",
            missing.join(", ")
        )))
    }
}

pub fn validate_new(kind: EntityKind, data: &Map<String, Value>) -> Result<(), TwinError> {
    check_reserved(data)?;
    check_required(kind, data)
}

/// Apply `patch` onto `data`: keys with `null` are removed, others replaced.
pub fn merge_patch(
    kind: EntityKind,
    data: &mut Map<String, Value>,
    patch: &Map<String, Value>,
) -> Result<(), TwinError> {
    if patch.is_empty() {
        return Err(TwinError::Validation("no fields to update".into()));
    }
    check_reserved(patch)?;
    for (key, value) in patch {
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.clone(), value.clone());
        }
    }
    check_required(kind, data)
}

impl LatestId for Connection {
    fn latest_id(
        &self,
        kind: EntityKind,
        scope: Option<&str>,
    ) -> Result<Option<String>, TwinError> {
        let result = match scope {
            None => self
                .query_row(
                    "SELECT id FROM records WHERE kind = ?1
                     ORDER BY created_at DESC, seq DESC LIMIT 1",
                    rusqlite::params![kind.as_str()],
                    |row| row.get(0),
                )
                .optional(),
            Some(scope) => self
                .query_row(
                    "SELECT id FROM records
                     WHERE kind = ?1 AND substr(id, 1, length(?2)) = ?2
                     ORDER BY created_at DESC, seq DESC LIMIT 1",
                    rusqlite::params![kind.as_str(), scope],
                    |row| row.get(0),
                )
                .optional(),
        };
        result.map_err(|e| TwinError::Internal(format!("failed to read latest {kind}: {e}")))
    }
}

impl LatestId for Db {
    fn latest_id(
        &self,
        kind: EntityKind,
        scope: Option<&str>,
    ) -> Result<Option<String>, TwinError> {
        self.conn.latest_id(kind, scope)
    }
}

fn read_counter(conn: &Connection, scope: &str) -> Result<Option<u64>, TwinError> {
    conn.query_row(
        "SELECT value FROM counters WHERE scope = ?1",
        rusqlite::params![scope],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|n| n.max(0) as u64))
    .map_err(|e| TwinError::Internal(format!("failed to read counter {scope}: {e}")))
}

/// Counter value to hand out next in `scope`. The stored row never wins over
/// the latest identifier on disk, so records written by `scan` are skipped.
fn counter_next(conn: &Connection, kind: EntityKind, today: NaiveDate) -> Result<u64, TwinError> {
    let scope = scope_prefix(kind, today);
    let scanned = next_seq(kind, today, conn)?;
    let Some(current) = read_counter(conn, &scope)? else {
        return Ok(scanned);
    };
    let counted = current
        .checked_add(1)
        .ok_or_else(|| TwinError::Internal(format!("counter {scope} is exhausted")))?;
    if scanned > counted {
        tracing::warn!(%kind, counted, scanned, "counter behind stored records, skipping ahead");
    }
    Ok(counted.max(scanned))
}

/// Next value for the counter row of `kind` on `today`, seeding a missing row
/// from the latest stored identifier. Must run inside a write transaction.
fn bump_counter(conn: &Connection, kind: EntityKind, today: NaiveDate) -> Result<u64, TwinError> {
    let scope = scope_prefix(kind, today);
    let next = counter_next(conn, kind, today)?;
    let stored = i64::try_from(next)
        .map_err(|_| TwinError::Internal(format!("counter {scope} is exhausted")))?;

    conn.execute(
        "INSERT INTO counters (scope, value) VALUES (?1, ?2)
         ON CONFLICT(scope) DO UPDATE SET value = excluded.value",
        rusqlite::params![scope, stored],
    )
    .map_err(|e| TwinError::Internal(format!("failed to update counter {scope}: {e}")))?;

    Ok(next)
}

fn insert_record_in(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    data: &Map<String, Value>,
    actor: &str,
) -> Result<(), TwinError> {
    let ts = now();
    let object_id = format!("{:032x}", Uuid::now_v7().as_u128());
    let data_json = serde_json::to_string(data)
        .map_err(|e| TwinError::Internal(format!("failed to encode {kind} data: {e}")))?;

    conn.execute(
        "INSERT INTO records (id, object_id, kind, data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![id, object_id, kind.as_str(), data_json, ts, ts],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            tracing::warn!(%kind, id, "identifier collision on insert");
            TwinError::DuplicateId(id.to_string())
        } else {
            TwinError::Internal(format!("failed to create {kind}: {e}"))
        }
    })?;

    conn.execute(
        "INSERT INTO events (record_id, event_type, actor, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![id, "created", actor, ts],
    )
    .map_err(|e| TwinError::Internal(format!("failed to log create event: {e}")))?;

    Ok(())
}

impl Db {
    pub fn open(project_dir: &Path, strategy: AllocationStrategy) -> Result<Db, TwinError> {
        let twin_dir = project_dir.join(".twin");
        fs::create_dir_all(&twin_dir)
            .map_err(|e| TwinError::Internal(format!("failed to create .twin dir: {e}")))?;

        let db_path = twin_dir.join("db.sqlite");
        let conn = Connection::open(&db_path)
            .map_err(|e| TwinError::Internal(format!("failed to open database: {e}")))?;

        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| TwinError::Internal(format!("failed to set busy_timeout: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| TwinError::Internal(format!("failed to enable foreign_keys: {e}")))?;

        Self::run_migrations(&conn)?;

        Ok(Db {
            conn,
            twin_dir,
            strategy,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), TwinError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT NOT NULL UNIQUE,
                object_id  TEXT NOT NULL UNIQUE,
                kind       TEXT NOT NULL,
                data       TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS records_kind_created
                ON records (kind, created_at);

            CREATE TABLE IF NOT EXISTS counters (
                scope TEXT PRIMARY KEY,
                value INTEGER NOT NULL CHECK (value >= 0)
            );

            CREATE TABLE IF NOT EXISTS events (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id  TEXT NOT NULL REFERENCES records(id),
                event_type TEXT NOT NULL,
                actor      TEXT,
                detail     TEXT,
                created_at TEXT NOT NULL
            );",
        )
        .map_err(|e| TwinError::Internal(format!("migration failed: {e}")))?;

        Ok(())
    }

    pub fn create_record(&self, params: &CreateRecordParams) -> Result<Record, TwinError> {
        self.create_record_on(params, today())
    }

    /// Create a record as if on calendar day `day`. Nothing is written when
    /// validation or allocation fails.
    pub fn create_record_on(
        &self,
        params: &CreateRecordParams,
        day: NaiveDate,
    ) -> Result<Record, TwinError> {
        let kind = params.kind;
        validate_new(kind, &params.data)?;

        let id = match self.strategy {
            AllocationStrategy::Scan => {
                let tx = self.begin(TransactionBehavior::Deferred)?;
                let id = format_id(kind, day, next_seq(kind, day, &*tx)?);
                insert_record_in(&tx, kind, &id, &params.data, &params.actor)?;
                Self::commit(tx)?;
                id
            }
            AllocationStrategy::Counter => {
                let tx = self.begin(TransactionBehavior::Immediate)?;
                let id = format_id(kind, day, bump_counter(&tx, kind, day)?);
                insert_record_in(&tx, kind, &id, &params.data, &params.actor)?;
                Self::commit(tx)?;
                id
            }
        };

        tracing::info!(%kind, id = %id, actor = %params.actor, "record created");
        self.get_record(kind, &id)
    }

    /// The identifier the scan strategy would hand out on `day`. Reads only.
    #[cfg(test)]
    pub(crate) fn allocate_id(&self, kind: EntityKind, day: NaiveDate) -> Result<String, TwinError> {
        Ok(format_id(kind, day, next_seq(kind, day, self)?))
    }

    /// Persist a record under an identifier chosen by the caller.
    #[cfg(test)]
    pub(crate) fn insert_record(
        &self,
        kind: EntityKind,
        id: &str,
        data: &Map<String, Value>,
        actor: &str,
    ) -> Result<Record, TwinError> {
        validate_new(kind, data)?;
        insert_record_in(&self.conn, kind, id, data, actor)?;
        self.get_record(kind, id)
    }

    /// Next identifier under the active strategy, without reserving it.
    pub fn peek_id(&self, kind: EntityKind, day: NaiveDate) -> Result<String, TwinError> {
        match self.strategy {
            AllocationStrategy::Scan => Ok(format_id(kind, day, next_seq(kind, day, self)?)),
            AllocationStrategy::Counter => {
                Ok(format_id(kind, day, counter_next(&self.conn, kind, day)?))
            }
        }
    }

    pub fn get_record(&self, kind: EntityKind, id: &str) -> Result<Record, TwinError> {
        self.conn
            .query_row(
                "SELECT * FROM records WHERE kind = ?1 AND id = ?2",
                rusqlite::params![kind.as_str(), id],
                record_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => TwinError::NotFound {
                    kind,
                    id: id.to_string(),
                },
                other => TwinError::Internal(format!("failed to get {kind}: {other}")),
            })
    }

    pub fn list_records(
        &self,
        kind: EntityKind,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, TwinError> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM records WHERE kind = ?1
                 ORDER BY created_at, seq LIMIT ?2",
            )
            .map_err(|e| TwinError::Internal(format!("failed to prepare list query: {e}")))?;
        stmt.query_map(rusqlite::params![kind.as_str(), limit], record_from_row)
            .map_err(|e| TwinError::Internal(format!("failed to list {kind}: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TwinError::Internal(format!("failed to read {kind}: {e}")))
    }

    pub fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &Map<String, Value>,
        actor: &str,
    ) -> Result<Record, TwinError> {
        let mut record = self.get_record(kind, id)?;
        merge_patch(kind, &mut record.data, patch)?;

        let data_json = serde_json::to_string(&record.data)
            .map_err(|e| TwinError::Internal(format!("failed to encode {kind} data: {e}")))?;
        let detail = Value::Object(patch.clone()).to_string();
        let ts = now();

        let tx = self.begin(TransactionBehavior::Deferred)?;
        tx.execute(
            "UPDATE records SET data = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![data_json, ts, id],
        )
        .map_err(|e| TwinError::Internal(format!("failed to update {kind}: {e}")))?;
        tx.execute(
            "INSERT INTO events (record_id, event_type, actor, detail, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, "updated", actor, detail, ts],
        )
        .map_err(|e| TwinError::Internal(format!("failed to log update event: {e}")))?;
        Self::commit(tx)?;

        self.get_record(kind, id)
    }

    pub fn record_history(&self, kind: EntityKind, id: &str) -> Result<Vec<Event>, TwinError> {
        self.get_record(kind, id)?;

        let mut stmt = self
            .conn
            .prepare("SELECT * FROM events WHERE record_id = ?1 ORDER BY seq")
            .map_err(|e| TwinError::Internal(format!("failed to prepare history query: {e}")))?;
        stmt.query_map(rusqlite::params![id], event_from_row)
            .map_err(|e| TwinError::Internal(format!("failed to query history: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TwinError::Internal(format!("failed to read history: {e}")))
    }

    pub fn kind_counts(&self) -> Result<Vec<KindCount>, TwinError> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| -> Result<KindCount, TwinError> {
                let count: i64 = self
                    .conn
                    .query_row(
                        "SELECT COUNT(*) FROM records WHERE kind = ?1",
                        rusqlite::params![kind.as_str()],
                        |row| row.get(0),
                    )
                    .map_err(|e| TwinError::Internal(format!("failed to count {kind}: {e}")))?;
                Ok(KindCount {
                    kind,
                    count,
                    latest_id: self.latest_id(kind, None)?,
                })
            })
            .collect()
    }

    fn begin(&self, behavior: TransactionBehavior) -> Result<Transaction<'_>, TwinError> {
        Transaction::new_unchecked(&self.conn, behavior)
            .map_err(|e| TwinError::Internal(format!("failed to begin transaction: {e}")))
    }

    fn commit(tx: Transaction<'_>) -> Result<(), TwinError> {
        tx.commit()
            .map_err(|e| TwinError::Internal(format!("failed to commit: {e}")))
    }
}

pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_temp_db(strategy: AllocationStrategy) -> (Db, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), strategy).unwrap();
        (db, dir)
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn patient(name: &str) -> CreateRecordParams {
        CreateRecordParams {
            kind: EntityKind::Patient,
            data: fields(json!({ "name": name, "age": 40 })),
            actor: "test-agent".into(),
        }
    }

    fn purchase_order() -> CreateRecordParams {
        CreateRecordParams {
            kind: EntityKind::PurchaseOrder,
            data: fields(json!({ "supplier_id": "SUP0001", "items": [{ "sku": "gauze", "qty": 10 }] })),
            actor: "test-agent".into(),
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    const BOTH: [AllocationStrategy; 2] = [AllocationStrategy::Scan, AllocationStrategy::Counter];

    #[test]
    fn open_creates_tables() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(tables.contains(&"records".to_string()));
        assert!(tables.contains(&"counters".to_string()));
        assert!(tables.contains(&"events".to_string()));
    }

    #[test]
    fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let _db1 = Db::open(dir.path(), AllocationStrategy::Scan).unwrap();
        let _db2 = Db::open(dir.path(), AllocationStrategy::Counter).unwrap();
    }

    #[test]
    fn create_and_get() {
        for strategy in BOTH {
            let (db, _dir) = open_temp_db(strategy);
            let record = db.create_record(&patient("Ada Obi")).unwrap();

            assert_eq!(record.id, "PID000001");
            assert_eq!(record.kind, EntityKind::Patient);
            assert_eq!(record.data["name"], "Ada Obi");
            assert_eq!(record.object_id.len(), 32);
            assert_ne!(record.object_id, record.id);

            let fetched = db.get_record(EntityKind::Patient, &record.id).unwrap();
            assert_eq!(fetched.object_id, record.object_id);
            assert_eq!(fetched.data, record.data);
        }
    }

    #[test]
    fn sequential_creates_have_no_gaps() {
        for strategy in BOTH {
            let (db, _dir) = open_temp_db(strategy);
            let ids: Vec<String> = (0..12)
                .map(|i| db.create_record(&patient(&format!("p{i}"))).unwrap().id)
                .collect();
            let expected: Vec<String> = (1..=12).map(|n| format!("PID{n:06}")).collect();
            assert_eq!(ids, expected, "{strategy}");
        }
    }

    #[test]
    fn continues_after_existing_patient() {
        for strategy in BOTH {
            let (db, _dir) = open_temp_db(strategy);
            db.insert_record(
                EntityKind::Patient,
                "PID000123",
                &fields(json!({ "name": "imported" })),
                "migration",
            )
            .unwrap();

            assert_eq!(db.create_record(&patient("a")).unwrap().id, "PID000124");
            assert_eq!(db.create_record(&patient("b")).unwrap().id, "PID000125");
        }
    }

    #[test]
    fn purchase_orders_reset_per_day() {
        for strategy in BOTH {
            let (db, _dir) = open_temp_db(strategy);
            let d1 = day(2025, 10, 25);
            let d2 = day(2025, 10, 26);

            assert_eq!(db.create_record_on(&purchase_order(), d1).unwrap().id, "PO-20251025-001");
            assert_eq!(db.create_record_on(&purchase_order(), d1).unwrap().id, "PO-20251025-002");
            assert_eq!(db.create_record_on(&purchase_order(), d1).unwrap().id, "PO-20251025-003");
            assert_eq!(db.create_record_on(&purchase_order(), d2).unwrap().id, "PO-20251026-001");
        }
    }

    #[test]
    fn kinds_count_independently() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        db.create_record(&patient("a")).unwrap();
        db.create_record(&patient("b")).unwrap();
        let staff = db
            .create_record(&CreateRecordParams {
                kind: EntityKind::Staff,
                data: fields(json!({ "name": "Dr. Osei", "role": "doctor" })),
                actor: "test-agent".into(),
            })
            .unwrap();
        assert_eq!(staff.id, "STF0001");

        let counts = db.kind_counts().unwrap();
        let patients = counts.iter().find(|c| c.kind == EntityKind::Patient).unwrap();
        assert_eq!(patients.count, 2);
        assert_eq!(patients.latest_id.as_deref(), Some("PID000002"));
        let issues = counts.iter().find(|c| c.kind == EntityKind::Issue).unwrap();
        assert_eq!(issues.count, 0);
        assert!(issues.latest_id.is_none());
    }

    #[test]
    fn validation_failure_persists_nothing() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        let err = db
            .create_record(&CreateRecordParams {
                kind: EntityKind::Appointment,
                data: fields(json!({ "patient_id": "PID000001", "doctor_id": "  " })),
                actor: "test-agent".into(),
            })
            .unwrap_err();
        match err {
            TwinError::Validation(msg) => {
                assert!(msg.contains("doctor_id"), "{msg}");
                assert!(msg.contains("date"), "{msg}");
            }
            other => panic!("expected validation error, got {other}"),
        }
        assert!(db.list_records(EntityKind::Appointment, None).unwrap().is_empty());
        assert_eq!(read_counter(&db.conn, "APT-").unwrap(), None);
    }

    #[test]
    fn reserved_fields_are_rejected() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        let mut params = patient("a");
        params.data.insert("id".into(), json!("PID999999"));
        assert!(matches!(
            db.create_record(&params),
            Err(TwinError::Validation(_))
        ));
    }

    #[test]
    fn malformed_latest_fails_creation() {
        for strategy in BOTH {
            let (db, _dir) = open_temp_db(strategy);
            db.insert_record(
                EntityKind::Supplier,
                "SUP-legacy",
                &fields(json!({ "name": "old vendor" })),
                "migration",
            )
            .unwrap();

            let err = db
                .create_record(&CreateRecordParams {
                    kind: EntityKind::Supplier,
                    data: fields(json!({ "name": "new vendor" })),
                    actor: "test-agent".into(),
                })
                .unwrap_err();
            assert!(matches!(err, TwinError::MalformedId { ref id, .. } if id == "SUP-legacy"));
            assert_eq!(db.list_records(EntityKind::Supplier, None).unwrap().len(), 1);
        }
    }

    #[test]
    fn scan_race_surfaces_duplicate() {
        let dir = TempDir::new().unwrap();
        let first = Db::open(dir.path(), AllocationStrategy::Scan).unwrap();
        let second = Db::open(dir.path(), AllocationStrategy::Scan).unwrap();
        let today = day(2025, 10, 25);
        let data = fields(json!({ "name": "Gamma CT" }));

        // Both writers read the same latest identifier before either inserts.
        let a = first.allocate_id(EntityKind::Equipment, today).unwrap();
        let b = second.allocate_id(EntityKind::Equipment, today).unwrap();
        assert_eq!(a, "EQ0001");
        assert_eq!(a, b);

        first.insert_record(EntityKind::Equipment, &a, &data, "w1").unwrap();
        let err = second
            .insert_record(EntityKind::Equipment, &b, &data, "w2")
            .unwrap_err();
        assert!(matches!(err, TwinError::DuplicateId(ref id) if id == "EQ0001"));
        assert_eq!(first.list_records(EntityKind::Equipment, None).unwrap().len(), 1);
    }

    #[test]
    fn counter_interleaved_writers_never_collide() {
        let dir = TempDir::new().unwrap();
        let first = Db::open(dir.path(), AllocationStrategy::Counter).unwrap();
        let second = Db::open(dir.path(), AllocationStrategy::Counter).unwrap();
        let params = CreateRecordParams {
            kind: EntityKind::Equipment,
            data: fields(json!({ "name": "ventilator" })),
            actor: "test-agent".into(),
        };

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(first.create_record(&params).unwrap().id);
            ids.push(second.create_record(&params).unwrap().id);
        }
        let expected: Vec<String> = (1..=10).map(|n| format!("EQ{n:04}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn peek_does_not_reserve() {
        for strategy in BOTH {
            let (db, _dir) = open_temp_db(strategy);
            let today = today();
            assert_eq!(db.peek_id(EntityKind::Patient, today).unwrap(), "PID000001");
            assert_eq!(db.peek_id(EntityKind::Patient, today).unwrap(), "PID000001");
            db.create_record(&patient("a")).unwrap();
            assert_eq!(db.peek_id(EntityKind::Patient, today).unwrap(), "PID000002");
        }
    }

    #[test]
    fn get_nonexistent() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        let result = db.get_record(EntityKind::Patient, "PID000404");
        assert!(matches!(result, Err(TwinError::NotFound { .. })));
    }

    #[test]
    fn get_checks_kind() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        let record = db.create_record(&patient("a")).unwrap();
        assert!(matches!(
            db.get_record(EntityKind::Staff, &record.id),
            Err(TwinError::NotFound { .. })
        ));
    }

    #[test]
    fn list_respects_order_and_limit() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        for name in ["a", "b", "c"] {
            db.create_record(&patient(name)).unwrap();
        }
        let all = db.list_records(EntityKind::Patient, None).unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["PID000001", "PID000002", "PID000003"]);

        let two = db.list_records(EntityKind::Patient, Some(2)).unwrap();
        assert_eq!(two.len(), 2);
    }

    #[test]
    fn update_merges_and_logs_event() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        let record = db.create_record(&patient("Ada")).unwrap();

        let updated = db
            .update_record(
                EntityKind::Patient,
                &record.id,
                &fields(json!({ "ward": "B2", "age": null })),
                "nurse-1",
            )
            .unwrap();
        assert_eq!(updated.id, record.id);
        assert_eq!(updated.data["name"], "Ada");
        assert_eq!(updated.data["ward"], "B2");
        assert!(!updated.data.contains_key("age"));
        assert!(updated.updated_at >= record.updated_at);

        let history = db.record_history(EntityKind::Patient, &record.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, "created");
        assert_eq!(history[1].event_type, "updated");
        assert_eq!(history[1].actor.as_deref(), Some("nurse-1"));
        assert!(history[1].detail.as_ref().unwrap().contains("B2"));
    }

    #[test]
    fn update_cannot_touch_identity_or_required_fields() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        let record = db.create_record(&patient("Ada")).unwrap();

        for patch in [json!({ "id": "PID000999" }), json!({ "name": null }), json!({})] {
            let err = db
                .update_record(EntityKind::Patient, &record.id, &fields(patch), "x")
                .unwrap_err();
            assert!(matches!(err, TwinError::Validation(_)));
        }
        let history = db.record_history(EntityKind::Patient, &record.id).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn counter_skips_identifiers_written_by_scan() {
        let dir = TempDir::new().unwrap();
        let counter = Db::open(dir.path(), AllocationStrategy::Counter).unwrap();
        let scan = Db::open(dir.path(), AllocationStrategy::Scan).unwrap();
        let today = today();

        assert_eq!(counter.create_record(&patient("a")).unwrap().id, "PID000001");
        assert_eq!(scan.create_record(&patient("b")).unwrap().id, "PID000002");

        assert_eq!(counter.peek_id(EntityKind::Patient, today).unwrap(), "PID000003");
        assert_eq!(counter.create_record(&patient("c")).unwrap().id, "PID000003");
        assert_eq!(read_counter(&counter.conn, "PID").unwrap(), Some(3));
        assert_eq!(counter.create_record(&patient("d")).unwrap().id, "PID000004");
    }

    #[test]
    fn counter_row_tracks_allocations() {
        let (db, _dir) = open_temp_db(AllocationStrategy::Counter);
        db.create_record(&patient("a")).unwrap();
        assert_eq!(read_counter(&db.conn, "PID").unwrap(), Some(1));
        db.create_record(&patient("b")).unwrap();
        assert_eq!(read_counter(&db.conn, "PID").unwrap(), Some(2));
    }
}
