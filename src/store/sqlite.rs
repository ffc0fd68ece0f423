//! SQLite store backend.
//!
//! Conditional updates are plain `UPDATE ... WHERE <expected-state>`
//! statements checked via `rows_affected`, which is where the race between
//! concurrent doctors is actually decided. Timestamps are stored as unix
//! seconds, `viewed_by` as a JSON text column, and next-of-kin rows join
//! the patient so feed snapshots are complete.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::{broadcast, Mutex};

use crate::models::{
    AbnormalFlag, ChangeBody, ChangeEvent, ConsultationStatus, LabResult, LabResultId,
    NextOfKin, Patient, PatientId, ResultStatus, StaffId, VisitType,
};

use super::{
    EntityStore, PatientChange, PatientExpectation, ScopeFilter, StoreError, FEED_CAPACITY,
};

pub struct SqliteStore {
    pool: SqlitePool,
    events: broadcast::Sender<ChangeEvent>,
    seq: AtomicU64,
    // SQLite serializes writers anyway; taking this across mutate+emit
    // keeps the feed in commit order.
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(url, FEED_CAPACITY).await
    }

    pub async fn connect_with(url: &str, feed_capacity: usize) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(backend)?;
        Self::initialize_schema(&pool).await?;
        let (events, _) = broadcast::channel(feed_capacity);
        Ok(Self {
            pool,
            events,
            seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        })
    }

    async fn initialize_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS patients (
                id TEXT PRIMARY KEY,
                mrn TEXT NOT NULL,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                date_of_birth TEXT NOT NULL,
                practice_code TEXT NOT NULL,
                consultation_status TEXT NOT NULL,
                current_doctor_id TEXT,
                last_status_change INTEGER NOT NULL,
                visit_type TEXT NOT NULL,
                visit_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS next_of_kin (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id TEXT NOT NULL,
                name TEXT NOT NULL,
                relationship TEXT NOT NULL,
                phone TEXT,
                FOREIGN KEY (patient_id) REFERENCES patients(id)
            )",
        )
        .execute(pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS lab_results (
                id TEXT PRIMARY KEY,
                patient_id TEXT NOT NULL,
                practice_code TEXT NOT NULL,
                test_name TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT NOT NULL,
                reference_range_low REAL,
                reference_range_high REAL,
                abnormal_flag TEXT NOT NULL,
                result_status TEXT NOT NULL,
                critical_acknowledged INTEGER NOT NULL DEFAULT 0,
                acknowledged_by TEXT,
                acknowledged_at INTEGER,
                acknowledgment_note TEXT,
                viewed_by TEXT NOT NULL DEFAULT '[]',
                collection_datetime INTEGER NOT NULL,
                resulted_at INTEGER NOT NULL,
                FOREIGN KEY (patient_id) REFERENCES patients(id)
            )",
        )
        .execute(pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    fn emit(&self, body: ChangeBody) {
        let event = ChangeEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            occurred_at: Utc::now(),
            body,
        };
        let _ = self.events.send(event);
    }

    async fn load_patient(&self, id: &PatientId) -> Result<Option<Patient>, StoreError> {
        let row = sqlx::query("SELECT * FROM patients WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let kin = self.load_kin(&[id.clone()]).await?;
        let patient = row_to_patient(&row, kin.get(id).cloned().unwrap_or_default())?;
        Ok(Some(patient))
    }

    async fn load_kin(
        &self,
        ids: &[PatientId],
    ) -> Result<HashMap<PatientId, Vec<NextOfKin>>, StoreError> {
        let mut grouped: HashMap<PatientId, Vec<NextOfKin>> = HashMap::new();
        if ids.is_empty() {
            return Ok(grouped);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT patient_id, name, relationship, phone FROM next_of_kin
             WHERE patient_id IN ({placeholders}) ORDER BY id"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        for row in rows {
            let patient_id = parse_patient_id(&row, "patient_id")?;
            grouped.entry(patient_id).or_default().push(NextOfKin {
                name: row.try_get("name").map_err(backend)?,
                relationship: row.try_get("relationship").map_err(backend)?,
                phone: row.try_get("phone").map_err(backend)?,
            });
        }
        Ok(grouped)
    }

    async fn load_lab_result(
        &self,
        id: &LabResultId,
    ) -> Result<Option<LabResult>, StoreError> {
        let row = sqlx::query("SELECT * FROM lab_results WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| row_to_lab_result(&row)).transpose()
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn insert_patient(&self, patient: Patient) -> Result<Patient, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query(
            "INSERT INTO patients (
                id, mrn, first_name, last_name, date_of_birth, practice_code,
                consultation_status, current_doctor_id, last_status_change,
                visit_type, visit_reason, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(patient.id.to_string())
        .bind(&patient.mrn)
        .bind(&patient.first_name)
        .bind(&patient.last_name)
        .bind(patient.date_of_birth.to_string())
        .bind(&patient.practice_code)
        .bind(patient.consultation_status.as_str())
        .bind(patient.current_doctor_id.as_ref().map(|d| d.to_string()))
        .bind(patient.last_status_change.timestamp())
        .bind(patient.visit_type.as_str())
        .bind(&patient.visit_reason)
        .bind(patient.created_at.timestamp())
        .bind(patient.updated_at.timestamp())
        .execute(&mut tx)
        .await
        .map_err(backend)?;

        for kin in &patient.next_of_kin {
            sqlx::query(
                "INSERT INTO next_of_kin (patient_id, name, relationship, phone)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(patient.id.to_string())
            .bind(&kin.name)
            .bind(&kin.relationship)
            .bind(&kin.phone)
            .execute(&mut tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;

        self.emit(ChangeBody::PatientInserted(patient.clone()));
        Ok(patient)
    }

    async fn insert_lab_result(&self, result: LabResult) -> Result<LabResult, StoreError> {
        let _guard = self.write_lock.lock().await;

        let viewed = serde_json::to_string(&result.viewed_by).map_err(backend)?;
        sqlx::query(
            "INSERT INTO lab_results (
                id, patient_id, practice_code, test_name, value, unit,
                reference_range_low, reference_range_high, abnormal_flag,
                result_status, critical_acknowledged, acknowledged_by,
                acknowledged_at, acknowledgment_note, viewed_by,
                collection_datetime, resulted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.id.to_string())
        .bind(result.patient_id.to_string())
        .bind(&result.practice_code)
        .bind(&result.test_name)
        .bind(result.value)
        .bind(&result.unit)
        .bind(result.reference_range_low)
        .bind(result.reference_range_high)
        .bind(result.abnormal_flag.as_str())
        .bind(result.result_status.as_str())
        .bind(result.critical_acknowledged)
        .bind(result.acknowledged_by.as_ref().map(|s| s.to_string()))
        .bind(result.acknowledged_at.map(|t| t.timestamp()))
        .bind(&result.acknowledgment_note)
        .bind(viewed)
        .bind(result.collection_datetime.timestamp())
        .bind(result.resulted_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.emit(ChangeBody::LabResultInserted(result.clone()));
        Ok(result)
    }

    async fn get_patient(&self, id: &PatientId) -> Result<Option<Patient>, StoreError> {
        self.load_patient(id).await
    }

    async fn get_lab_result(
        &self,
        id: &LabResultId,
    ) -> Result<Option<LabResult>, StoreError> {
        self.load_lab_result(id).await
    }

    async fn fetch_patients(&self, filter: &ScopeFilter) -> Result<Vec<Patient>, StoreError> {
        let rows = match &filter.practice_code {
            Some(practice) => {
                sqlx::query("SELECT * FROM patients WHERE practice_code = ?")
                    .bind(practice)
                    .fetch_all(&self.pool)
                    .await
            }
            None => sqlx::query("SELECT * FROM patients").fetch_all(&self.pool).await,
        }
        .map_err(backend)?;

        let ids = rows
            .iter()
            .map(|row| parse_patient_id(row, "id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut kin = self.load_kin(&ids).await?;

        rows.iter()
            .zip(ids)
            .map(|(row, id)| row_to_patient(row, kin.remove(&id).unwrap_or_default()))
            .collect()
    }

    async fn fetch_lab_results(
        &self,
        filter: &ScopeFilter,
    ) -> Result<Vec<LabResult>, StoreError> {
        let rows = match &filter.practice_code {
            Some(practice) => {
                sqlx::query("SELECT * FROM lab_results WHERE practice_code = ?")
                    .bind(practice)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM lab_results")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(backend)?;

        rows.iter().map(row_to_lab_result).collect()
    }

    async fn update_patient_if(
        &self,
        id: &PatientId,
        expect: PatientExpectation,
        change: PatientChange,
    ) -> Result<Patient, StoreError> {
        let _guard = self.write_lock.lock().await;

        let set_clause = match &change {
            PatientChange::BeginConsultation { .. } => {
                "consultation_status = ?, current_doctor_id = ?,
                 last_status_change = ?, updated_at = ?"
            }
            PatientChange::FinishConsultation { .. } => {
                "consultation_status = ?, current_doctor_id = NULL,
                 last_status_change = ?, updated_at = ?"
            }
            PatientChange::Enqueue { .. } => {
                "consultation_status = ?, current_doctor_id = NULL,
                 visit_type = ?, visit_reason = ?,
                 last_status_change = ?, updated_at = ?"
            }
        };
        let cond_clause = match &expect {
            PatientExpectation::AwaitingDoctor => {
                " AND consultation_status IN ('none', 'waiting')
                  AND current_doctor_id IS NULL"
            }
            PatientExpectation::InConsultationWith(_) => {
                " AND consultation_status = 'in_consultation'
                  AND current_doctor_id = ?"
            }
            PatientExpectation::Any => "",
        };
        let sql = format!("UPDATE patients SET {set_clause} WHERE id = ?{cond_clause}");

        let mut query = sqlx::query(&sql);
        query = match &change {
            PatientChange::BeginConsultation { doctor, at } => query
                .bind(ConsultationStatus::InConsultation.as_str())
                .bind(doctor.to_string())
                .bind(at.timestamp())
                .bind(at.timestamp()),
            PatientChange::FinishConsultation { at } => query
                .bind(ConsultationStatus::Served.as_str())
                .bind(at.timestamp())
                .bind(at.timestamp()),
            PatientChange::Enqueue {
                visit_type,
                reason,
                at,
            } => query
                .bind(ConsultationStatus::Waiting.as_str())
                .bind(visit_type.as_str())
                .bind(reason.clone())
                .bind(at.timestamp())
                .bind(at.timestamp()),
        };
        query = query.bind(id.to_string());
        if let PatientExpectation::InConsultationWith(doctor) = &expect {
            query = query.bind(doctor.to_string());
        }

        let outcome = query.execute(&self.pool).await.map_err(backend)?;
        if outcome.rows_affected() == 0 {
            // Either the row is gone or the expectation no longer holds;
            // the current snapshot tells the caller which.
            return match self.load_patient(id).await? {
                Some(current) => Err(StoreError::PatientConflict(Box::new(current))),
                None => Err(StoreError::PatientNotFound(id.clone())),
            };
        }

        let updated = self
            .load_patient(id)
            .await?
            .ok_or_else(|| StoreError::PatientNotFound(id.clone()))?;
        self.emit(ChangeBody::PatientUpdated(updated.clone()));
        Ok(updated)
    }

    async fn acknowledge_lab_result(
        &self,
        id: &LabResultId,
        by: &StaffId,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<LabResult, StoreError> {
        let _guard = self.write_lock.lock().await;

        let outcome = sqlx::query(
            "UPDATE lab_results
             SET critical_acknowledged = 1, acknowledged_by = ?,
                 acknowledged_at = ?, acknowledgment_note = ?
             WHERE id = ? AND critical_acknowledged = 0",
        )
        .bind(by.to_string())
        .bind(at.timestamp())
        .bind(note)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if outcome.rows_affected() == 0 {
            return match self.load_lab_result(id).await? {
                Some(current) => Err(StoreError::LabResultConflict(Box::new(current))),
                None => Err(StoreError::LabResultNotFound(id.clone())),
            };
        }

        let updated = self
            .load_lab_result(id)
            .await?
            .ok_or_else(|| StoreError::LabResultNotFound(id.clone()))?;
        self.emit(ChangeBody::LabResultUpdated(updated.clone()));
        Ok(updated)
    }

    async fn mark_lab_result_viewed(
        &self,
        id: &LabResultId,
        viewer: &StaffId,
    ) -> Result<LabResult, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query("SELECT viewed_by FROM lab_results WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::LabResultNotFound(id.clone()))?;
        let raw: String = row.try_get("viewed_by").map_err(backend)?;
        let mut viewed: HashSet<StaffId> = serde_json::from_str(&raw).map_err(backend)?;

        let changed = viewed.insert(viewer.clone());
        if changed {
            sqlx::query("UPDATE lab_results SET viewed_by = ? WHERE id = ?")
                .bind(serde_json::to_string(&viewed).map_err(backend)?)
                .bind(id.to_string())
                .execute(&mut tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;

        let updated = self
            .load_lab_result(id)
            .await?
            .ok_or_else(|| StoreError::LabResultNotFound(id.clone()))?;
        if changed {
            self.emit(ChangeBody::LabResultUpdated(updated.clone()));
        }
        Ok(updated)
    }

    async fn delete_patient(&self, id: &PatientId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("DELETE FROM next_of_kin WHERE patient_id = ?")
            .bind(id.to_string())
            .execute(&mut tx)
            .await
            .map_err(backend)?;
        let outcome = sqlx::query("DELETE FROM patients WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::PatientNotFound(id.clone()));
        }
        self.emit(ChangeBody::PatientDeleted(id.clone()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse_patient_id(row: &SqliteRow, column: &str) -> Result<PatientId, StoreError> {
    let raw: String = row.try_get(column).map_err(backend)?;
    PatientId::parse(&raw).map_err(backend)
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    let secs: i64 = row.try_get(column).map_err(backend)?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Backend(format!("invalid timestamp in {column}")))
}

fn row_to_patient(row: &SqliteRow, next_of_kin: Vec<NextOfKin>) -> Result<Patient, StoreError> {
    let status_raw: String = row.try_get("consultation_status").map_err(backend)?;
    let visit_raw: String = row.try_get("visit_type").map_err(backend)?;
    let dob_raw: String = row.try_get("date_of_birth").map_err(backend)?;
    let doctor_raw: Option<String> = row.try_get("current_doctor_id").map_err(backend)?;

    Ok(Patient {
        id: parse_patient_id(row, "id")?,
        mrn: row.try_get("mrn").map_err(backend)?,
        first_name: row.try_get("first_name").map_err(backend)?,
        last_name: row.try_get("last_name").map_err(backend)?,
        date_of_birth: dob_raw.parse::<NaiveDate>().map_err(backend)?,
        practice_code: row.try_get("practice_code").map_err(backend)?,
        consultation_status: ConsultationStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::Backend(format!("unknown consultation status: {status_raw}"))
        })?,
        current_doctor_id: doctor_raw
            .map(|raw| StaffId::parse(&raw))
            .transpose()
            .map_err(backend)?,
        last_status_change: timestamp(row, "last_status_change")?,
        visit_type: VisitType::parse(&visit_raw)
            .ok_or_else(|| StoreError::Backend(format!("unknown visit type: {visit_raw}")))?,
        visit_reason: row.try_get("visit_reason").map_err(backend)?,
        next_of_kin,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
    })
}

fn row_to_lab_result(row: &SqliteRow) -> Result<LabResult, StoreError> {
    let id_raw: String = row.try_get("id").map_err(backend)?;
    let flag_raw: String = row.try_get("abnormal_flag").map_err(backend)?;
    let status_raw: String = row.try_get("result_status").map_err(backend)?;
    let by_raw: Option<String> = row.try_get("acknowledged_by").map_err(backend)?;
    let at_raw: Option<i64> = row.try_get("acknowledged_at").map_err(backend)?;
    let viewed_raw: String = row.try_get("viewed_by").map_err(backend)?;

    Ok(LabResult {
        id: LabResultId::parse(&id_raw).map_err(backend)?,
        patient_id: parse_patient_id(row, "patient_id")?,
        practice_code: row.try_get("practice_code").map_err(backend)?,
        test_name: row.try_get("test_name").map_err(backend)?,
        value: row.try_get("value").map_err(backend)?,
        unit: row.try_get("unit").map_err(backend)?,
        reference_range_low: row.try_get("reference_range_low").map_err(backend)?,
        reference_range_high: row.try_get("reference_range_high").map_err(backend)?,
        abnormal_flag: AbnormalFlag::parse(&flag_raw).ok_or_else(|| {
            StoreError::Backend(format!("unknown abnormal flag: {flag_raw}"))
        })?,
        result_status: ResultStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::Backend(format!("unknown result status: {status_raw}"))
        })?,
        critical_acknowledged: row.try_get("critical_acknowledged").map_err(backend)?,
        acknowledged_by: by_raw
            .map(|raw| StaffId::parse(&raw))
            .transpose()
            .map_err(backend)?,
        acknowledged_at: at_raw
            .map(|secs| {
                DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                    StoreError::Backend("invalid acknowledged_at timestamp".into())
                })
            })
            .transpose()?,
        acknowledgment_note: row.try_get("acknowledgment_note").map_err(backend)?,
        viewed_by: serde_json::from_str(&viewed_raw).map_err(backend)?,
        collection_datetime: timestamp(row, "collection_datetime")?,
        resulted_at: timestamp(row, "resulted_at")?,
    })
}
