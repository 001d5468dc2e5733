// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL ground truth for sequence state and the patient identity table.
//!
//! ```sql
//! CREATE TABLE patient_sequences (
//!   tenant_code       VARCHAR(20) NOT NULL,
//!   year              BIGINT NOT NULL,
//!   last_number       BIGINT NOT NULL,   -- 0 = nothing issued yet
//!   last_suffix       VARCHAR(3) NOT NULL,
//!   generated_count   BIGINT NOT NULL,
//!   sequence_position BIGINT NOT NULL,   -- ordinal of (last_number, last_suffix)
//!   updated_at        BIGINT NOT NULL,   -- epoch millis
//!   PRIMARY KEY (tenant_code, year)
//! )
//! ```
//!
//! `sequence_position` is derived from the number/suffix pair and exists so
//! the write-behind upsert can compare states in plain SQL and never move a
//! row backwards.
//!
//! ## Allocation transaction
//!
//! 1. `INSERT … ON CONFLICT DO NOTHING` / `INSERT IGNORE` the zero row. This
//!    is the first statement, so SQLite takes its write lock up front.
//! 2. Read the row (`FOR UPDATE` on MySQL, under SERIALIZABLE).
//! 3. Apply the rollover rule in Rust.
//! 4. Compare-and-set `UPDATE` guarded on the values read. Zero rows
//!    affected means a concurrent writer won; the transaction rolls back and
//!    the whole attempt is retried.
//!
//! Both SQLite and MySQL go through sqlx's `Any` driver, which reports
//! MySQL text columns as bytes; string columns are read through
//! [`row_string`] for that reason.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Connection, Row};
use std::collections::HashSet;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{
    phone_digits, phone_tail, CandidateFilter, NameBlock, PatientDirectory, PatientRecord,
    SequenceStore, StorageError,
};
use crate::duplicates::trigram::trigram_keys;
use crate::resilience::retry::{retry, retry_if, RetryConfig};
use crate::sequence::{PeriodKey, SequenceState, Suffix};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a text column as String (SQLite) or bytes (MySQL via `Any`).
fn row_string(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the tables if needed.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS patient_sequences (
                    tenant_code TEXT NOT NULL,
                    year INTEGER NOT NULL,
                    last_number INTEGER NOT NULL DEFAULT 0,
                    last_suffix TEXT NOT NULL DEFAULT 'AAA',
                    generated_count INTEGER NOT NULL DEFAULT 0,
                    sequence_position INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (tenant_code, year)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS patients (
                    id TEXT PRIMARY KEY,
                    tenant_code TEXT NOT NULL,
                    patient_code TEXT NOT NULL,
                    nom TEXT NOT NULL,
                    prenoms TEXT NOT NULL,
                    date_naissance TEXT NOT NULL,
                    telephone TEXT,
                    telephone_digits TEXT,
                    telephone_tail TEXT,
                    created_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_patients_birth ON patients (date_naissance)",
                "CREATE INDEX IF NOT EXISTS idx_patients_phone ON patients (telephone_digits)",
                "CREATE INDEX IF NOT EXISTS idx_patients_tail ON patients (telephone_tail)",
                r#"
                CREATE TABLE IF NOT EXISTS patient_name_trigrams (
                    patient_id TEXT NOT NULL,
                    field TEXT NOT NULL,
                    trigram TEXT NOT NULL,
                    PRIMARY KEY (patient_id, field, trigram)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_name_trigrams
                 ON patient_name_trigrams (field, trigram)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS patient_sequences (
                    tenant_code VARCHAR(20) NOT NULL,
                    year BIGINT NOT NULL,
                    last_number BIGINT NOT NULL DEFAULT 0,
                    last_suffix VARCHAR(3) NOT NULL DEFAULT 'AAA',
                    generated_count BIGINT NOT NULL DEFAULT 0,
                    sequence_position BIGINT NOT NULL DEFAULT 0,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (tenant_code, year)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS patients (
                    id VARCHAR(64) PRIMARY KEY,
                    tenant_code VARCHAR(20) NOT NULL,
                    patient_code VARCHAR(40) NOT NULL,
                    nom VARCHAR(255) NOT NULL,
                    prenoms VARCHAR(255) NOT NULL,
                    date_naissance VARCHAR(10) NOT NULL,
                    telephone VARCHAR(32),
                    telephone_digits VARCHAR(32),
                    telephone_tail VARCHAR(8),
                    created_at BIGINT NOT NULL,
                    INDEX idx_patients_birth (date_naissance),
                    INDEX idx_patients_phone (telephone_digits),
                    INDEX idx_patients_tail (telephone_tail),
                    INDEX idx_patients_tenant (tenant_code)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS patient_name_trigrams (
                    patient_id VARCHAR(64) NOT NULL,
                    field CHAR(1) NOT NULL,
                    trigram VARCHAR(3) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL,
                    PRIMARY KEY (patient_id, field, trigram),
                    INDEX idx_name_trigrams (field, trigram)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }

        Ok(())
    }

    fn row_to_state(row: &AnyRow, period: &PeriodKey) -> Result<SequenceState, StorageError> {
        let corrupt = |value: String| StorageError::Corruption {
            key: period.to_string(),
            value,
        };
        let number: i64 = row.try_get("last_number").map_err(backend)?;
        let suffix_raw = row_string(row, "last_suffix").unwrap_or_default();
        let count: i64 = row.try_get("generated_count").map_err(backend)?;

        let suffix = Suffix::parse(&suffix_raw)
            .ok_or_else(|| corrupt(format!("{}:{}", number, suffix_raw)))?;
        let number =
            u16::try_from(number).map_err(|_| corrupt(format!("{}:{}", number, suffix_raw)))?;
        SequenceState::new(number, suffix, count.max(0) as u64)
            .map_err(|_| corrupt(format!("{}:{}", number, suffix_raw)))
    }

    /// One attempt of the allocation transaction. Dropping the transaction
    /// on any early return rolls it back.
    async fn allocate_once(
        &self,
        period: &PeriodKey,
        floor: Option<SequenceState>,
    ) -> Result<SequenceState, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;

        if !self.is_sqlite {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *conn)
                .await
                .map_err(backend)?;
        }

        let mut tx = conn.begin().await.map_err(backend)?;
        let now = Utc::now().timestamp_millis();

        let ensure_sql = if self.is_sqlite {
            "INSERT INTO patient_sequences (tenant_code, year, last_number, last_suffix, generated_count, sequence_position, updated_at)
             VALUES (?, ?, 0, 'AAA', 0, 0, ?)
             ON CONFLICT(tenant_code, year) DO NOTHING"
        } else {
            "INSERT IGNORE INTO patient_sequences (tenant_code, year, last_number, last_suffix, generated_count, sequence_position, updated_at)
             VALUES (?, ?, 0, 'AAA', 0, 0, ?)"
        };
        sqlx::query(ensure_sql)
            .bind(period.tenant())
            .bind(i64::from(period.year()))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let select_sql = if self.is_sqlite {
            "SELECT last_number, last_suffix, generated_count FROM patient_sequences WHERE tenant_code = ? AND year = ?"
        } else {
            "SELECT last_number, last_suffix, generated_count FROM patient_sequences WHERE tenant_code = ? AND year = ? FOR UPDATE"
        };
        let row = sqlx::query(select_sql)
            .bind(period.tenant())
            .bind(i64::from(period.year()))
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;
        let stored = Self::row_to_state(&row, period)?;

        let base = match floor {
            Some(f) => SequenceState::max_of(stored, f),
            None => stored,
        };
        let mut next = base
            .advance()
            .map_err(|_| StorageError::CapacityExhausted(period.to_string()))?;
        next.generated_count = stored.generated_count.max(base.generated_count) + 1;

        let updated = sqlx::query(
            "UPDATE patient_sequences
             SET last_number = ?, last_suffix = ?, generated_count = ?, sequence_position = ?, updated_at = ?
             WHERE tenant_code = ? AND year = ? AND last_number = ? AND last_suffix = ? AND generated_count = ?",
        )
        .bind(i64::from(next.last_number))
        .bind(next.last_suffix.as_str())
        .bind(next.generated_count as i64)
        .bind(next.ordinal() as i64)
        .bind(now)
        .bind(period.tenant())
        .bind(i64::from(period.year()))
        .bind(i64::from(stored.last_number))
        .bind(stored.last_suffix.as_str())
        .bind(stored.generated_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() != 1 {
            return Err(StorageError::Conflict(format!("sequence row for {} changed mid-transaction", period)));
        }

        tx.commit().await.map_err(backend)?;

        debug!(
            tenant = period.tenant(),
            year = period.year(),
            number = next.last_number,
            suffix = %next.last_suffix,
            "Durable allocation committed"
        );
        Ok(next)
    }

    fn row_to_patient(row: &AnyRow) -> Option<PatientRecord> {
        let date_raw = row_string(row, "date_naissance")?;
        let date_naissance = match NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d") {
            Ok(d) => d,
            Err(e) => {
                warn!(date = %date_raw, error = %e, "Skipping patient row with unparseable birth date");
                return None;
            }
        };
        Some(PatientRecord {
            id: row_string(row, "id")?,
            tenant_code: row_string(row, "tenant_code")?,
            patient_code: row_string(row, "patient_code")?,
            nom: row_string(row, "nom")?,
            prenoms: row_string(row, "prenoms")?,
            date_naissance,
            telephone: row_string(row, "telephone"),
        })
    }
}

#[async_trait]
impl SequenceStore for SqlStore {
    async fn load(&self, period: &PeriodKey) -> Result<Option<SequenceState>, StorageError> {
        retry_if("sql_load", &RetryConfig::query(), || async {
            let row = sqlx::query(
                "SELECT last_number, last_suffix, generated_count FROM patient_sequences WHERE tenant_code = ? AND year = ?",
            )
            .bind(period.tenant())
            .bind(i64::from(period.year()))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

            row.map(|r| Self::row_to_state(&r, period)).transpose()
        }, StorageError::is_transient)
        .await
    }

    async fn allocate(
        &self,
        period: &PeriodKey,
        floor: Option<SequenceState>,
    ) -> Result<SequenceState, StorageError> {
        retry_if(
            "sql_allocate",
            &RetryConfig::query(),
            || self.allocate_once(period, floor),
            StorageError::is_transient,
        )
        .await
    }

    async fn record(&self, period: &PeriodKey, state: &SequenceState) -> Result<bool, StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO patient_sequences (tenant_code, year, last_number, last_suffix, generated_count, sequence_position, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_code, year) DO UPDATE SET
                last_number = excluded.last_number,
                last_suffix = excluded.last_suffix,
                generated_count = max(patient_sequences.generated_count, excluded.generated_count),
                sequence_position = excluded.sequence_position,
                updated_at = excluded.updated_at
             WHERE excluded.sequence_position > patient_sequences.sequence_position"
        } else {
            // Columns are assigned left to right: sequence_position must go last
            "INSERT INTO patient_sequences (tenant_code, year, last_number, last_suffix, generated_count, sequence_position, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                last_number = IF(VALUES(sequence_position) > sequence_position, VALUES(last_number), last_number),
                last_suffix = IF(VALUES(sequence_position) > sequence_position, VALUES(last_suffix), last_suffix),
                generated_count = IF(VALUES(sequence_position) > sequence_position, GREATEST(generated_count, VALUES(generated_count)), generated_count),
                updated_at = IF(VALUES(sequence_position) > sequence_position, VALUES(updated_at), updated_at),
                sequence_position = GREATEST(sequence_position, VALUES(sequence_position))"
        };

        let now = Utc::now().timestamp_millis();
        retry_if("sql_record", &RetryConfig::query(), || async {
            let result = sqlx::query(sql)
                .bind(period.tenant())
                .bind(i64::from(period.year()))
                .bind(i64::from(state.last_number))
                .bind(state.last_suffix.as_str())
                .bind(state.generated_count as i64)
                .bind(state.ordinal() as i64)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(result.rows_affected() > 0)
        }, StorageError::is_transient)
        .await
    }

    async fn list_periods(&self, tenant: &str) -> Result<Vec<(i32, SequenceState)>, StorageError> {
        let rows = sqlx::query(
            "SELECT year, last_number, last_suffix, generated_count FROM patient_sequences WHERE tenant_code = ? ORDER BY year DESC",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut periods = Vec::with_capacity(rows.len());
        for row in &rows {
            let year: i64 = row.try_get("year").map_err(backend)?;
            let year = i32::try_from(year).map_err(|_| StorageError::Corruption {
                key: tenant.to_string(),
                value: year.to_string(),
            })?;
            let period = PeriodKey::new(tenant, year).map_err(|e| StorageError::Backend(e.to_string()))?;
            periods.push((year, Self::row_to_state(row, &period)?));
        }
        Ok(periods)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

const PATIENT_COLUMNS: &str =
    "id, tenant_code, patient_code, nom, prenoms, date_naissance, telephone";

/// `field` values in `patient_name_trigrams`
const FIELD_NOM: &str = "n";
const FIELD_PRENOMS: &str = "p";

enum Arg {
    Text(String),
    Int(i64),
}

impl SqlStore {
    /// `SELECT` over patients matching `condition`, scoped to the filter's
    /// tenant.
    fn patient_select(condition: &str, filter: &CandidateFilter, args: &mut Vec<Arg>) -> String {
        let mut sql = format!("SELECT {} FROM patients WHERE ({})", PATIENT_COLUMNS, condition);
        if let Some(ref tenant) = filter.tenant_code {
            sql.push_str(" AND tenant_code = ?");
            args.push(Arg::Text(tenant.clone()));
        }
        sql
    }

    async fn fetch_patients(
        &self,
        sql: &str,
        args: &[Arg],
    ) -> Result<Vec<PatientRecord>, StorageError> {
        let mut query = sqlx::query(sql);
        for arg in args {
            query = match arg {
                Arg::Text(text) => query.bind(text.as_str()),
                Arg::Int(n) => query.bind(*n),
            };
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        Ok(rows.iter().filter_map(Self::row_to_patient).collect())
    }

    async fn phone_matches(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<PatientRecord>, StorageError> {
        let Some(ref digits) = filter.phone_digits else {
            return Ok(Vec::new());
        };
        let mut condition = "telephone_digits = ?".to_string();
        let mut args = vec![Arg::Text(digits.clone())];
        if let Some(ref tail) = filter.phone_tail {
            condition.push_str(" OR telephone_tail = ?");
            args.push(Arg::Text(tail.clone()));
        }
        let sql = Self::patient_select(&condition, filter, &mut args);
        self.fetch_patients(&sql, &args).await
    }

    async fn name_matches(
        &self,
        field: &'static str,
        block: Option<&NameBlock>,
        filter: &CandidateFilter,
    ) -> Result<Vec<PatientRecord>, StorageError> {
        let Some(block) = block.filter(|b| !b.trigrams.is_empty()) else {
            return Ok(Vec::new());
        };
        let condition = format!(
            "id IN (SELECT patient_id FROM patient_name_trigrams \
             WHERE field = ? AND trigram IN ({}) \
             GROUP BY patient_id HAVING COUNT(*) >= ?)",
            vec!["?"; block.trigrams.len()].join(", ")
        );
        let mut args = vec![Arg::Text(field.to_string())];
        args.extend(block.trigrams.iter().map(|t| Arg::Text(t.clone())));
        args.push(Arg::Int(block.min_shared as i64));
        let sql = Self::patient_select(&condition, filter, &mut args);
        self.fetch_patients(&sql, &args).await
    }

    /// Birth-date window, closest dates first.
    async fn date_matches(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<PatientRecord>, StorageError> {
        if filter.date_limit == 0 {
            return Ok(Vec::new());
        }
        let mut args = vec![
            Arg::Text(filter.born_from.format("%Y-%m-%d").to_string()),
            Arg::Text(filter.born_to.format("%Y-%m-%d").to_string()),
        ];
        let mut sql = Self::patient_select("date_naissance BETWEEN ? AND ?", filter, &mut args);
        let distance = if self.is_sqlite {
            "ABS(julianday(date_naissance) - julianday(?))"
        } else {
            "ABS(DATEDIFF(date_naissance, ?))"
        };
        sql.push_str(&format!(" ORDER BY {}, id LIMIT ?", distance));
        args.push(Arg::Text(filter.born_on.format("%Y-%m-%d").to_string()));
        args.push(Arg::Int(filter.date_limit as i64));
        self.fetch_patients(&sql, &args).await
    }
}

#[async_trait]
impl PatientDirectory for SqlStore {
    /// Upsert the row and rebuild its name trigrams in one transaction.
    async fn register_patient(&self, record: &PatientRecord) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO patients (id, tenant_code, patient_code, nom, prenoms, date_naissance,
                                   telephone, telephone_digits, telephone_tail, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                tenant_code = excluded.tenant_code,
                patient_code = excluded.patient_code,
                nom = excluded.nom,
                prenoms = excluded.prenoms,
                date_naissance = excluded.date_naissance,
                telephone = excluded.telephone,
                telephone_digits = excluded.telephone_digits,
                telephone_tail = excluded.telephone_tail"
        } else {
            "INSERT INTO patients (id, tenant_code, patient_code, nom, prenoms, date_naissance,
                                   telephone, telephone_digits, telephone_tail, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                tenant_code = VALUES(tenant_code),
                patient_code = VALUES(patient_code),
                nom = VALUES(nom),
                prenoms = VALUES(prenoms),
                date_naissance = VALUES(date_naissance),
                telephone = VALUES(telephone),
                telephone_digits = VALUES(telephone_digits),
                telephone_tail = VALUES(telephone_tail)"
        };

        let digits = record.telephone.as_deref().map(phone_digits).filter(|d| !d.is_empty());
        let tail = digits.as_deref().and_then(phone_tail).map(str::to_string);
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(sql)
            .bind(&record.id)
            .bind(&record.tenant_code)
            .bind(&record.patient_code)
            .bind(&record.nom)
            .bind(&record.prenoms)
            .bind(record.date_naissance.format("%Y-%m-%d").to_string())
            .bind(&record.telephone)
            .bind(&digits)
            .bind(&tail)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        sqlx::query("DELETE FROM patient_name_trigrams WHERE patient_id = ?")
            .bind(&record.id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let trigrams: Vec<(&str, String)> = trigram_keys(&record.nom)
            .into_iter()
            .map(|t| (FIELD_NOM, t))
            .chain(trigram_keys(&record.prenoms).into_iter().map(|t| (FIELD_PRENOMS, t)))
            .collect();
        if !trigrams.is_empty() {
            let sql = format!(
                "INSERT INTO patient_name_trigrams (patient_id, field, trigram) VALUES {}",
                vec!["(?, ?, ?)"; trigrams.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for (field, trigram) in &trigrams {
                query = query.bind(record.id.as_str()).bind(*field).bind(trigram.as_str());
            }
            query.execute(&mut *tx).await.map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    /// Phone and name matches in full, then the closest birth dates up to
    /// the date limit. Each record appears once.
    async fn find_candidates(&self, filter: &CandidateFilter) -> Result<Vec<PatientRecord>, StorageError> {
        let mut found = self.phone_matches(filter).await?;
        found.extend(self.name_matches(FIELD_NOM, filter.nom.as_ref(), filter).await?);
        found.extend(self.name_matches(FIELD_PRENOMS, filter.prenoms.as_ref(), filter).await?);
        found.extend(self.date_matches(filter).await?);

        let mut seen = HashSet::new();
        found.retain(|p| seen.insert(p.id.clone()));
        Ok(found)
    }
}
