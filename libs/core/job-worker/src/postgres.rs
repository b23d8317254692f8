//! PostgreSQL job sink
//!
//! One row per job id in the `jobs` table. Each write runs in its own
//! transaction with `ON CONFLICT (job_id) DO NOTHING`, so a redelivered job
//! is reported as a duplicate instead of stored twice.

use crate::error::SinkError;
use crate::message::Job;
use crate::sink::{JobSink, WriteOutcome};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait,
    TransactionTrait,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sea-ORM entity for the jobs table
pub mod entity {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "jobs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
        pub job_id: String,
        #[sea_orm(column_type = "JsonBinary")]
        pub payload: Json,
        pub received_at: DateTimeWithTimeZone,
        pub stored_at: DateTimeWithTimeZone,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id      TEXT PRIMARY KEY,
    payload     JSONB NOT NULL,
    received_at TIMESTAMPTZ NOT NULL,
    stored_at   TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Error text that marks a database failure as worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "deadlock detected",
    "could not serialize access",
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "timed out",
    "terminating connection",
    "too many connections",
    "the database system is starting up",
    "the database system is shutting down",
    "error communicating with database",
];

/// Connect to PostgreSQL with a pool sized for a sequential worker
pub async fn connect_postgres(
    database_url: &str,
    connect_timeout: Duration,
) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(database_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(connect_timeout)
        .acquire_timeout(connect_timeout)
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Connected to PostgreSQL");
    Ok(db)
}

/// Map a database error onto the retry/dead-letter split
pub fn classify_db_error(err: DbErr) -> SinkError {
    let message = err.to_string();
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => SinkError::Transient(message),
        _ if is_transient_message(&message) => SinkError::Transient(message),
        _ => SinkError::Fatal(message),
    }
}

fn is_transient_message(message: &str) -> bool {
    let message = message.to_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

pub struct PgSink {
    db: DatabaseConnection,
    write_timeout: Duration,
}

impl PgSink {
    pub fn new(db: DatabaseConnection, write_timeout: Duration) -> Self {
        Self { db, write_timeout }
    }

    /// Connect and wrap the pool; connection failures are transient
    pub async fn connect(database_url: &str, write_timeout: Duration) -> Result<Self, SinkError> {
        let db = connect_postgres(database_url, write_timeout)
            .await
            .map_err(classify_db_error)?;
        Ok(Self::new(db, write_timeout))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create the jobs table if it does not exist
    pub async fn ensure_schema(&self) -> Result<(), SinkError> {
        self.db
            .execute_unprepared(CREATE_JOBS_TABLE)
            .await
            .map_err(classify_db_error)?;

        debug!("Jobs table ready");
        Ok(())
    }

    /// Close the pool
    pub async fn close(self) {
        if let Err(e) = self.db.close().await {
            warn!(error = %e, "Error closing PostgreSQL pool");
        }
    }

    async fn insert(&self, job: &Job) -> Result<WriteOutcome, SinkError> {
        let model = entity::ActiveModel {
            job_id: Set(job.id().to_string()),
            payload: Set(job.payload().clone()),
            received_at: Set(job.received_at().into()),
            stored_at: Set(Utc::now().into()),
        };

        let txn = self.db.begin().await.map_err(classify_db_error)?;

        let rows = entity::Entity::insert(model)
            .on_conflict(
                OnConflict::column(entity::Column::JobId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await
            .map_err(classify_db_error)?;

        txn.commit().await.map_err(classify_db_error)?;

        Ok(if rows == 0 {
            WriteOutcome::Duplicate
        } else {
            WriteOutcome::Inserted
        })
    }
}

#[async_trait]
impl JobSink for PgSink {
    async fn write(&self, job: &Job) -> Result<WriteOutcome, SinkError> {
        match tokio::time::timeout(self.write_timeout, self.insert(job)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Transient(format!(
                "write timed out after {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }
}
