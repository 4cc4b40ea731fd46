use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CorrelationKey, Result, Revision, SagaId, SagaInstance, StoreError, store::SagaStore,
};

const SELECT_COLUMNS: &str = "SELECT id, saga_type, correlation_property, correlation_value, revision, payload, created_at, updated_at FROM saga_data";

/// PostgreSQL-backed saga store.
///
/// Updates are conditional on the loaded revision and inserts are guarded
/// by a unique constraint on the creation key, so a writer that bypassed the
/// saga lock gets a `ConcurrencyConflict` instead of a lost update.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let correlation = CorrelationKey::new(
            row.try_get::<String, _>("saga_type")?,
            row.try_get::<String, _>("correlation_property")?,
            row.try_get::<String, _>("correlation_value")?,
        );

        Ok(SagaInstance::restore(
            SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            correlation,
            Revision::new(row.try_get("revision")?),
            row.try_get("payload")?,
            row.try_get("created_at")?,
            row.try_get("updated_at")?,
        ))
    }

    async fn current_revision(&self, id: SagaId) -> Result<Revision> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM saga_data WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(Revision::new(revision.unwrap_or(0)))
    }

    fn conflict(instance: &SagaInstance, actual: Revision) -> StoreError {
        metrics::counter!("saga_store_conflicts_total").increment(1);
        StoreError::ConcurrencyConflict {
            saga_id: instance.id(),
            key: instance.correlation().clone(),
            expected: instance.revision(),
            actual,
        }
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn find(&self, key: &CorrelationKey) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(&format!(
            r#"
            {SELECT_COLUMNS}
            WHERE saga_type = $1
              AND correlation_property = $2
              AND correlation_value = $3
            LIMIT 1
            "#
        ))
        .bind(key.saga_type())
        .bind(key.property())
        .bind(key.value())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_instance).transpose()
    }

    #[tracing::instrument(skip(self, instance), fields(saga_id = %instance.id(), revision = %instance.revision()))]
    async fn save(&self, instance: &mut SagaInstance) -> Result<Revision> {
        let next = instance.revision().next();
        let now = Utc::now();

        let this: &SagaInstance = instance;
        if this.is_new() {
            let correlation = this.correlation();
            let inserted = sqlx::query(
                r#"
                INSERT INTO saga_data (id, saga_type, correlation_property, correlation_value, revision, payload, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(this.id().as_uuid())
            .bind(correlation.saga_type())
            .bind(correlation.property())
            .bind(correlation.value())
            .bind(next.as_i64())
            .bind(this.payload())
            .bind(this.created_at())
            .bind(now)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {}
                // Someone created the saga for this key first
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    let actual: Option<i64> = sqlx::query_scalar(
                        r#"
                        SELECT revision FROM saga_data
                        WHERE saga_type = $1 AND correlation_property = $2 AND correlation_value = $3
                        "#,
                    )
                    .bind(correlation.saga_type())
                    .bind(correlation.property())
                    .bind(correlation.value())
                    .fetch_optional(&self.pool)
                    .await?;
                    return Err(Self::conflict(this, Revision::new(actual.unwrap_or(0))));
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let result = sqlx::query(
                r#"
                UPDATE saga_data
                SET revision = $1, payload = $2, updated_at = $3
                WHERE id = $4 AND revision = $5
                "#,
            )
            .bind(next.as_i64())
            .bind(this.payload())
            .bind(now)
            .bind(this.id().as_uuid())
            .bind(this.revision().as_i64())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let actual = self.current_revision(this.id()).await?;
                return Err(Self::conflict(this, actual));
            }
        }

        instance.mark_persisted(next, now);
        Ok(next)
    }

    async fn get(&self, id: SagaId) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM saga_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
