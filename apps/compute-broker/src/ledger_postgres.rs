use async_trait::async_trait;
use broker_sdk::ledger::{Ledger, LedgerError};
use broker_sdk::model::Grant;
use sea_query::{Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::{PgPool, Row};

/// Grants in `allocation`, one row per agent. Deletes move the row into
/// `allocation_audit` inside one transaction.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let pool = PgPool::connect(url).await.map_err(unavailable)?;
        sqlx::migrate!().run(&pool).await.map_err(unavailable)?;
        Ok(Self { pool })
    }
}

fn unavailable(err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

fn decode(agent_id: &str, details: &str) -> Result<Grant, LedgerError> {
    serde_json::from_str(details).map_err(|e| LedgerError::Corrupt {
        agent_id: agent_id.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn put(&self, grant: Grant) -> Result<(), LedgerError> {
        let details = serde_json::to_string(&grant).map_err(unavailable)?;
        let (sql, values) = Query::insert()
            .into_table(Allocation::Table)
            .columns([
                Allocation::Id,
                Allocation::AgentId,
                Allocation::Details,
                Allocation::CreatedAt,
            ])
            .values_panic([
                grant.lease_uuid.to_string().into(),
                grant.agent_id.clone().into(),
                details.into(),
                grant.created_at.into(),
            ])
            .on_conflict(
                OnConflict::column(Allocation::AgentId)
                    .update_columns([
                        Allocation::Id,
                        Allocation::Details,
                        Allocation::CreatedAt,
                    ])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError> {
        let (sql, values) = Query::select()
            .column(Allocation::Details)
            .from(Allocation::Table)
            .and_where(Expr::col(Allocation::AgentId).eq(agent_id))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.map(|r| decode(agent_id, &r.get::<String, _>("details")))
            .transpose()
    }

    async fn delete(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let (sql, values) = Query::delete()
            .from_table(Allocation::Table)
            .and_where(Expr::col(Allocation::AgentId).eq(agent_id))
            .returning(Query::returning().columns([Allocation::Id, Allocation::Details]))
            .build_sqlx(PostgresQueryBuilder);
        let removed = sqlx::query_with(&sql, values)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;
        let Some(row) = removed else {
            tx.commit().await.map_err(unavailable)?;
            return Ok(None);
        };
        let id: String = row.get("id");
        let details: String = row.get("details");
        let grant = decode(agent_id, &details)?.released();
        let audit = serde_json::to_string(&grant).map_err(unavailable)?;
        let (sql, values) = Query::insert()
            .into_table(AllocationAudit::Table)
            .columns([
                AllocationAudit::Id,
                AllocationAudit::AgentId,
                AllocationAudit::Details,
            ])
            .values_panic([id.into(), agent_id.into(), audit.into()])
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;
        Ok(Some(grant))
    }

    async fn list(&self) -> Result<Vec<Grant>, LedgerError> {
        let (sql, values) = Query::select()
            .columns([Allocation::AgentId, Allocation::Details])
            .from(Allocation::Table)
            .order_by(Allocation::AgentId, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.into_iter()
            .map(|r| {
                let agent_id: String = r.get("agent_id");
                let details: String = r.get("details");
                decode(&agent_id, &details)
            })
            .collect()
    }
}

#[derive(Iden)]
enum Allocation {
    Table,
    Id,
    AgentId,
    Details,
    CreatedAt,
}

#[derive(Iden)]
enum AllocationAudit {
    Table,
    Id,
    AgentId,
    Details,
}
