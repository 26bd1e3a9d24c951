use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ApprovalStore, NewApproval};
use crate::models::{ApprovalStatus, ChannelApproval};

#[derive(Clone)]
pub struct PgApprovalStore {
    pool: PgPool,
}

impl PgApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn create(&self, new: NewApproval) -> Result<ChannelApproval, sqlx::Error> {
        sqlx::query_as::<_, ChannelApproval>(
            r#"
            INSERT INTO channel_approvals (id, app_id, user_id, token_hash, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, app_id, user_id, token_hash, status, created_at, expires_at, decided_at
            "#,
        )
        .bind(new.id)
        .bind(&new.app_id)
        .bind(&new.user_id)
        .bind(&new.token_hash)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
    }

    async fn find(&self, id: Uuid) -> Result<Option<ChannelApproval>, sqlx::Error> {
        sqlx::query_as::<_, ChannelApproval>(
            r#"
            SELECT id, app_id, user_id, token_hash, status, created_at, expires_at, decided_at
            FROM channel_approvals
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn decide(
        &self,
        id: Uuid,
        token_hash: &str,
        status: ApprovalStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE channel_approvals
            SET status = $3, decided_at = NOW()
            WHERE id = $1 AND token_hash = $2
              AND status = 'pending'
              AND expires_at > NOW()
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// # Returns
    /// 削除された行数
    async fn consume(&self, id: Uuid, app_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE channel_approvals
            SET status = 'consumed'
            WHERE id = $1 AND app_id = $2 AND user_id = $3
              AND status = 'approved'
              AND expires_at > NOW()
            "#,
        )
        .bind(id)
        .bind(app_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM channel_approvals
            WHERE expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
