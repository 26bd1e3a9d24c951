use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use super::HandoffLedger;

#[derive(Clone)]
pub struct PgHandoffLedger {
    pool: PgPool,
}

impl PgHandoffLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HandoffLedger for PgHandoffLedger {
    /// jti を使用済みとして記録
    ///
    /// # Note
    /// 主キー衝突時は何もしない（= 既に使用済み）
    async fn consume(
        &self,
        jti: &str,
        app_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO handoff_redemptions (jti, app_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (jti) DO NOTHING
            "#,
        )
        .bind(jti)
        .bind(app_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM handoff_redemptions
            WHERE expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
