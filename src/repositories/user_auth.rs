use async_trait::async_trait;
use sqlx::PgPool;

use super::UserAuthStore;
use crate::models::{ResetScope, UserAuthRecord};

#[derive(Clone)]
pub struct PgUserAuthStore {
    pool: PgPool,
}

impl PgUserAuthStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserAuthStore for PgUserAuthStore {
    async fn find(
        &self,
        app_id: &str,
        user_id: &str,
    ) -> Result<Option<UserAuthRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserAuthRecord>(
            r#"
            SELECT id, app_id, user_id, totp_secret_encrypted, is_totp_enabled,
                   channel_account_id, is_channel_enabled, channel_bind_nonce,
                   created_at, updated_at
            FROM user_auth_records
            WHERE app_id = $1 AND user_id = $2
            "#,
        )
        .bind(app_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_by_app(&self, app_id: &str) -> Result<Vec<UserAuthRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserAuthRecord>(
            r#"
            SELECT id, app_id, user_id, totp_secret_encrypted, is_totp_enabled,
                   channel_account_id, is_channel_enabled, channel_bind_nonce,
                   created_at, updated_at
            FROM user_auth_records
            WHERE app_id = $1
            ORDER BY id
            "#,
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await
    }

    /// 未確定シークレットを保存
    ///
    /// # Note
    /// 確定済みレコードには ON CONFLICT の WHERE が一致せず、行が返らない
    async fn store_pending_secret(
        &self,
        app_id: &str,
        user_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<Option<UserAuthRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserAuthRecord>(
            r#"
            INSERT INTO user_auth_records (app_id, user_id, totp_secret_encrypted)
            VALUES ($1, $2, $3)
            ON CONFLICT (app_id, user_id) DO UPDATE
            SET totp_secret_encrypted = EXCLUDED.totp_secret_encrypted, updated_at = NOW()
            WHERE user_auth_records.is_totp_enabled = FALSE
            RETURNING id, app_id, user_id, totp_secret_encrypted, is_totp_enabled,
                      channel_account_id, is_channel_enabled, channel_bind_nonce,
                      created_at, updated_at
            "#,
        )
        .bind(app_id)
        .bind(user_id)
        .bind(secret_encrypted)
        .fetch_optional(&self.pool)
        .await
    }

    async fn confirm_totp(
        &self,
        app_id: &str,
        user_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_auth_records
            SET is_totp_enabled = TRUE, updated_at = NOW()
            WHERE app_id = $1 AND user_id = $2
              AND totp_secret_encrypted = $3
              AND is_totp_enabled = FALSE
            "#,
        )
        .bind(app_id)
        .bind(user_id)
        .bind(secret_encrypted)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn begin_channel_bind(
        &self,
        app_id: &str,
        user_id: &str,
        nonce: &str,
    ) -> Result<UserAuthRecord, sqlx::Error> {
        sqlx::query_as::<_, UserAuthRecord>(
            r#"
            INSERT INTO user_auth_records (app_id, user_id, channel_bind_nonce)
            VALUES ($1, $2, $3)
            ON CONFLICT (app_id, user_id) DO UPDATE
            SET channel_bind_nonce = EXCLUDED.channel_bind_nonce, updated_at = NOW()
            RETURNING id, app_id, user_id, totp_secret_encrypted, is_totp_enabled,
                      channel_account_id, is_channel_enabled, channel_bind_nonce,
                      created_at, updated_at
            "#,
        )
        .bind(app_id)
        .bind(user_id)
        .bind(nonce)
        .fetch_one(&self.pool)
        .await
    }

    async fn complete_channel_bind(
        &self,
        app_id: &str,
        user_id: &str,
        nonce: &str,
        account_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_auth_records
            SET channel_account_id = $4,
                is_channel_enabled = TRUE,
                channel_bind_nonce = NULL,
                updated_at = NOW()
            WHERE app_id = $1 AND user_id = $2
              AND channel_bind_nonce = $3
              AND (is_channel_enabled = FALSE OR channel_account_id = $4)
            "#,
        )
        .bind(app_id)
        .bind(user_id)
        .bind(nonce)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset(
        &self,
        app_id: &str,
        user_id: &str,
        scope: ResetScope,
    ) -> Result<Option<UserAuthRecord>, sqlx::Error> {
        let assignments = match scope {
            ResetScope::All => {
                "totp_secret_encrypted = NULL, is_totp_enabled = FALSE, \
                 channel_account_id = NULL, is_channel_enabled = FALSE, channel_bind_nonce = NULL"
            }
            ResetScope::Totp => "totp_secret_encrypted = NULL, is_totp_enabled = FALSE",
            ResetScope::Channel => {
                "channel_account_id = NULL, is_channel_enabled = FALSE, channel_bind_nonce = NULL"
            }
        };

        let sql = format!(
            r#"
            UPDATE user_auth_records
            SET {assignments}, updated_at = NOW()
            WHERE app_id = $1 AND user_id = $2
            RETURNING id, app_id, user_id, totp_secret_encrypted, is_totp_enabled,
                      channel_account_id, is_channel_enabled, channel_bind_nonce,
                      created_at, updated_at
            "#
        );

        sqlx::query_as::<_, UserAuthRecord>(&sql)
            .bind(app_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }
}
