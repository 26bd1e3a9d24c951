use async_trait::async_trait;
use sqlx::PgPool;

use super::{ApplicationPatch, ApplicationStore, NewApplication};
use crate::models::Application;

#[derive(Clone)]
pub struct PgApplicationStore {
    pool: PgPool,
}

impl PgApplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApplicationStore for PgApplicationStore {
    /// 新しいアプリケーションを作成
    async fn insert(&self, new: NewApplication) -> Result<Application, sqlx::Error> {
        sqlx::query_as::<_, Application>(
            r#"
            INSERT INTO applications (name, description, app_id, secret_encrypted, callback_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, description, app_id, secret_encrypted, callback_url,
                      created_at, updated_at
            "#,
        )
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.app_id)
        .bind(&new.secret_encrypted)
        .bind(&new.callback_url)
        .fetch_one(&self.pool)
        .await
    }

    /// app_id でアプリケーションを検索
    async fn find_by_app_id(&self, app_id: &str) -> Result<Option<Application>, sqlx::Error> {
        sqlx::query_as::<_, Application>(
            r#"
            SELECT id, name, description, app_id, secret_encrypted, callback_url,
                   created_at, updated_at
            FROM applications
            WHERE app_id = $1
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list(&self) -> Result<Vec<Application>, sqlx::Error> {
        sqlx::query_as::<_, Application>(
            r#"
            SELECT id, name, description, app_id, secret_encrypted, callback_url,
                   created_at, updated_at
            FROM applications
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// 可変フィールドを更新
    ///
    /// # Note
    /// NULL のパラメータは既存値を維持（COALESCE）
    async fn update(
        &self,
        app_id: &str,
        patch: &ApplicationPatch,
    ) -> Result<Option<Application>, sqlx::Error> {
        sqlx::query_as::<_, Application>(
            r#"
            UPDATE applications
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                callback_url = COALESCE($4, callback_url),
                updated_at = NOW()
            WHERE app_id = $1
            RETURNING id, name, description, app_id, secret_encrypted, callback_url,
                      created_at, updated_at
            "#,
        )
        .bind(app_id)
        .bind(&patch.name)
        .bind(&patch.description)
        .bind(&patch.callback_url)
        .fetch_optional(&self.pool)
        .await
    }

    async fn update_secret(
        &self,
        app_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<Option<Application>, sqlx::Error> {
        sqlx::query_as::<_, Application>(
            r#"
            UPDATE applications
            SET secret_encrypted = $2, updated_at = NOW()
            WHERE app_id = $1
            RETURNING id, name, description, app_id, secret_encrypted, callback_url,
                      created_at, updated_at
            "#,
        )
        .bind(app_id)
        .bind(secret_encrypted)
        .fetch_optional(&self.pool)
        .await
    }
}
