//! インメモリストア（開発・テスト用）
//!
//! 各ストアは単一の Mutex で保護し、条件付き更新をロック内で完結させる。
//! PostgreSQL 実装の単一ステートメント更新と同じ原子性を持つ。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    ApplicationPatch, ApplicationStore, ApprovalStore, HandoffLedger, NewApplication, NewApproval,
    UserAuthStore,
};
use crate::models::{Application, ApprovalStatus, ChannelApproval, ResetScope, UserAuthRecord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Application
// ============================================================================

#[derive(Default)]
pub struct InMemoryApplicationStore {
    inner: Mutex<Vec<Application>>,
}

#[async_trait]
impl ApplicationStore for InMemoryApplicationStore {
    async fn insert(&self, new: NewApplication) -> Result<Application, sqlx::Error> {
        let mut apps = lock(&self.inner);
        if apps.iter().any(|a| a.app_id == new.app_id) {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate app_id: {}",
                new.app_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let app = Application {
            id: apps.len() as i64 + 1,
            name: new.name,
            description: new.description,
            app_id: new.app_id,
            secret_encrypted: new.secret_encrypted,
            callback_url: new.callback_url,
            created_at: now,
            updated_at: now,
        };
        apps.push(app.clone());
        Ok(app)
    }

    async fn find_by_app_id(&self, app_id: &str) -> Result<Option<Application>, sqlx::Error> {
        Ok(lock(&self.inner)
            .iter()
            .find(|a| a.app_id == app_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Application>, sqlx::Error> {
        Ok(lock(&self.inner).clone())
    }

    async fn update(
        &self,
        app_id: &str,
        patch: &ApplicationPatch,
    ) -> Result<Option<Application>, sqlx::Error> {
        let mut apps = lock(&self.inner);
        let Some(app) = apps.iter_mut().find(|a| a.app_id == app_id) else {
            return Ok(None);
        };

        if let Some(name) = &patch.name {
            app.name = name.clone();
        }
        if let Some(description) = &patch.description {
            app.description = description.clone();
        }
        if let Some(callback_url) = &patch.callback_url {
            app.callback_url = Some(callback_url.clone());
        }
        app.updated_at = OffsetDateTime::now_utc();

        Ok(Some(app.clone()))
    }

    async fn update_secret(
        &self,
        app_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<Option<Application>, sqlx::Error> {
        let mut apps = lock(&self.inner);
        let Some(app) = apps.iter_mut().find(|a| a.app_id == app_id) else {
            return Ok(None);
        };

        app.secret_encrypted = secret_encrypted.to_vec();
        app.updated_at = OffsetDateTime::now_utc();

        Ok(Some(app.clone()))
    }
}

// ============================================================================
// UserAuthRecord
// ============================================================================

#[derive(Default)]
pub struct InMemoryUserAuthStore {
    inner: Mutex<RecordTable>,
}

#[derive(Default)]
struct RecordTable {
    next_id: i64,
    rows: HashMap<(String, String), UserAuthRecord>,
}

impl RecordTable {
    fn get_or_create(&mut self, app_id: &str, user_id: &str) -> &mut UserAuthRecord {
        let next_id = &mut self.next_id;
        self.rows
            .entry((app_id.to_string(), user_id.to_string()))
            .or_insert_with(|| {
                *next_id += 1;
                let now = OffsetDateTime::now_utc();
                UserAuthRecord {
                    id: *next_id,
                    app_id: app_id.to_string(),
                    user_id: user_id.to_string(),
                    totp_secret_encrypted: None,
                    is_totp_enabled: false,
                    channel_account_id: None,
                    is_channel_enabled: false,
                    channel_bind_nonce: None,
                    created_at: now,
                    updated_at: now,
                }
            })
    }

    fn get_mut(&mut self, app_id: &str, user_id: &str) -> Option<&mut UserAuthRecord> {
        self.rows
            .get_mut(&(app_id.to_string(), user_id.to_string()))
    }
}

#[async_trait]
impl UserAuthStore for InMemoryUserAuthStore {
    async fn find(
        &self,
        app_id: &str,
        user_id: &str,
    ) -> Result<Option<UserAuthRecord>, sqlx::Error> {
        Ok(lock(&self.inner)
            .rows
            .get(&(app_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn list_by_app(&self, app_id: &str) -> Result<Vec<UserAuthRecord>, sqlx::Error> {
        let table = lock(&self.inner);
        let mut records: Vec<_> = table
            .rows
            .values()
            .filter(|r| r.app_id == app_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn store_pending_secret(
        &self,
        app_id: &str,
        user_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<Option<UserAuthRecord>, sqlx::Error> {
        let mut table = lock(&self.inner);
        let record = table.get_or_create(app_id, user_id);
        if record.is_totp_enabled {
            return Ok(None);
        }

        record.totp_secret_encrypted = Some(secret_encrypted.to_vec());
        record.updated_at = OffsetDateTime::now_utc();
        Ok(Some(record.clone()))
    }

    async fn confirm_totp(
        &self,
        app_id: &str,
        user_id: &str,
        secret_encrypted: &[u8],
    ) -> Result<bool, sqlx::Error> {
        let mut table = lock(&self.inner);
        let Some(record) = table.get_mut(app_id, user_id) else {
            return Ok(false);
        };

        if record.is_totp_enabled
            || record.totp_secret_encrypted.as_deref() != Some(secret_encrypted)
        {
            return Ok(false);
        }

        record.is_totp_enabled = true;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn begin_channel_bind(
        &self,
        app_id: &str,
        user_id: &str,
        nonce: &str,
    ) -> Result<UserAuthRecord, sqlx::Error> {
        let mut table = lock(&self.inner);
        let record = table.get_or_create(app_id, user_id);
        record.channel_bind_nonce = Some(nonce.to_string());
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn complete_channel_bind(
        &self,
        app_id: &str,
        user_id: &str,
        nonce: &str,
        account_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut table = lock(&self.inner);
        let Some(record) = table.get_mut(app_id, user_id) else {
            return Ok(false);
        };

        let nonce_matches = record.channel_bind_nonce.as_deref() == Some(nonce);
        let account_allowed = !record.is_channel_enabled
            || record.channel_account_id.as_deref() == Some(account_id);
        if !nonce_matches || !account_allowed {
            return Ok(false);
        }

        record.channel_account_id = Some(account_id.to_string());
        record.is_channel_enabled = true;
        record.channel_bind_nonce = None;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn reset(
        &self,
        app_id: &str,
        user_id: &str,
        scope: ResetScope,
    ) -> Result<Option<UserAuthRecord>, sqlx::Error> {
        let mut table = lock(&self.inner);
        let Some(record) = table.get_mut(app_id, user_id) else {
            return Ok(None);
        };

        if matches!(scope, ResetScope::All | ResetScope::Totp) {
            record.totp_secret_encrypted = None;
            record.is_totp_enabled = false;
        }
        if matches!(scope, ResetScope::All | ResetScope::Channel) {
            record.channel_account_id = None;
            record.is_channel_enabled = false;
            record.channel_bind_nonce = None;
        }
        record.updated_at = OffsetDateTime::now_utc();

        Ok(Some(record.clone()))
    }
}

// ============================================================================
// ChannelApproval
// ============================================================================

#[derive(Default)]
pub struct InMemoryApprovalStore {
    inner: Mutex<HashMap<Uuid, ChannelApproval>>,
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn create(&self, new: NewApproval) -> Result<ChannelApproval, sqlx::Error> {
        let approval = ChannelApproval {
            id: new.id,
            app_id: new.app_id,
            user_id: new.user_id,
            token_hash: new.token_hash,
            status: ApprovalStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            expires_at: new.expires_at,
            decided_at: None,
        };
        lock(&self.inner).insert(approval.id, approval.clone());
        Ok(approval)
    }

    async fn find(&self, id: Uuid) -> Result<Option<ChannelApproval>, sqlx::Error> {
        Ok(lock(&self.inner).get(&id).cloned())
    }

    async fn decide(
        &self,
        id: Uuid,
        token_hash: &str,
        status: ApprovalStatus,
    ) -> Result<bool, sqlx::Error> {
        let mut approvals = lock(&self.inner);
        let Some(approval) = approvals.get_mut(&id) else {
            return Ok(false);
        };

        let now = OffsetDateTime::now_utc();
        if approval.token_hash != token_hash
            || approval.status != ApprovalStatus::Pending
            || approval.is_expired_at(now)
        {
            return Ok(false);
        }

        approval.status = status;
        approval.decided_at = Some(now);
        Ok(true)
    }

    async fn consume(&self, id: Uuid, app_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        let mut approvals = lock(&self.inner);
        let Some(approval) = approvals.get_mut(&id) else {
            return Ok(false);
        };

        if approval.app_id != app_id
            || approval.user_id != user_id
            || approval.status != ApprovalStatus::Approved
            || approval.is_expired_at(OffsetDateTime::now_utc())
        {
            return Ok(false);
        }

        approval.status = ApprovalStatus::Consumed;
        Ok(true)
    }

    async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let mut approvals = lock(&self.inner);
        let before = approvals.len();
        approvals.retain(|_, a| !a.is_expired_at(now));
        Ok((before - approvals.len()) as u64)
    }
}

// ============================================================================
// HandoffLedger
// ============================================================================

#[derive(Default)]
pub struct InMemoryHandoffLedger {
    inner: Mutex<HashMap<String, OffsetDateTime>>,
}

#[async_trait]
impl HandoffLedger for InMemoryHandoffLedger {
    async fn consume(
        &self,
        jti: &str,
        _app_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        let mut consumed = lock(&self.inner);
        if consumed.contains_key(jti) {
            return Ok(false);
        }
        consumed.insert(jti.to_string(), expires_at);
        Ok(true)
    }

    async fn delete_expired(&self) -> Result<u64, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let mut consumed = lock(&self.inner);
        let before = consumed.len();
        consumed.retain(|_, expires_at| *expires_at >= now);
        Ok((before - consumed.len()) as u64)
    }
}
