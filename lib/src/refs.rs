// Copyright 2024 The pgit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Named references, the remote sync watermark, and the metadata KV.

use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::Row as _;

use crate::object_id::CommitId;
use crate::store::StoreResult;

/// The distinguished ref naming the current branch head.
pub const HEAD: &str = "HEAD";

/// Metadata key recording the imported working-tree location.
pub const META_REPO_PATH: &str = "repo_path";

/// Sync watermark for one remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncState {
    pub remote_name: String,
    pub last_commit_id: CommitId,
    pub synced_at: DateTime<Utc>,
}

pub struct RefStore {
    pool: PgPool,
}

impl RefStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn set_ref(&self, name: &str, commit_id: &CommitId) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pgit_refs (name, commit_id) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET commit_id = EXCLUDED.commit_id",
        )
        .bind(name)
        .bind(commit_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_ref(&self, name: &str) -> StoreResult<Option<CommitId>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT commit_id FROM pgit_refs WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(CommitId::new))
    }

    pub async fn delete_ref(&self, name: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM pgit_refs WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every ref, `HEAD` included, sorted by name for display.
    pub async fn list_refs(&self) -> StoreResult<Vec<(String, CommitId)>> {
        let rows = sqlx::query("SELECT name, commit_id FROM pgit_refs ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("name")?,
                    CommitId::new(row.try_get("commit_id")?),
                ))
            })
            .collect()
    }

    pub async fn head(&self) -> StoreResult<Option<CommitId>> {
        self.get_ref(HEAD).await
    }

    pub async fn set_head(&self, commit_id: &CommitId) -> StoreResult<()> {
        self.set_ref(HEAD, commit_id).await
    }

    pub async fn set_sync_state(
        &self,
        remote_name: &str,
        last_commit_id: &CommitId,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pgit_sync_state (remote_name, last_commit_id, synced_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (remote_name) DO UPDATE
                 SET last_commit_id = EXCLUDED.last_commit_id,
                     synced_at = EXCLUDED.synced_at",
        )
        .bind(remote_name)
        .bind(last_commit_id.as_str())
        .bind(synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sync_state(&self, remote_name: &str) -> StoreResult<Option<SyncState>> {
        let row = sqlx::query(
            "SELECT remote_name, last_commit_id, synced_at
             FROM pgit_sync_state WHERE remote_name = $1",
        )
        .bind(remote_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(SyncState {
                remote_name: row.try_get("remote_name")?,
                last_commit_id: CommitId::new(row.try_get("last_commit_id")?),
                synced_at: row.try_get("synced_at")?,
            })
        })
        .transpose()
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pgit_metadata (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM pgit_metadata WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }
}
