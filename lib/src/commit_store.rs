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

//! The commit store. Commits live in a patch-am chain ordered by
//! `authored_at`; because the time-token primary key sorts chronologically,
//! a log query is a reverse range scan over the delta segment rather than a
//! recursive walk of `parent_id` links.

use chrono::DateTime;
use chrono::Utc;
use sqlx::PgConnection;
use sqlx::PgPool;
use sqlx::Row as _;
use sqlx::postgres::PgRow;

use crate::copy::CopyBuffer;
use crate::object_id::CommitId;
use crate::store::StoreResult;

/// Author or committer identity with its timestamp.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub at: DateTime<Utc>,
}

/// One row of `pgit_commits`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub parent_id: Option<CommitId>,
    /// Content-addressed digest of the full tree at this commit.
    pub tree_hash: Option<String>,
    pub message: String,
    pub author: Signature,
    pub committer: Signature,
}

const COMMIT_COLUMNS: &str = "id, parent_id, tree_hash, message, author_name, author_email, \
                              authored_at, committer_name, committer_email, committed_at";

pub struct CommitStore {
    pool: PgPool,
}

impl CommitStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, commit: &CommitRecord) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO pgit_commits ({COMMIT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(commit.id.as_str())
        .bind(commit.parent_id.as_ref().map(CommitId::as_str))
        .bind(commit.tree_hash.as_deref())
        .bind(&commit.message)
        .bind(&commit.author.name)
        .bind(&commit.author.email)
        .bind(commit.author.at)
        .bind(&commit.committer.name)
        .bind(&commit.committer.email)
        .bind(commit.committer.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &CommitId) -> StoreResult<Option<CommitRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COMMIT_COLUMNS} FROM pgit_commits WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| commit_from_row(&row)).transpose()
    }

    pub async fn exists(&self, id: &CommitId) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pgit_commits WHERE id = $1)")
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// The log ending at `head`, newest first. A reverse range scan on the
    /// token primary key; maps to one sequential pass over the delta
    /// segment.
    pub async fn log(&self, head: &CommitId, limit: Option<usize>) -> StoreResult<Vec<CommitRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMIT_COLUMNS} FROM pgit_commits
             WHERE id <= $1
             ORDER BY id DESC
             LIMIT $2"
        ))
        .bind(head.as_str())
        .bind(limit.map_or(i64::MAX, |l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(commit_from_row).collect()
    }

    /// The newest commit by token order, if any.
    pub async fn latest(&self) -> StoreResult<Option<CommitRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COMMIT_COLUMNS} FROM pgit_commits ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| commit_from_row(&row)).transpose()
    }

    /// The ids of every commit at or above `from` in token order.
    pub async fn ids_from(&self, from: &CommitId) -> StoreResult<Vec<CommitId>> {
        let rows = sqlx::query("SELECT id FROM pgit_commits WHERE id >= $1 ORDER BY id")
            .bind(from.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(CommitId::new(row.try_get("id")?)))
            .collect()
    }

    /// Deletes every commit with `id >= from`, cascading to the matching
    /// commit-graph rows. Used by branch-history rebuild; the caller
    /// refreshes the chain statistics afterwards.
    pub async fn truncate_from(&self, from: &CommitId) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pgit_commit_graph WHERE id >= $1")
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM pgit_commits WHERE id >= $1")
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}

/// Appends one commit to a COPY buffer, columns in `COMMIT_COLUMNS` order.
pub(crate) fn encode_copy_row(commit: &CommitRecord, buf: &mut CopyBuffer) {
    buf.text(commit.id.as_str());
    buf.opt_text(commit.parent_id.as_ref().map(CommitId::as_str));
    buf.opt_text(commit.tree_hash.as_deref());
    buf.text(&commit.message);
    buf.text(&commit.author.name);
    buf.text(&commit.author.email);
    buf.timestamptz(commit.author.at);
    buf.text(&commit.committer.name);
    buf.text(&commit.committer.email);
    buf.timestamptz(commit.committer.at);
    buf.end_row();
}

/// Streams a prepared COPY buffer into `pgit_commits`.
pub(crate) async fn copy_rows(conn: &mut PgConnection, buf: &CopyBuffer) -> StoreResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut sink = conn
        .copy_in_raw(&format!(
            "COPY pgit_commits ({COMMIT_COLUMNS}) FROM STDIN WITH (FORMAT text)"
        ))
        .await?;
    sink.send(buf.as_bytes()).await?;
    sink.finish().await?;
    Ok(())
}

pub(crate) fn commit_from_row(row: &PgRow) -> StoreResult<CommitRecord> {
    let parent: Option<String> = row.try_get("parent_id")?;
    Ok(CommitRecord {
        id: CommitId::new(row.try_get("id")?),
        parent_id: parent.map(CommitId::new),
        tree_hash: row.try_get("tree_hash")?,
        message: row.try_get("message")?,
        author: Signature {
            name: row.try_get("author_name")?,
            email: row.try_get("author_email")?,
            at: row.try_get("authored_at")?,
        },
        committer: Signature {
            name: row.try_get("committer_name")?,
            email: row.try_get("committer_email")?,
            at: row.try_get("committed_at")?,
        },
    })
}
