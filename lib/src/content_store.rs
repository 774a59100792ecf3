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

//! The content store: one delta chain per group, split across a text and a
//! binary table of identical shape.
//!
//! The cheapest access pattern is a full-group scan in ascending
//! `version_id` (front-to-back through the chain); point reads reconstruct
//! from the nearest keyframe. Batch reads therefore try to touch each chain
//! once, linearly.

use std::collections::HashMap;

use futures::StreamExt as _;
use futures::stream;
use sqlx::PgConnection;
use sqlx::PgPool;
use sqlx::Row as _;
use tracing::debug;

use crate::copy::CopyBuffer;
use crate::object_id::GroupId;
use crate::object_id::VersionId;
use crate::store::StoreResult;

/// Above this many distinct groups, a batch read switches from one combined
/// array-join query to one query per group issued in parallel, letting the
/// access method stream each chain linearly.
const COMBINED_QUERY_MAX_GROUPS: usize = 4;

/// Concurrent per-group queries during a split batch read.
const PARALLEL_GROUP_READS: usize = 8;

/// Which of the two content tables a payload belongs to. Mirrors the
/// `is_binary` bit of the owning file-ref; every read and write branches on
/// it exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Text,
    Binary,
}

impl ContentKind {
    pub fn from_is_binary(is_binary: bool) -> Self {
        if is_binary { Self::Binary } else { Self::Text }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Text => "pgit_text_content",
            Self::Binary => "pgit_binary_content",
        }
    }
}

/// Address of one content row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub kind: ContentKind,
    pub group_id: GroupId,
    pub version_id: VersionId,
}

/// Interprets bytes as UTF-8, falling back to Latin-1 (one byte, one
/// codepoint) when they do not decode. Mojibake files therefore survive
/// ingestion but do not round-trip byte-for-byte; their re-encoded UTF-8
/// form is what the text chain stores.
pub fn coerce_utf8(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

pub struct ContentStore {
    pool: PgPool,
}

impl ContentStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts one content row. Text payloads are coerced to valid UTF-8
    /// before insert.
    pub async fn insert(
        &self,
        kind: ContentKind,
        group_id: GroupId,
        version_id: VersionId,
        payload: &[u8],
    ) -> StoreResult<()> {
        match kind {
            ContentKind::Text => {
                sqlx::query(
                    "INSERT INTO pgit_text_content (group_id, version_id, content)
                     VALUES ($1, $2, $3)",
                )
                .bind(group_id.value())
                .bind(version_id.value())
                .bind(coerce_utf8(payload))
                .execute(&self.pool)
                .await?;
            }
            ContentKind::Binary => {
                sqlx::query(
                    "INSERT INTO pgit_binary_content (group_id, version_id, content)
                     VALUES ($1, $2, $3)",
                )
                .bind(group_id.value())
                .bind(version_id.value())
                .bind(payload)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Reads one content row, or `None` when the slot is unoccupied.
    pub async fn read(
        &self,
        kind: ContentKind,
        group_id: GroupId,
        version_id: VersionId,
    ) -> StoreResult<Option<Vec<u8>>> {
        let sql = format!(
            "SELECT content FROM {} WHERE group_id = $1 AND version_id = $2",
            kind.table_name()
        );
        let row = sqlx::query(&sql)
            .bind(group_id.value())
            .bind(version_id.value())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| read_content_column(kind, &row)).transpose()
    }

    /// Batch read by key. Each side (text, binary) touching at most
    /// [`COMBINED_QUERY_MAX_GROUPS`] distinct groups goes through one
    /// combined array-join query; wider batches issue one query per group in
    /// parallel.
    pub async fn read_batch(
        &self,
        keys: &[ContentKey],
    ) -> StoreResult<HashMap<(GroupId, VersionId), Vec<u8>>> {
        let mut result = HashMap::with_capacity(keys.len());
        for kind in [ContentKind::Text, ContentKind::Binary] {
            let side: Vec<&ContentKey> = keys.iter().filter(|k| k.kind == kind).collect();
            if side.is_empty() {
                continue;
            }
            let mut by_group: HashMap<GroupId, Vec<VersionId>> = HashMap::new();
            for key in &side {
                by_group.entry(key.group_id).or_default().push(key.version_id);
            }
            if by_group.len() <= COMBINED_QUERY_MAX_GROUPS {
                self.read_combined(kind, &side, &mut result).await?;
            } else {
                self.read_per_group(kind, by_group, &mut result).await?;
            }
        }
        Ok(result)
    }

    async fn read_combined(
        &self,
        kind: ContentKind,
        keys: &[&ContentKey],
        result: &mut HashMap<(GroupId, VersionId), Vec<u8>>,
    ) -> StoreResult<()> {
        let groups: Vec<i32> = keys.iter().map(|k| k.group_id.value()).collect();
        let versions: Vec<i32> = keys.iter().map(|k| k.version_id.value()).collect();
        let sql = format!(
            "SELECT t.group_id, t.version_id, t.content
             FROM {} t
             JOIN unnest($1::int[], $2::int[]) AS k(group_id, version_id)
               ON t.group_id = k.group_id AND t.version_id = k.version_id",
            kind.table_name()
        );
        let rows = sqlx::query(&sql)
            .bind(&groups)
            .bind(&versions)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let key = (
                GroupId(row.try_get("group_id")?),
                VersionId(row.try_get("version_id")?),
            );
            result.insert(key, read_content_column(kind, &row)?);
        }
        Ok(())
    }

    async fn read_per_group(
        &self,
        kind: ContentKind,
        by_group: HashMap<GroupId, Vec<VersionId>>,
        result: &mut HashMap<(GroupId, VersionId), Vec<u8>>,
    ) -> StoreResult<()> {
        debug!(
            groups = by_group.len(),
            table = kind.table_name(),
            "splitting batch read per group"
        );
        let sql = format!(
            "SELECT version_id, content FROM {}
             WHERE group_id = $1 AND version_id = ANY($2)
             ORDER BY version_id",
            kind.table_name()
        );
        let mut reads = stream::iter(by_group.into_iter().map(|(group_id, versions)| {
            let pool = self.pool.clone();
            let sql = sql.clone();
            async move {
                let version_values: Vec<i32> = versions.iter().map(|v| v.value()).collect();
                let rows = sqlx::query(&sql)
                    .bind(group_id.value())
                    .bind(&version_values)
                    .fetch_all(&pool)
                    .await?;
                let mut chunk = Vec::with_capacity(rows.len());
                for row in rows {
                    let version = VersionId(row.try_get("version_id")?);
                    chunk.push(((group_id, version), read_content_column(kind, &row)?));
                }
                Ok::<_, crate::store::StoreError>(chunk)
            }
        }))
        .buffer_unordered(PARALLEL_GROUP_READS);
        while let Some(chunk) = reads.next().await {
            result.extend(chunk?);
        }
        Ok(())
    }

    /// Scans a whole group front-to-back, the cheapest pattern through the
    /// delta chain.
    pub async fn read_group(
        &self,
        kind: ContentKind,
        group_id: GroupId,
    ) -> StoreResult<Vec<(VersionId, Vec<u8>)>> {
        let sql = format!(
            "SELECT version_id, content FROM {}
             WHERE group_id = $1 ORDER BY version_id",
            kind.table_name()
        );
        let rows = sqlx::query(&sql)
            .bind(group_id.value())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    VersionId(row.try_get("version_id")?),
                    read_content_column(kind, &row)?,
                ))
            })
            .collect()
    }

    /// Truncates a chain: deleting `(group, version)` makes the access
    /// method cascade to every row of the group with a higher `version_id`.
    /// Used exactly once, by commit pruning.
    pub async fn truncate(
        &self,
        kind: ContentKind,
        group_id: GroupId,
        version_id: VersionId,
    ) -> StoreResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE group_id = $1 AND version_id = $2",
            kind.table_name()
        );
        sqlx::query(&sql)
            .bind(group_id.value())
            .bind(version_id.value())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Like [`Self::truncate`], but anchors the delete on the lowest row of
    /// the group at or above `version_id`. Tombstones consume versions
    /// without content rows, so the exact slot may be absent from this
    /// table; the cascade still has to fire from the right anchor.
    pub(crate) async fn truncate_at_or_after(
        &self,
        kind: ContentKind,
        group_id: GroupId,
        version_id: VersionId,
    ) -> StoreResult<()> {
        let sql = format!(
            "DELETE FROM {table} WHERE group_id = $1 AND version_id = (
                 SELECT MIN(version_id) FROM {table}
                 WHERE group_id = $1 AND version_id >= $2
             )",
            table = kind.table_name()
        );
        sqlx::query(&sql)
            .bind(group_id.value())
            .bind(version_id.value())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Appends one content row to a COPY buffer in the encoding of its table.
pub(crate) fn encode_copy_row(
    kind: ContentKind,
    group_id: GroupId,
    version_id: VersionId,
    payload: &[u8],
    buf: &mut CopyBuffer,
) {
    buf.int(group_id.value());
    buf.int(version_id.value());
    match kind {
        ContentKind::Text => buf.text(&coerce_utf8(payload)),
        ContentKind::Binary => buf.bytea(payload),
    }
    buf.end_row();
}

/// Streams a prepared COPY buffer into the content table for `kind` on the
/// given connection (typically inside a group's import transaction).
pub(crate) async fn copy_rows(
    conn: &mut PgConnection,
    kind: ContentKind,
    buf: &CopyBuffer,
) -> StoreResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let statement = format!(
        "COPY {} (group_id, version_id, content) FROM STDIN WITH (FORMAT text)",
        kind.table_name()
    );
    let mut sink = conn.copy_in_raw(&statement).await?;
    sink.send(buf.as_bytes()).await?;
    sink.finish().await?;
    Ok(())
}

fn read_content_column(kind: ContentKind, row: &sqlx::postgres::PgRow) -> StoreResult<Vec<u8>> {
    match kind {
        ContentKind::Text => Ok(row.try_get::<String, _>("content")?.into_bytes()),
        ContentKind::Binary => Ok(row.try_get::<Vec<u8>, _>("content")?),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(b"hello\n", "hello\n"; "valid utf8 passes through")]
    #[test_case("héllo".as_bytes(), "héllo"; "multibyte utf8 passes through")]
    // 0xE9 is 'é' in Latin-1 but not valid UTF-8 on its own.
    #[test_case(b"caf\xe9", "caf\u{e9}"; "latin1 fallback")]
    #[test_case(b"", ""; "empty")]
    fn test_coerce_utf8(input: &[u8], expected: &str) {
        assert_eq!(coerce_utf8(input), expected);
    }

    #[test]
    fn test_coerce_utf8_maps_every_byte_to_one_codepoint() {
        let all_bytes: Vec<u8> = (0..=255).collect();
        let coerced = coerce_utf8(&all_bytes);
        assert_eq!(coerced.chars().count(), 256);
    }

    #[test]
    fn test_kind_routing() {
        assert_eq!(ContentKind::from_is_binary(false), ContentKind::Text);
        assert_eq!(ContentKind::from_is_binary(true), ContentKind::Binary);
        assert_eq!(ContentKind::Text.table_name(), "pgit_text_content");
        assert_eq!(ContentKind::Binary.table_name(), "pgit_binary_content");
    }

    #[test]
    fn test_encode_copy_row_text_vs_binary() {
        let mut buf = CopyBuffer::new();
        encode_copy_row(
            ContentKind::Text,
            GroupId(1),
            VersionId(2),
            b"a\tb",
            &mut buf,
        );
        assert_eq!(buf.as_bytes(), b"1\t2\ta\\tb\n");

        let mut buf = CopyBuffer::new();
        encode_copy_row(
            ContentKind::Binary,
            GroupId(3),
            VersionId(4),
            &[0xff, 0x00],
            &mut buf,
        );
        assert_eq!(buf.as_bytes(), b"3\t4\t\\\\xff00\n");
    }
}
