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

//! Table definitions, patch-am bindings, and the secondary-index lifecycle.
//!
//! The chained tables (`pgit_commits` and the two content tables) are stored
//! under the patch-am table access method. Keyframe interval and compression
//! depth are fixed here: commit bodies evolve slowly, so a long delta run
//! (depth 50) with a keyframe every 100 rows bounds reconstruction cost;
//! content chains use depth 10 to balance dedup against random-read latency.

use futures::TryStreamExt as _;
use futures::stream::FuturesUnordered;
use sqlx::PgPool;
use sqlx::Row as _;
use tracing::debug;
use tracing::info;

use crate::store::StoreError;
use crate::store::StoreResult;

/// Current on-disk schema version. Bump whenever a table or patch-am option
/// changes shape; older databases must be re-imported.
pub const SCHEMA_VERSION: i32 = 4;

/// Metadata key holding the schema version.
pub const META_SCHEMA_VERSION: &str = "schema_version";

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pgit_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pgit_commits (
        id TEXT PRIMARY KEY,
        parent_id TEXT,
        tree_hash TEXT,
        message TEXT NOT NULL,
        author_name TEXT NOT NULL,
        author_email TEXT NOT NULL,
        authored_at TIMESTAMPTZ NOT NULL,
        committer_name TEXT NOT NULL,
        committer_email TEXT NOT NULL,
        committed_at TIMESTAMPTZ NOT NULL
    ) USING patch_am
    WITH (
        patch_am.order_by = 'authored_at',
        patch_am.delta_columns = 'message,author_name,author_email,committer_name,committer_email',
        patch_am.keyframe_every = 100,
        patch_am.compression_depth = 50
    )",
    "CREATE TABLE IF NOT EXISTS pgit_commit_graph (
        seq SERIAL PRIMARY KEY,
        id TEXT NOT NULL,
        depth INTEGER NOT NULL,
        ancestors INTEGER[] NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pgit_paths (
        path_id INTEGER GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
        group_id INTEGER,
        path TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pgit_file_refs (
        path_id INTEGER NOT NULL,
        commit_id TEXT NOT NULL,
        version_id INTEGER NOT NULL,
        content_hash BYTEA,
        mode INTEGER NOT NULL,
        is_symlink BOOLEAN NOT NULL DEFAULT FALSE,
        symlink_target TEXT,
        is_binary BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (path_id, commit_id)
    )",
    "CREATE TABLE IF NOT EXISTS pgit_text_content (
        group_id INTEGER NOT NULL,
        version_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        PRIMARY KEY (group_id, version_id)
    ) USING patch_am
    WITH (
        patch_am.group_by = 'group_id',
        patch_am.order_by = 'version_id',
        patch_am.delta_columns = 'content',
        patch_am.keyframe_every = 100,
        patch_am.compression_depth = 10
    )",
    "CREATE TABLE IF NOT EXISTS pgit_binary_content (
        group_id INTEGER NOT NULL,
        version_id INTEGER NOT NULL,
        content BYTEA NOT NULL,
        PRIMARY KEY (group_id, version_id)
    ) USING patch_am
    WITH (
        patch_am.group_by = 'group_id',
        patch_am.order_by = 'version_id',
        patch_am.delta_columns = 'content',
        patch_am.keyframe_every = 100,
        patch_am.compression_depth = 10
    )",
    "CREATE TABLE IF NOT EXISTS pgit_refs (
        name TEXT PRIMARY KEY,
        commit_id TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pgit_sync_state (
        remote_name TEXT PRIMARY KEY,
        last_commit_id TEXT NOT NULL,
        synced_at TIMESTAMPTZ NOT NULL
    )",
];

/// Every secondary index, in creation order. Primary keys are not listed:
/// they are required for conflict detection and chain ordering and survive
/// bulk import.
const SECONDARY_INDEXES: &[SecondaryIndex] = &[
    SecondaryIndex {
        name: "pgit_commits_parent_id_idx",
        table: "pgit_commits",
        definition: "ON pgit_commits (parent_id)",
        unique: false,
    },
    SecondaryIndex {
        name: "pgit_commits_authored_at_idx",
        table: "pgit_commits",
        definition: "ON pgit_commits (authored_at DESC)",
        unique: false,
    },
    SecondaryIndex {
        name: "pgit_commit_graph_id_key",
        table: "pgit_commit_graph",
        definition: "ON pgit_commit_graph (id)",
        unique: true,
    },
    SecondaryIndex {
        name: "pgit_paths_path_key",
        table: "pgit_paths",
        definition: "ON pgit_paths (path)",
        unique: true,
    },
    SecondaryIndex {
        name: "pgit_paths_group_id_idx",
        table: "pgit_paths",
        definition: "ON pgit_paths (group_id)",
        unique: false,
    },
    SecondaryIndex {
        name: "pgit_file_refs_commit_id_idx",
        table: "pgit_file_refs",
        definition: "ON pgit_file_refs (commit_id)",
        unique: false,
    },
    SecondaryIndex {
        name: "pgit_file_refs_path_version_idx",
        table: "pgit_file_refs",
        definition: "ON pgit_file_refs (path_id, version_id)",
        unique: false,
    },
];

struct SecondaryIndex {
    name: &'static str,
    table: &'static str,
    definition: &'static str,
    unique: bool,
}

impl SecondaryIndex {
    fn create_sql(&self) -> String {
        let unique = if self.unique { "UNIQUE " } else { "" };
        format!(
            "CREATE {unique}INDEX IF NOT EXISTS {name} {definition}",
            name = self.name,
            definition = self.definition
        )
    }
}

/// The three tables stored under patch-am.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainedTable {
    Commits,
    TextContent,
    BinaryContent,
}

impl ChainedTable {
    pub const ALL: [Self; 3] = [Self::Commits, Self::TextContent, Self::BinaryContent];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Commits => "pgit_commits",
            Self::TextContent => "pgit_text_content",
            Self::BinaryContent => "pgit_binary_content",
        }
    }
}

/// Compression statistics reported by the access method for one chained
/// table.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ChainStats {
    pub table: String,
    pub total_rows: i64,
    pub group_count: i64,
    pub keyframe_count: i64,
    pub delta_count: i64,
    pub raw_bytes: i64,
    pub compressed_bytes: i64,
    pub compression_ratio: f64,
    pub avg_chain_length: f64,
}

/// Creates all tables and secondary indexes, and stamps the schema version.
/// Idempotent.
pub async fn create_all(pool: &PgPool) -> StoreResult<()> {
    for ddl in CREATE_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for index in SECONDARY_INDEXES {
        sqlx::query(&index.create_sql()).execute(pool).await?;
    }
    sqlx::query(
        "INSERT INTO pgit_metadata (key, value) VALUES ($1, $2)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(META_SCHEMA_VERSION)
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await?;
    info!(version = SCHEMA_VERSION, "schema ready");
    Ok(())
}

/// Drops every pgit table. Destructive; used by re-import and tests.
pub async fn drop_all(pool: &PgPool) -> StoreResult<()> {
    const TABLES: &[&str] = &[
        "pgit_sync_state",
        "pgit_refs",
        "pgit_binary_content",
        "pgit_text_content",
        "pgit_file_refs",
        "pgit_paths",
        "pgit_commit_graph",
        "pgit_commits",
        "pgit_metadata",
    ];
    for table in TABLES {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Fails loudly when the database predates the current schema.
pub async fn check_version(pool: &PgPool) -> StoreResult<()> {
    let row = sqlx::query("SELECT value FROM pgit_metadata WHERE key = $1")
        .bind(META_SCHEMA_VERSION)
        .fetch_optional(pool)
        .await;
    let row = match row {
        Ok(row) => row,
        // 42P01 = undefined_table: nothing was ever initialized here.
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P01") => {
            return Err(StoreError::SchemaMissing);
        }
        Err(err) => return Err(err.into()),
    };
    let found = row
        .map(|row| {
            row.try_get::<String, _>("value")
                .map(|value| value.parse::<i32>().unwrap_or(0))
        })
        .transpose()?
        .ok_or(StoreError::SchemaMissing)?;
    if found < SCHEMA_VERSION {
        return Err(StoreError::SchemaOutdated {
            found,
            required: SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// Drops every secondary index ahead of a bulk import. Primary keys stay.
pub async fn drop_secondary_indexes(pool: &PgPool) -> StoreResult<()> {
    for index in SECONDARY_INDEXES {
        debug!(index = index.name, "dropping secondary index");
        sqlx::query(&format!("DROP INDEX IF EXISTS {}", index.name))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Rebuilds all secondary indexes, dispatching the per-table builds
/// concurrently (multiple builds per table may also run at once).
pub async fn rebuild_secondary_indexes(pool: &PgPool) -> StoreResult<()> {
    let builds: FuturesUnordered<_> = SECONDARY_INDEXES
        .iter()
        .map(|index| {
            let pool = pool.clone();
            async move {
                debug!(index = index.name, table = index.table, "rebuilding index");
                sqlx::query(&index.create_sql()).execute(&pool).await?;
                Ok::<(), StoreError>(())
            }
        })
        .collect();
    builds.try_collect::<Vec<()>>().await?;
    info!(count = SECONDARY_INDEXES.len(), "secondary indexes rebuilt");
    Ok(())
}

/// Reads the access method's compression statistics for one chained table.
pub async fn chain_stats(pool: &PgPool, table: ChainedTable) -> StoreResult<ChainStats> {
    let row = sqlx::query(
        "SELECT total_rows, group_count, keyframe_count, delta_count,
                raw_bytes, compressed_bytes, compression_ratio, avg_chain_length
         FROM patch_am_stats($1)",
    )
    .bind(table.table_name())
    .fetch_one(pool)
    .await?;
    Ok(ChainStats {
        table: table.table_name().to_owned(),
        total_rows: row.try_get("total_rows")?,
        group_count: row.try_get("group_count")?,
        keyframe_count: row.try_get("keyframe_count")?,
        delta_count: row.try_get("delta_count")?,
        raw_bytes: row.try_get("raw_bytes")?,
        compressed_bytes: row.try_get("compressed_bytes")?,
        compression_ratio: row.try_get("compression_ratio")?,
        avg_chain_length: row.try_get("avg_chain_length")?,
    })
}

/// Refreshes planner and chain statistics after bulk writes or truncation.
pub async fn refresh_chain_stats(pool: &PgPool, tables: &[ChainedTable]) -> StoreResult<()> {
    for table in tables {
        sqlx::query(&format!("ANALYZE {}", table.table_name()))
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chained_tables_carry_patch_am_options() {
        for table in ChainedTable::ALL {
            let ddl = CREATE_TABLES
                .iter()
                .find(|ddl| ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", table.table_name())))
                .unwrap();
            assert!(ddl.contains("USING patch_am"), "{ddl}");
            assert!(ddl.contains("patch_am.keyframe_every = 100"), "{ddl}");
        }
    }

    #[test]
    fn test_content_chains_group_by_group_id() {
        for table in [ChainedTable::TextContent, ChainedTable::BinaryContent] {
            let ddl = CREATE_TABLES
                .iter()
                .find(|ddl| ddl.contains(table.table_name()))
                .unwrap();
            assert!(ddl.contains("patch_am.group_by = 'group_id'"));
            assert!(ddl.contains("patch_am.order_by = 'version_id'"));
            assert!(ddl.contains("patch_am.compression_depth = 10"));
        }
    }

    #[test]
    fn test_commit_chain_options() {
        let ddl = CREATE_TABLES
            .iter()
            .find(|ddl| ddl.contains("pgit_commits "))
            .unwrap();
        assert!(ddl.contains("patch_am.order_by = 'authored_at'"));
        assert!(ddl.contains("patch_am.compression_depth = 50"));
    }

    #[test]
    fn test_secondary_index_names_are_unique() {
        let mut names: Vec<_> = SECONDARY_INDEXES.iter().map(|i| i.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SECONDARY_INDEXES.len());
    }

    #[test]
    fn test_unique_indexes_generate_unique_sql() {
        let path_key = SECONDARY_INDEXES
            .iter()
            .find(|i| i.name == "pgit_paths_path_key")
            .unwrap();
        assert_eq!(
            path_key.create_sql(),
            "CREATE UNIQUE INDEX IF NOT EXISTS pgit_paths_path_key ON pgit_paths (path)"
        );
    }
}
