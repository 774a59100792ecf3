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

//! The path registry: maps paths to `(path_id, group_id)`.
//!
//! A `group_id` names a delta chain in the content tables; several paths may
//! share one group when their histories are expected to delta well against
//! each other (renames, copies, forks). The grouping is fixed at first
//! registration and never mutates afterwards.

use std::collections::HashMap;
use std::collections::HashSet;

use itertools::Itertools as _;
use sqlx::PgPool;
use sqlx::Row as _;
use tracing::debug;

use crate::object_id::GroupId;
use crate::object_id::PathId;
use crate::object_id::VersionId;
use crate::store::StoreResult;

/// Rows per batched `INSERT` during pre-registration.
const INSERT_BATCH: usize = 500;

/// A row of `pgit_paths`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredPath {
    pub path_id: PathId,
    pub group_id: GroupId,
    pub path: String,
}

pub struct PathRegistry {
    pool: PgPool,
}

impl PathRegistry {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Looks the path up, inserting it if missing. An existing registration
    /// wins: its `group_id` is returned and `candidate_group` is ignored.
    /// Without a candidate the new path becomes its own singleton group
    /// (`group_id = path_id`).
    pub async fn get_or_create(
        &self,
        path: &str,
        candidate_group: Option<GroupId>,
    ) -> StoreResult<(PathId, GroupId)> {
        if let Some(existing) = self.lookup(path).await? {
            return Ok((existing.path_id, existing.group_id));
        }
        match candidate_group {
            Some(group_id) => {
                let row = sqlx::query(
                    "INSERT INTO pgit_paths (group_id, path) VALUES ($1, $2)
                     ON CONFLICT (path) DO NOTHING
                     RETURNING path_id",
                )
                .bind(group_id.value())
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some(row) => Ok((PathId(row.try_get("path_id")?), group_id)),
                    // Lost a race against a concurrent registration.
                    None => {
                        let existing = self.lookup(path).await?.expect("path just conflicted");
                        Ok((existing.path_id, existing.group_id))
                    }
                }
            }
            None => {
                // The surrogate is not known until the insert returns, so the
                // singleton group is set with a follow-up update.
                let row = sqlx::query(
                    "INSERT INTO pgit_paths (path) VALUES ($1)
                     ON CONFLICT (path) DO NOTHING
                     RETURNING path_id",
                )
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some(row) => {
                        let path_id = PathId(row.try_get("path_id")?);
                        sqlx::query("UPDATE pgit_paths SET group_id = $1 WHERE path_id = $1")
                            .bind(path_id.value())
                            .execute(&self.pool)
                            .await?;
                        Ok((path_id, GroupId(path_id.value())))
                    }
                    None => {
                        let existing = self.lookup(path).await?.expect("path just conflicted");
                        Ok((existing.path_id, existing.group_id))
                    }
                }
            }
        }
    }

    /// Registers every path of an import in one pass.
    ///
    /// `assignments` carries the local group index (0-based, from the
    /// grouping pass) per path. Each local group resolves to a database
    /// `group_id`: reused when any member path is already registered,
    /// otherwise allocated sequentially above the current maximum. After this
    /// returns, every future insert of the import knows its ids without
    /// another lookup.
    pub async fn pre_register(
        &self,
        assignments: &[(String, usize)],
    ) -> StoreResult<HashMap<String, RegisteredPath>> {
        let mut result: HashMap<String, RegisteredPath> = HashMap::new();

        let all_paths: Vec<&str> = assignments.iter().map(|(path, _)| path.as_str()).collect();
        let existing = self.lookup_many(&all_paths).await?;

        // Resolve each local group to a database group id. Reuse is keyed on
        // the smallest existing group id so re-runs resolve identically.
        let mut local_to_db: HashMap<usize, GroupId> = HashMap::new();
        for (path, local_group) in assignments {
            if let Some(registered) = existing.get(path) {
                local_to_db
                    .entry(*local_group)
                    .and_modify(|g| *g = (*g).min(registered.group_id))
                    .or_insert(registered.group_id);
            }
        }
        let mut next_group = self.max_group_id().await?.map_or(1, |g| g.value() + 1);
        let fresh_locals: Vec<usize> = assignments
            .iter()
            .map(|(_, local)| *local)
            .filter(|local| !local_to_db.contains_key(local))
            .sorted_unstable()
            .dedup()
            .collect();
        for local in fresh_locals {
            local_to_db.insert(local, GroupId(next_group));
            next_group += 1;
        }

        let new_rows: Vec<(GroupId, &str)> = assignments
            .iter()
            .filter(|(path, _)| !existing.contains_key(path))
            .map(|(path, local)| (local_to_db[local], path.as_str()))
            .collect();
        debug!(
            total = assignments.len(),
            existing = existing.len(),
            new = new_rows.len(),
            "pre-registering paths"
        );
        for chunk in new_rows.chunks(INSERT_BATCH) {
            let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO pgit_paths (group_id, path) ",
            );
            builder.push_values(chunk, |mut b, (group_id, path)| {
                b.push_bind(group_id.value()).push_bind(*path);
            });
            builder.push(" RETURNING path_id, group_id, path");
            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in rows {
                let registered = RegisteredPath {
                    path_id: PathId(row.try_get("path_id")?),
                    group_id: GroupId(row.try_get("group_id")?),
                    path: row.try_get("path")?,
                };
                result.insert(registered.path.clone(), registered);
            }
        }
        result.extend(existing);
        Ok(result)
    }

    pub async fn lookup(&self, path: &str) -> StoreResult<Option<RegisteredPath>> {
        let row = sqlx::query("SELECT path_id, group_id, path FROM pgit_paths WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(RegisteredPath {
                path_id: PathId(row.try_get("path_id")?),
                group_id: GroupId(row.try_get("group_id")?),
                path: row.try_get("path")?,
            })
        })
        .transpose()
    }

    pub async fn lookup_many(
        &self,
        paths: &[&str],
    ) -> StoreResult<HashMap<String, RegisteredPath>> {
        let owned: Vec<String> = paths.iter().map(|p| (*p).to_owned()).collect();
        let rows =
            sqlx::query("SELECT path_id, group_id, path FROM pgit_paths WHERE path = ANY($1)")
                .bind(&owned)
                .fetch_all(&self.pool)
                .await?;
        let mut result = HashMap::with_capacity(rows.len());
        for row in rows {
            let registered = RegisteredPath {
                path_id: PathId(row.try_get("path_id")?),
                group_id: GroupId(row.try_get("group_id")?),
                path: row.try_get("path")?,
            };
            result.insert(registered.path.clone(), registered);
        }
        Ok(result)
    }

    /// Current maximum `version_id` per group, for assigning the next one on
    /// incremental insert. Groups with no refs yet are absent from the map.
    pub async fn max_version_ids(
        &self,
        group_ids: &[GroupId],
    ) -> StoreResult<HashMap<GroupId, VersionId>> {
        let ids: Vec<i32> = group_ids.iter().map(|g| g.value()).collect();
        let rows = sqlx::query(
            "SELECT p.group_id, MAX(f.version_id) AS max_version
             FROM pgit_file_refs f
             JOIN pgit_paths p ON p.path_id = f.path_id
             WHERE p.group_id = ANY($1)
             GROUP BY p.group_id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let mut result = HashMap::with_capacity(rows.len());
        for row in rows {
            result.insert(
                GroupId(row.try_get("group_id")?),
                VersionId(row.try_get("max_version")?),
            );
        }
        Ok(result)
    }

    /// Paths that already carry at least one file-ref. This is the resume
    /// set: an interrupted import skips groups whose paths all appear here.
    pub async fn imported_paths(&self) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT p.path FROM pgit_paths p
             WHERE EXISTS (SELECT 1 FROM pgit_file_refs f WHERE f.path_id = p.path_id)",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get("path")?))
            .collect()
    }

    async fn max_group_id(&self) -> StoreResult<Option<GroupId>> {
        let max: Option<i32> = sqlx::query_scalar("SELECT MAX(group_id) FROM pgit_paths")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(GroupId))
    }
}
