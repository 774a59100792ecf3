// Copyright 2025 The pgit Authors
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

//! Regex search over the content chains.
//!
//! History-wide search pushes the pattern to the server, one regex query per
//! group, so non-matching payloads never leave the database and each chain
//! decompresses once. Single-commit search fetches refs by primary key and
//! tests a compiled regex locally. Both variants skip binary files by
//! construction and stop early once a result limit is reached.
//!
//! Results are unordered; callers sort when they need determinism.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use regex::Regex;
use regex::RegexBuilder;
use sqlx::PgPool;
use sqlx::Row as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;

use crate::content_store::ContentStore;
use crate::file_refs::FileRefEntry;
use crate::file_refs::FileRefStore;
use crate::object_id::CommitId;
use crate::object_id::GroupId;
use crate::object_id::VersionId;
use crate::store::Store;
use crate::store::StoreError;
use crate::store::StoreResult;

#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub case_insensitive: bool,
    /// Shell-style glob (`*`, `?`) on the path.
    pub path_glob: Option<String>,
    /// Only consider refs at or before this commit.
    pub until: Option<CommitId>,
    /// Stop all workers once this many matches were found.
    pub limit: Option<usize>,
}

/// One matching file version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchMatch {
    pub path: String,
    pub commit_id: CommitId,
    pub group_id: GroupId,
    pub version_id: VersionId,
}

/// Per-group search plan: the searchable versions and the refs owning them
/// (dedup means one version can back several refs).
struct GroupPlan {
    group_id: GroupId,
    refs_by_version: BTreeMap<VersionId, Vec<FileRefEntry>>,
}

impl GroupPlan {
    fn chain_len(&self) -> usize {
        self.refs_by_version.len()
    }

    fn max_version(&self) -> VersionId {
        self.refs_by_version
            .keys()
            .next_back()
            .copied()
            .unwrap_or(VersionId(0))
    }
}

/// Buckets refs per group. Used by both search variants, which sort the
/// plans differently.
fn plan_by_group(refs: Vec<FileRefEntry>) -> Vec<GroupPlan> {
    let mut by_group: HashMap<GroupId, BTreeMap<VersionId, Vec<FileRefEntry>>> = HashMap::new();
    for entry in refs {
        by_group
            .entry(entry.group_id)
            .or_default()
            .entry(entry.file_ref.version_id)
            .or_default()
            .push(entry);
    }
    by_group
        .into_iter()
        .map(|(group_id, refs_by_version)| GroupPlan {
            group_id,
            refs_by_version,
        })
        .collect()
}

fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 2);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            ch => pattern.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

struct SearchShared {
    results: Mutex<Vec<SearchMatch>>,
    found: AtomicUsize,
    stop: AtomicBool,
    limit: Option<usize>,
    cancel: CancellationToken,
}

impl SearchShared {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.cancel.is_cancelled()
    }

    /// Appends a whole batch under the mutex and flips the stop flag once
    /// the limit is reached.
    fn push_matches(&self, matches: Vec<SearchMatch>) {
        if matches.is_empty() {
            return;
        }
        let found = self.found.fetch_add(matches.len(), Ordering::Relaxed) + matches.len();
        self.results.lock().unwrap().extend(matches);
        if let Some(limit) = self.limit
            && found >= limit
        {
            self.stop.store(true, Ordering::Relaxed);
        }
    }

    fn into_results(self) -> Vec<SearchMatch> {
        let mut results = self.results.into_inner().unwrap();
        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

pub struct SearchEngine {
    pool: PgPool,
    file_refs: FileRefStore,
    workers: usize,
}

impl Store {
    pub fn search(&self) -> SearchEngine {
        SearchEngine {
            pool: self.pool().clone(),
            file_refs: self.file_refs(),
            workers: self.options().search_workers,
        }
    }
}

impl SearchEngine {
    /// Searches every stored text version across history.
    ///
    /// Groups are dispatched to a worker pool in ascending chain length so
    /// shallow chains finish first and a `limit` can short-circuit the
    /// expensive ones. Each worker issues one server-side regex query per
    /// group.
    #[instrument(skip_all, fields(pattern = %pattern))]
    pub async fn search_all(
        &self,
        pattern: &str,
        options: &SearchOptions,
        cancel: CancellationToken,
    ) -> StoreResult<Vec<SearchMatch>> {
        // Validate the pattern before touching the database; the server
        // shares POSIX-compatible semantics for everything we accept.
        compile_pattern(pattern, options.case_insensitive)?;
        let refs = self.load_refs(options).await?;
        let mut plans = plan_by_group(refs);
        plans.sort_by_key(|plan| (plan.chain_len(), plan.group_id));
        debug!(groups = plans.len(), "search-all dispatching");

        let operator = if options.case_insensitive { "~*" } else { "~" };
        let shared = Arc::new(SearchShared {
            results: Mutex::new(Vec::new()),
            found: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            limit: options.limit,
            cancel,
        });
        let (tx, rx) = async_channel::bounded::<GroupPlan>(self.workers.max(1));
        let mut handles = Vec::with_capacity(self.workers.max(1));
        for _ in 0..self.workers.max(1) {
            let shared = shared.clone();
            let rx = rx.clone();
            let pool = self.pool.clone();
            let pattern = pattern.to_owned();
            let sql = format!(
                "SELECT version_id FROM pgit_text_content
                 WHERE group_id = $1 AND version_id = ANY($2) AND content {operator} $3"
            );
            handles.push(tokio::spawn(async move {
                while let Ok(plan) = rx.recv().await {
                    if shared.should_stop() {
                        continue;
                    }
                    let versions: Vec<i32> = plan
                        .refs_by_version
                        .keys()
                        .map(|v| v.value())
                        .collect();
                    let rows = sqlx::query(&sql)
                        .bind(plan.group_id.value())
                        .bind(&versions)
                        .bind(&pattern)
                        .fetch_all(&pool)
                        .await?;
                    let mut matches = Vec::new();
                    for row in rows {
                        let version = VersionId(row.try_get("version_id")?);
                        if let Some(entries) = plan.refs_by_version.get(&version) {
                            matches.extend(entries.iter().map(|entry| SearchMatch {
                                path: entry.path.clone(),
                                commit_id: entry.file_ref.commit_id.clone(),
                                group_id: plan.group_id,
                                version_id: version,
                            }));
                        }
                    }
                    shared.push_matches(matches);
                }
                Ok::<(), StoreError>(())
            }));
        }
        drop(rx);
        for plan in plans {
            if shared.should_stop() || tx.send(plan).await.is_err() {
                break;
            }
        }
        drop(tx);
        for handle in handles {
            handle.await.expect("search worker panicked")?;
        }
        if shared.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(Arc::into_inner(shared)
            .expect("all workers dropped their handles")
            .into_results())
    }

    /// Searches the tree at a single commit. Refs are fetched by primary
    /// key and tested locally with a compiled regex; groups run cheapest
    /// first (ascending maximum version).
    #[instrument(skip_all, fields(pattern = %pattern, commit = %commit_id))]
    pub async fn search_at_commit(
        &self,
        pattern: &str,
        commit_id: &CommitId,
        options: &SearchOptions,
        cancel: CancellationToken,
    ) -> StoreResult<Vec<SearchMatch>> {
        let regex = Arc::new(compile_pattern(pattern, options.case_insensitive)?);
        let tree = self.file_refs.tree_at(commit_id).await?;
        let glob = compile_glob(options)?;
        let refs: Vec<FileRefEntry> = tree
            .into_iter()
            .filter(|entry| !entry.file_ref.is_binary)
            .filter(|entry| glob.as_ref().is_none_or(|g| g.is_match(&entry.path)))
            .collect();
        let mut plans = plan_by_group(refs);
        plans.sort_by_key(|plan| (plan.max_version(), plan.group_id));

        let shared = Arc::new(SearchShared {
            results: Mutex::new(Vec::new()),
            found: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            limit: options.limit,
            cancel,
        });
        let (tx, rx) = async_channel::bounded::<GroupPlan>(self.workers.max(1));
        let mut handles = Vec::with_capacity(self.workers.max(1));
        for _ in 0..self.workers.max(1) {
            let shared = shared.clone();
            let rx = rx.clone();
            let contents = ContentStore::new(self.pool.clone());
            let regex = regex.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(plan) = rx.recv().await {
                    for (version, entries) in &plan.refs_by_version {
                        if shared.should_stop() {
                            break;
                        }
                        let kind = entries[0].file_ref.content_kind();
                        let Some(payload) =
                            contents.read(kind, plan.group_id, *version).await?
                        else {
                            continue;
                        };
                        let text = String::from_utf8_lossy(&payload);
                        if regex.is_match(&text) {
                            shared.push_matches(
                                entries
                                    .iter()
                                    .map(|entry| SearchMatch {
                                        path: entry.path.clone(),
                                        commit_id: entry.file_ref.commit_id.clone(),
                                        group_id: plan.group_id,
                                        version_id: *version,
                                    })
                                    .collect(),
                            );
                        }
                    }
                }
                Ok::<(), StoreError>(())
            }));
        }
        drop(rx);
        for plan in plans {
            if shared.should_stop() || tx.send(plan).await.is_err() {
                break;
            }
        }
        drop(tx);
        for handle in handles {
            handle.await.expect("search worker panicked")?;
        }
        if shared.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(Arc::into_inner(shared)
            .expect("all workers dropped their handles")
            .into_results())
    }

    async fn load_refs(&self, options: &SearchOptions) -> StoreResult<Vec<FileRefEntry>> {
        let refs = self
            .file_refs
            .searchable_text_refs(options.until.as_ref())
            .await?;
        let glob = compile_glob(options)?;
        Ok(refs
            .into_iter()
            .filter(|entry| glob.as_ref().is_none_or(|g| g.is_match(&entry.path)))
            .collect())
    }
}

fn compile_pattern(pattern: &str, case_insensitive: bool) -> StoreResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|err| StoreError::InvalidPattern {
            pattern: pattern.to_owned(),
            source: Box::new(err),
        })
}

fn compile_glob(options: &SearchOptions) -> StoreResult<Option<Regex>> {
    options
        .path_glob
        .as_deref()
        .map(|glob| {
            glob_to_regex(glob).map_err(|err| StoreError::InvalidPattern {
                pattern: glob.to_owned(),
                source: Box::new(err),
            })
        })
        .transpose()
}
