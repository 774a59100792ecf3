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

//! End-to-end tests against a live PostgreSQL with the patch-am extension.
//!
//! Set `PGIT_TEST_DSN` to a scratch database to run these; without it every
//! test returns early. Each test wipes and recreates the schema, so do not
//! point the DSN at anything you care about.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::TimeZone as _;
use chrono::Utc;
use pgit_lib::commit_store::Signature;
use pgit_lib::content_store::ContentKind;
use pgit_lib::import::ImportOptions;
use pgit_lib::import::ImportReport;
use pgit_lib::import::ImportSource;
use pgit_lib::import::Importer;
use pgit_lib::import::SourceBlob;
use pgit_lib::import::SourceCommit;
use pgit_lib::object_id::ContentHash;
use pgit_lib::object_id::GroupId;
use pgit_lib::object_id::PrefixResolution;
use pgit_lib::object_id::VersionId;
use pgit_lib::schema;
use pgit_lib::search::SearchOptions;
use pgit_lib::store::Store;
use pgit_lib::store::StoreError;
use pgit_lib::store::StoreOptions;
use sqlx::Row as _;
use tokio_util::sync::CancellationToken;

/// In-memory import source: commits plus a content-addressed blob heap.
#[derive(Default)]
struct MemSource {
    commits: Mutex<Vec<SourceCommit>>,
    blobs: Mutex<HashMap<ContentHash, Vec<u8>>>,
}

impl MemSource {
    fn new() -> Self {
        Self::default()
    }

    /// Adds a commit; `blobs` maps path to `Some((payload, is_binary))` or
    /// `None` for a deletion.
    fn commit(&self, message: &str, at_ms: i64, blobs: &[(&str, Option<(&[u8], bool)>)]) {
        let at = Utc.timestamp_millis_opt(at_ms).unwrap();
        let signature = Signature {
            name: "Ada Lovelace".to_owned(),
            email: "ada@example.com".to_owned(),
            at,
        };
        let blobs = blobs
            .iter()
            .map(|(path, payload)| match payload {
                Some((bytes, is_binary)) => {
                    let hash = ContentHash::of(bytes);
                    self.blobs.lock().unwrap().insert(hash, bytes.to_vec());
                    SourceBlob {
                        path: (*path).to_owned(),
                        hash: Some(hash),
                        mode: 0o100644,
                        is_symlink: false,
                        symlink_target: None,
                        is_binary: *is_binary,
                    }
                }
                None => SourceBlob {
                    path: (*path).to_owned(),
                    hash: None,
                    mode: 0o100644,
                    is_symlink: false,
                    symlink_target: None,
                    is_binary: false,
                },
            })
            .collect();
        self.commits.lock().unwrap().push(SourceCommit {
            message: message.to_owned(),
            author: signature.clone(),
            committer: signature,
            tree_hash: None,
            blobs,
        });
    }
}

impl ImportSource for MemSource {
    fn commits(&self) -> Result<Vec<SourceCommit>, StoreError> {
        Ok(self.commits.lock().unwrap().clone())
    }

    fn read_blob(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
        Ok(self.blobs.lock().unwrap()[hash].clone())
    }
}

/// Opens a clean store, or `None` when no test database is configured.
async fn open_clean_store() -> Option<Arc<Store>> {
    let url = std::env::var("PGIT_TEST_DSN").ok()?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let store = Store::init(StoreOptions::new(url)).await.unwrap();
    schema::drop_all(store.pool()).await.unwrap();
    schema::create_all(store.pool()).await.unwrap();
    Some(store)
}

async fn run_import(store: &Arc<Store>, source: Arc<MemSource>) -> ImportReport {
    Importer::new(store.clone())
        .with_options(ImportOptions::default())
        .run(source, CancellationToken::new())
        .await
        .unwrap()
}

async fn count_rows(store: &Store, table: &str) -> i64 {
    sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
        .fetch_one(store.pool())
        .await
        .unwrap()
        .try_get("n")
        .unwrap()
}

#[tokio::test]
async fn test_single_file_import() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    source.commit("add a.txt", 1_000, &[("a.txt", Some((b"hello\n", false)))]);
    let report = run_import(&store, source).await;
    assert_eq!(report.commits, 1);
    assert_eq!(report.blobs, 1);
    assert!(report.failed_groups.is_empty());

    let registered = store.paths().lookup("a.txt").await.unwrap().unwrap();
    assert_eq!(registered.group_id, GroupId(registered.path_id.value()));

    let head = store.refs().head().await.unwrap().unwrap();
    let tree = store
        .queries()
        .tree_with_contents(&head, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].path, "a.txt");
    assert_eq!(tree[0].content, b"hello\n");
    assert_eq!(tree[0].file_ref.version_id, VersionId(1));

    let content = store
        .contents()
        .read(ContentKind::Text, registered.group_id, VersionId(1))
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some(b"hello\n".as_slice()));
}

#[tokio::test]
async fn test_modification_and_diff_range() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    source.commit("add", 1_000, &[("a.txt", Some((b"hello\n", false)))]);
    source.commit("edit", 2_000, &[("a.txt", Some((b"hello world\n", false)))]);
    run_import(&store, source).await;

    let log = store
        .commits()
        .log(&store.refs().head().await.unwrap().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
    let (c2, c1) = (&log[0], &log[1]);
    assert_eq!(c2.parent_id.as_ref(), Some(&c1.id));

    let changed = store
        .queries()
        .changed_files(&c1.id, &c2.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].path, "a.txt");
    assert_eq!(changed[0].file_ref.version_id, VersionId(2));
    assert_eq!(changed[0].content.as_deref(), Some(b"hello world\n".as_slice()));

    // The old version still materializes at the old commit.
    let at_c1 = store.queries().file_at("a.txt", &c1.id).await.unwrap().unwrap();
    assert_eq!(at_c1.content, b"hello\n");
}

#[tokio::test]
async fn test_rename_shares_group_and_dedups_content() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    source.commit("add", 1_000, &[("a.txt", Some((b"hello\n", false)))]);
    source.commit("edit", 2_000, &[("a.txt", Some((b"hello world\n", false)))]);
    source.commit(
        "rename",
        3_000,
        &[("a.txt", None), ("b.txt", Some((b"hello world\n", false)))],
    );
    let report = run_import(&store, source).await;
    assert_eq!(report.deduped, 1);

    let a = store.paths().lookup("a.txt").await.unwrap().unwrap();
    let b = store.paths().lookup("b.txt").await.unwrap().unwrap();
    assert_eq!(a.group_id, b.group_id);

    // Tombstone for a, reused version for b, no third content row.
    let head = store.refs().head().await.unwrap().unwrap();
    let changed = store.file_refs().changed_at(&head).await.unwrap();
    assert_eq!(changed.len(), 2);
    let a_ref = changed.iter().find(|e| e.path == "a.txt").unwrap();
    let b_ref = changed.iter().find(|e| e.path == "b.txt").unwrap();
    assert!(a_ref.file_ref.is_tombstone());
    assert_eq!(b_ref.file_ref.version_id, VersionId(2));
    assert_eq!(count_rows(&store, "pgit_text_content").await, 2);

    // The tree sees only the new name.
    let tree = store.queries().tree_at(&head).await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].path, "b.txt");

    // History still sees the deleted path.
    let history = store.queries().history("a.txt", None).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].file_ref.is_tombstone());
}

#[tokio::test]
async fn test_binary_isolation_and_search_skip() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    let png = [0x89, b'P', b'N', b'G', 0x00, 0xff, b'N', b'E', b'E', b'D', b'L', b'E'];
    source.commit("text", 1_000, &[("a.txt", Some((b"no match here\n", false)))]);
    source.commit("binary", 2_000, &[("logo.png", Some((&png, true)))]);
    run_import(&store, source).await;

    assert_eq!(count_rows(&store, "pgit_binary_content").await, 1);
    assert_eq!(count_rows(&store, "pgit_text_content").await, 1);

    // The pattern occurs only in the binary payload, which search skips by
    // construction.
    let matches = store
        .search()
        .search_all("NEEDLE", &SearchOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert!(matches.is_empty());

    let matches = store
        .search()
        .search_all("no match", &SearchOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].path, "a.txt");

    // Round-trip of the binary payload stays byte-exact.
    let head = store.refs().head().await.unwrap().unwrap();
    let logo = store.queries().file_at("logo.png", &head).await.unwrap().unwrap();
    assert_eq!(logo.content, png);
}

#[tokio::test]
async fn test_kth_ancestor_and_prefix_resolution() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    for i in 0..100 {
        let body = format!("rev {i}\n");
        source.commit(
            &format!("commit {i}"),
            1_000 * (i + 1),
            &[("counter.txt", Some((body.as_bytes(), false)))],
        );
    }
    run_import(&store, source).await;

    let graph = store.commit_graph();
    assert_eq!(graph.count().await.unwrap(), 100);
    let head = store.refs().head().await.unwrap().unwrap();
    let back_40 = graph.kth_ancestor(&head, 40).await.unwrap();
    let log = store.commits().log(&head, None).await.unwrap();
    assert_eq!(back_40, log[40].id);

    assert!(matches!(
        graph.kth_ancestor(&head, 100).await,
        Err(StoreError::AncestorOutOfRange { .. })
    ));
    assert!(matches!(
        graph.kth_ancestor(&head, -1).await,
        Err(StoreError::NegativeAncestorDistance { .. })
    ));

    // A full id resolves uniquely; the shared time-token prefix of this
    // fast-minted batch is ambiguous.
    assert_eq!(
        graph.resolve_prefix(head.as_str()).await.unwrap(),
        PrefixResolution::SingleMatch(head.clone())
    );
    assert!(matches!(
        graph.resolve_prefix(&head.as_str()[..2]).await.unwrap(),
        PrefixResolution::AmbiguousMatch(_)
    ));
    assert_eq!(
        graph.resolve_prefix("0000000000").await.unwrap(),
        PrefixResolution::NoMatch
    );

    let root = graph.kth_ancestor(&head, 99).await.unwrap();
    let mid = graph.kth_ancestor(&head, 50).await.unwrap();
    let lca = graph.common_ancestor(&mid, &head).await.unwrap().unwrap();
    assert_eq!(lca, mid);
    let _ = root;
}

#[tokio::test]
async fn test_reimport_is_idempotent() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    source.commit("one", 1_000, &[("a.txt", Some((b"1\n", false)))]);
    source.commit("two", 2_000, &[("b.txt", Some((b"2\n", false)))]);
    run_import(&store, source.clone()).await;

    let commits_before = count_rows(&store, "pgit_commits").await;
    let refs_before = count_rows(&store, "pgit_file_refs").await;
    let content_before = count_rows(&store, "pgit_text_content").await;

    let report = run_import(&store, source).await;
    assert_eq!(report.commits, 0);
    assert_eq!(report.blobs, 0);
    assert_eq!(count_rows(&store, "pgit_commits").await, commits_before);
    assert_eq!(count_rows(&store, "pgit_file_refs").await, refs_before);
    assert_eq!(count_rows(&store, "pgit_text_content").await, content_before);
}

#[tokio::test]
async fn test_extended_stream_appends_only_new_work() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    source.commit("one", 1_000, &[("a.txt", Some((b"1\n", false)))]);
    source.commit("two", 2_000, &[("a.txt", Some((b"2\n", false)))]);
    run_import(&store, source.clone()).await;
    let head_before = store.refs().head().await.unwrap().unwrap();

    // The same stream plus one commit: planned ids for the prefix are
    // re-derived identically, so only the tail is ingested.
    source.commit("three", 3_000, &[("a.txt", Some((b"3\n", false)))]);
    let report = run_import(&store, source).await;
    assert_eq!(report.commits, 1);
    assert_eq!(report.blobs, 1);

    let head_after = store.refs().head().await.unwrap().unwrap();
    let log = store.commits().log(&head_after, None).await.unwrap();
    assert_eq!(log.len(), 3);
    // The old head is the parent of the appended commit.
    assert_eq!(log[0].parent_id.as_ref(), Some(&head_before));
    assert_eq!(log[1].id, head_before);
    assert_eq!(count_rows(&store, "pgit_text_content").await, 3);

    // The appended version continues the group's chain.
    let group = store.paths().lookup("a.txt").await.unwrap().unwrap().group_id;
    let chain = store
        .contents()
        .read_group(ContentKind::Text, group)
        .await
        .unwrap();
    let versions: Vec<i32> = chain.iter().map(|(v, _)| v.value()).collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_prune_cascades_content_chains() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    for i in 0..10 {
        let body = format!("version {i}\n");
        source.commit(
            &format!("commit {i}"),
            1_000 * (i + 1),
            &[("file.txt", Some((body.as_bytes(), false)))],
        );
    }
    run_import(&store, source).await;

    let head = store.refs().head().await.unwrap().unwrap();
    let log = store.commits().log(&head, None).await.unwrap();
    // Prune the newest five commits (versions 6..=10 of the chain).
    let cut = &log[4].id;
    let deleted = store.queries().prune_commits_from(cut).await.unwrap();
    assert_eq!(deleted, 5);

    assert_eq!(count_rows(&store, "pgit_commits").await, 5);
    assert_eq!(count_rows(&store, "pgit_commit_graph").await, 5);
    assert_eq!(count_rows(&store, "pgit_text_content").await, 5);

    let group = store.paths().lookup("file.txt").await.unwrap().unwrap().group_id;
    let surviving = store
        .contents()
        .read_group(ContentKind::Text, group)
        .await
        .unwrap();
    let versions: Vec<i32> = surviving.iter().map(|(v, _)| v.value()).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    assert_eq!(surviving[4].1, b"version 4\n");

    // HEAD moved to the surviving tip.
    let new_head = store.refs().head().await.unwrap().unwrap();
    assert_eq!(new_head, log[5].id);
}

#[tokio::test]
async fn test_latin1_coercion_on_text_path() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    // Latin-1 "café" is not valid UTF-8; the text chain stores the coerced
    // form.
    source.commit("mojibake", 1_000, &[("cafe.txt", Some((b"caf\xe9\n", false)))]);
    run_import(&store, source).await;

    let head = store.refs().head().await.unwrap().unwrap();
    let file = store.queries().file_at("cafe.txt", &head).await.unwrap().unwrap();
    assert_eq!(file.content, "café\n".as_bytes());
}

#[tokio::test]
async fn test_search_limit_short_circuits() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    let source = Arc::new(MemSource::new());
    for i in 0..20 {
        let body = format!("needle {i}\n");
        source.commit(
            &format!("commit {i}"),
            1_000 * (i + 1),
            &[(format!("f{i}.txt").as_str(), Some((body.as_bytes(), false)))],
        );
    }
    run_import(&store, source).await;

    let options = SearchOptions {
        limit: Some(3),
        ..SearchOptions::default()
    };
    let matches = store
        .search()
        .search_all("needle", &options, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(matches.len(), 3);

    // The commit-scoped variant sees exactly the tree at that commit.
    let head = store.refs().head().await.unwrap().unwrap();
    let matches = store
        .search()
        .search_at_commit("needle \\d+", &head, &SearchOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(matches.len(), 20);
}

#[tokio::test]
async fn test_schema_version_gate() {
    let Some(store) = open_clean_store().await else {
        return;
    };
    store
        .refs()
        .set_meta(schema::META_SCHEMA_VERSION, "3")
        .await
        .unwrap();
    let err = schema::check_version(store.pool()).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::SchemaOutdated {
            found: 3,
            required: 4
        }
    ));
    let message = err.to_string();
    assert!(message.contains("re-import"), "{message}");
}
