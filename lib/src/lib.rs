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

#![warn(missing_docs)]
#![deny(unused_must_use)]

//! Storage engine for pgit: the complete history of a source tree (commits,
//! file versions, file contents) inside PostgreSQL, stored under a
//! delta-compressed table access method (patch-am) so that storage stays
//! competitive with a packed repository while every object remains
//! queryable with ordinary relational predicates.
//!
//! The library is organized around a [`store::Store`] facade owning the
//! connection pool. Physical layout and compression bindings live in
//! [`schema`]; the per-table stores ([`paths`], [`content_store`],
//! [`file_refs`], [`commit_store`], [`commit_graph`], [`refs`]) wrap one
//! table each; [`import`] is the bulk pipeline that turns a chronological
//! commit stream into long per-group delta chains; [`query`] and [`search`]
//! are the read surface on top.

pub mod commit_graph;
pub mod commit_store;
pub mod content_store;
mod copy;
pub mod file_refs;
pub mod grouping;
pub mod import;
pub mod object_id;
pub mod paths;
pub mod query;
pub mod refs;
pub mod schema;
pub mod search;
pub mod store;
