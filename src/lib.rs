#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[macro_use]
pub mod options;

pub use ::bson;

mod bson_util;
pub mod change_stream;
mod client;
mod cmap;
mod coll;
mod compression;
mod concern;
mod cursor;
mod db;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub mod results;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod serde_util;
mod srv;

pub use crate::{
    client::{session::ClientSession, Client},
    coll::{bulk::WriteModel, Collection, Namespace},
    cursor::{Cursor, SessionCursor},
    db::Database,
};

pub use client::session::ClusterTime;
pub use cmap::ConnectionInfo;
pub use sdam::{ServerInfo, ServerType, TopologyType};

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
