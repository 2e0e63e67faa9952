#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

//! Core library for the devhost local dev server.
//!
//! `devhost_core` provides:
//! - project file discovery via [`ignore`](crate::ignore) and [`files`]
//! - the builder contract and built-in builders via [`builders`], memoized
//!   per session by [`builder_cache`]
//! - build matching and execution via [`engine`], publishing into [`store`]
//! - request routing via [`routes`] and serving via [`dispatch`]
//! - local function execution via [`runtime`]
//! - change detection via [`watch`]
//! - the dev session and HTTP listener via [`server`], with an interactive
//!   console in [`repl`]
//! - shared configuration and wire types via [`types`] and [`project`]
//!
//! # Quick Start
//!
//! ```no_run
//! use devhost_core::builder_cache::DefaultInstaller;
//! use devhost_core::runtime::ProcessRuntime;
//! use devhost_core::server::DevSession;
//! use devhost_core::types::DevConfig;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let session = DevSession::start(
//!     Path::new("./site"),
//!     DevConfig::default(),
//!     Arc::new(DefaultInstaller::default()),
//!     Arc::new(ProcessRuntime::default()),
//! )
//! .await?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! session.serve(listener, async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await?;
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builder_cache;
pub mod builders;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod files;
pub mod ignore;
pub mod pattern;
pub mod project;
pub mod repl;
pub mod routes;
pub mod runtime;
pub mod server;
pub mod store;
pub mod types;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;
