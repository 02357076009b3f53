//! Remote build daemon.
//!
//! A client authenticates, names a file and an optional recipe type, and
//! uploads its sources. The daemon picks a [`Recipe`], runs its commands in
//! a private scratch directory while streaming status, stdout, and stderr
//! back as frames, then returns every file matching the recipe's output glob.
//!
//! # Serving
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rmake::{DaemonConfig, Server};
//!
//! # async fn run() -> rmake::Result<()> {
//! let config = DaemonConfig::load("rmaked.json".as_ref())?;
//! let listener = tokio::net::TcpListener::bind(config.listen).await?;
//! Arc::new(Server::from_config(&config)?).serve(listener).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Building remotely
//!
//! ```no_run
//! use rmake::Client;
//! use rmake::rmake_proto::MakeRequest;
//!
//! # async fn run() -> rmake::Result<()> {
//! let mut client = Client::connect("build-host:25386").await?;
//! client.authenticate("alice", "secret", "salt").await?;
//!
//! let request = MakeRequest {
//!     filenames: vec!["main.c".into()],
//!     ..MakeRequest::default()
//! };
//! let source = std::fs::read("main.c")?;
//! let result = client
//!     .make(&request, &[("main.c".into(), source)], |event| eprintln!("{event:?}"))
//!     .await?;
//! for out in result.outputs {
//!     println!("{} ({} bytes)", out.name, out.data.len());
//! }
//! client.goodbye().await
//! # }
//! ```

mod auth;
mod client;
mod config;
mod conn;
mod error;
mod make;
mod recipe;
mod registry;
mod server;
mod template;

pub use auth::{AuthOutcome, Authenticator, PasswordTable, hash_password};
pub use client::{Client, MakeEvent, MakeResult, Output};
pub use config::{DEFAULT_MAX_FILE_LEN, DaemonConfig};
pub use conn::{Conn, ConnOptions, Request};
pub use error::{Error, Result};
pub use make::confined_path;
pub use recipe::{Recipe, RecipeConfig};
pub use registry::RecipeBook;
pub use rmake_proto;
pub use server::Server;
pub use template::CommandTemplate;
