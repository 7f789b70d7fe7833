//! # apodo
//!
//! A prefork HTTP/1.1 server core: URL routing, streamed request bodies,
//! keep-alive connections and a supervisor that keeps a pool of worker
//! processes alive.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use apodo::config::ServerConfig;
//! use apodo::context::Context;
//! use apodo::{Response, Router, Server, StatusCode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/", |_ctx| async { Response::text(StatusCode::Ok, "Hello, World!") })?;
//!     router.get(r"/users/{id:\d+}", |ctx: Context| async move {
//!         let id = ctx.params().get("id").unwrap_or_default().to_owned();
//!         Response::text(StatusCode::Ok, format!("user {id}"))
//!     })?;
//!
//!     Server::new(router, ServerConfig::from_env()?).run()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod http;
pub mod router;
pub mod server;
pub mod stream;

pub use config::{ConfigError, ServerConfig, ServerLimits};
pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::{Blueprint, BlueprintError, Prefix, Route, RouteError, Router};
pub use server::{Server, ServerError};
pub use stream::{Stream, StreamError};
