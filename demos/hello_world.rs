//! Minimal apodo application.
//!
//! ```sh
//! APODO_PORT=8080 APODO_WORKERS=2 RUST_LOG=info cargo run --example hello_world
//! curl http://127.0.0.1:8080/hello/world
//! ```

use std::time::Duration;

use apodo::config::ServerConfig;
use apodo::context::Context;
use apodo::router::{Blueprint, Prefix, Route};
use apodo::{Response, Router, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Deserialize, Serialize)]
struct Greeting {
    name: String,
}

fn api() -> Result<Blueprint, Box<dyn std::error::Error>> {
    let mut api = Blueprint::new("api");
    api.add_route(
        Route::new("/greet", |ctx: Context| async move {
            match ctx.json::<Greeting>().await {
                Ok(greeting) => Response::json(StatusCode::Ok, &greeting)
                    .unwrap_or_else(|_| Response::new(StatusCode::InternalServerError)),
                Err(e) => Response::text(StatusCode::BadRequest, e.to_string()),
            }
        })?
        .methods(["POST"])
        .name("greet")
        .timeout(Duration::from_secs(2)),
    );
    Ok(api)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut router = Router::new();
    router.get("/", |_ctx| async { Response::text(StatusCode::Ok, "Hello, World!") })?;
    router.add_route(
        Route::new("/hello/{name}", |ctx: Context| async move {
            let name = ctx.params().get("name").unwrap_or("stranger").to_owned();
            Response::text(StatusCode::Ok, format!("Hello, {name}!"))
        })?
        .name("hello"),
        &[],
    )?;
    router.add_blueprint(api()?, &[Prefix::new("v1", "/v1")])?;

    let sample = router.build_url("hello", &[&"world"])?;
    tracing::info!(url = %sample, routes = router.len(), "router ready");

    Server::new(router, ServerConfig::from_env()?).run()?;
    Ok(())
}
