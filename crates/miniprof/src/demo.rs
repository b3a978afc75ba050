//! Demo app: an orders page whose handlers do fake database and RPC work
//! inside profiled steps.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use askama::Template;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use itertools::Itertools;
use miniprof_core::{MiniProfiler, RenderOptions};
use miniprof_schemas::{CustomTiming, ExecuteType, SqlTiming};
use miniprof_web::{Profiled, profile_layer, render_includes_for, resources_router};
use tracing::{error, info};

/// Serves the demo app on `addr` until Ctrl+C.
pub async fn run(mp: MiniProfiler, addr: SocketAddr, open_browser: bool) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let url = format!("http://{addr}/");

    eprintln!("Listening on {url}");
    if open_browser {
        let _ = open::that(&url);
    }

    axum::serve(listener, router(mp))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

pub(crate) fn router(mp: MiniProfiler) -> Router {
    let render = Arc::new(mp.render_options().clone());
    Router::new()
        .route("/", get(index))
        .route("/api/orders", get(api_orders))
        .with_state(render)
        .layer(profile_layer(mp.clone()))
        .merge(resources_router(mp))
}

struct Order {
    id: u32,
    lines: u32,
    total: String,
}

#[derive(Template)]
#[template(path = "demo.html")]
struct OrdersPage<'a> {
    orders: &'a [Order],
    includes: String,
}

async fn index(
    State(render): State<Arc<RenderOptions>>,
    profiled: Profiled,
) -> Result<Html<String>, AppError> {
    let orders = load_orders(&profiled).await;
    let includes = match &profiled.0 {
        Some(handle) => render_includes_for(handle.id(), &render)?,
        None => String::new(),
    };
    let page = profiled.step("render page", || {
        OrdersPage {
            orders: &orders,
            includes,
        }
        .render()
    })?;
    Ok(Html(page))
}

async fn api_orders(profiled: Profiled) -> String {
    let orders = load_orders(&profiled).await;
    profiled.step("format", || {
        orders
            .iter()
            .map(|o| format!("{}\t{}\t{}", o.id, o.lines, o.total))
            .join("\n")
    })
}

async fn load_orders(profiled: &Profiled) -> Vec<Order> {
    profiled
        .step_async("load orders", async {
            query(
                profiled,
                ExecuteType::Reader,
                "SELECT id, total FROM orders WHERE customer_id = @customer",
                12,
            )
            .await;
            let mut orders = Vec::new();
            for id in 1..=3 {
                // One query per order: shows up as duplicate SQL.
                query(
                    profiled,
                    ExecuteType::Scalar,
                    "SELECT COUNT(*) FROM order_lines WHERE order_id = @order",
                    3,
                )
                .await;
                orders.push(Order {
                    id,
                    lines: id * 2,
                    total: format!("${}.00", id * 15),
                });
            }
            rpc(profiled, "GET /quotes?orders=1,2,3", 8).await;
            orders
        })
        .await
}

fn elapsed(profiled: &Profiled) -> Option<f64> {
    profiled.0.as_ref()?.with(|p| p.elapsed_ms()).ok()
}

async fn query(profiled: &Profiled, execute_type: ExecuteType, command: &str, millis: u64) {
    let start = elapsed(profiled);
    tokio::time::sleep(Duration::from_millis(millis)).await;
    if let (Some(handle), Some(start)) = (&profiled.0, start) {
        let _ = handle.with(|p| {
            let duration = p.elapsed_ms() - start;
            p.add_sql_timing(SqlTiming::new(execute_type, command, start, duration));
        });
    }
}

async fn rpc(profiled: &Profiled, command: &str, millis: u64) {
    let start = elapsed(profiled);
    tokio::time::sleep(Duration::from_millis(millis)).await;
    if let (Some(handle), Some(start)) = (&profiled.0, start) {
        let _ = handle.with(|p| {
            let duration = p.elapsed_ms() - start;
            let custom = CustomTiming::new(start, duration)
                .with_command(command)
                .with_execute_type("GET");
            p.add_custom_timing("http", custom);
        });
    }
}

/// Handler error: logged, then answered with a bare 500.
struct AppError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "demo request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}
