// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;

use app::{AppConfig, AppState, router};
use clap::Parser;
use error::AppError;
use log::{LevelFilter, info};

mod app;
mod clickhouse;
mod error;
mod sql;
mod tagged;

#[derive(Debug, Parser)]
#[command(author, version, about, disable_help_subcommand = true)]
struct Args {
    /// ClickHouse HTTP endpoint, e.g. http://localhost:8123
    #[arg(long = "url", env = "CLICKHOUSE_URL", default_value = "http://127.0.0.1:8123")]
    url: String,
    /// Table holding the tagged-series index
    #[arg(long, env = "TAGGED_TABLE", default_value = "graphite_tagged")]
    table: String,
    /// HTTP bind address for the adapter server
    #[arg(long = "bind", env = "BIND_ADDR", default_value = "0.0.0.0:9090")]
    bind: SocketAddr,
    /// Read timeout for ClickHouse queries, in seconds
    #[arg(long = "query-timeout", env = "QUERY_TIMEOUT", default_value_t = 60)]
    query_timeout: u64,
    /// Connect timeout for ClickHouse, in seconds
    #[arg(long = "connect-timeout", env = "CONNECT_TIMEOUT", default_value_t = 1)]
    connect_timeout: u64,
    /// Row cap for the per-term cardinality sampling query
    #[arg(long = "cardinality-limit", env = "CARDINALITY_LIMIT", default_value_t = 10_000)]
    cardinality_limit: usize,
    /// How many days back autocomplete looks for tag data
    #[arg(long = "autocomplete-days", env = "AUTOCOMPLETE_DAYS", default_value_t = 7)]
    autocomplete_days: i64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let args = Args::parse();
    info!(
        "starting clickhouse-tags-adapter (table={}, bind={})",
        args.table, args.bind
    );
    let config = AppConfig {
        url: args.url.clone(),
        table: args.table.clone(),
        query_timeout_secs: args.query_timeout,
        connect_timeout_secs: args.connect_timeout,
        cardinality_limit: args.cardinality_limit,
        autocomplete_days: args.autocomplete_days,
    };
    info!("bootstrapping application state");
    let state = AppState::bootstrap(config).await?;
    info!("router initialized, preparing HTTP server");
    let app = router(state);

    info!("binding TCP listener on {}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind listener: {err}")))?;
    info!("clickhouse-tags-adapter listening on {}", args.bind);
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;
    Ok(())
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_default_env().init();
    } else {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Warn)
            .filter_module("clickhouse_tags_adapter", LevelFilter::Info)
            .init();
    }
}
