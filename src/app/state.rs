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

use std::time::Duration;

use log::{info, warn};
use url::Url;

use crate::{
    clickhouse::{self, Options},
    error::AppError,
    tagged::TaggedFinder,
};

pub(crate) const DEFAULT_AUTOCOMPLETE_LIMIT: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    http: reqwest::Client,
    config: AppConfig,
}

#[derive(Clone)]
pub struct AppConfig {
    pub url: String,
    pub table: String,
    pub query_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub cardinality_limit: usize,
    pub autocomplete_days: i64,
}

impl AppState {
    pub async fn bootstrap(config: AppConfig) -> Result<Self, AppError> {
        Url::parse(&config.url).map_err(|err| {
            AppError::Internal(format!("invalid ClickHouse URL {}: {err}", config.url))
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        let state = Self { http, config };
        state.verify_connection().await?;
        Ok(state)
    }

    async fn verify_connection(&self) -> Result<(), AppError> {
        clickhouse::query(&self.http, self.url(), "SELECT 1", self.table(), self.options())
            .await?;
        info!("connected to ClickHouse at {}", self.url());
        match clickhouse::query(
            &self.http,
            self.url(),
            "SELECT version()",
            self.table(),
            self.options(),
        )
        .await
        {
            Ok(version) => info!("server version {}", version.trim()),
            Err(err) => warn!("server version unavailable: {err}"),
        }
        Ok(())
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn table(&self) -> &str {
        &self.config.table
    }

    pub fn autocomplete_days(&self) -> i64 {
        self.config.autocomplete_days
    }

    pub fn options(&self) -> Options {
        Options {
            timeout: Duration::from_secs(self.config.query_timeout_secs),
        }
    }

    /// A fresh single-use lookup session, exclusively owned by one request.
    pub fn finder(&self) -> TaggedFinder {
        TaggedFinder::new(
            self.http.clone(),
            self.config.url.clone(),
            self.config.table.clone(),
            self.options(),
            self.config.cardinality_limit,
        )
    }

    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_AUTOCOMPLETE_LIMIT)
    }
}
