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

use log::debug;

use crate::error::AppError;

/// Per-query options. The read timeout is applied per request; the connect
/// timeout lives on the shared HTTP client instead.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub timeout: Duration,
}

/// Sends `sql` to the ClickHouse HTTP interface and returns the raw
/// tab/newline-delimited response body. No retries: transport and server
/// errors are surfaced to the caller unchanged.
pub async fn query(
    http: &reqwest::Client,
    url: &str,
    sql: &str,
    table: &str,
    opts: Options,
) -> Result<String, AppError> {
    debug!("clickhouse query (table={table}): {sql}");
    let response = http
        .post(url)
        .timeout(opts.timeout)
        .body(sql.to_string())
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AppError::Clickhouse(format!(
            "query against {table} returned {status}: {}",
            body.trim()
        )));
    }
    Ok(body)
}
