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

mod expr;
mod finder;
mod terms;

pub use expr::parse_series_by_tag;
pub use finder::{TaggedFinder, abs, make_tagged_where};
pub use terms::{NAME_TAG, TaggedTerm, TermOp, parse_terms};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagExprError {
    #[error("wrong seriesByTag expr: {0:?}")]
    MalformedExpression(String),
    #[error("wrong seriesByTag call: {0:?}")]
    InvalidCall(String),
}
