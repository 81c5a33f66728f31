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

use std::cmp::Ordering;

use super::TagExprError;

/// Reserved key the metric name is stored under; the public alias is `name`.
pub const NAME_TAG: &str = "__name__";

/// Declaration order doubles as the canonical sort rank: cheaper, more
/// selective operators come first so they are the default pick for the
/// indexed primary slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TermOp {
    Eq,
    Match,
    Ne,
    NotMatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedTerm {
    pub key: String,
    pub op: TermOp,
    pub value: String,
}

/// Parses raw `key[!]=[~]value` filter strings into terms and applies the
/// canonical ordering. Pure; no I/O.
pub fn parse_terms(exprs: &[String]) -> Result<Vec<TaggedTerm>, TagExprError> {
    let mut terms = Vec::with_capacity(exprs.len());
    for raw in exprs {
        terms.push(parse_term(raw)?);
    }
    terms.sort_by(canonical_order);
    Ok(terms)
}

fn parse_term(raw: &str) -> Result<TaggedTerm, TagExprError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(TagExprError::MalformedExpression(raw.to_string()));
    };
    let mut key = key.trim();
    let mut value = value.trim();

    let mut negated = false;
    if let Some(stripped) = key.strip_suffix('!') {
        negated = true;
        key = stripped.trim();
    }

    // The `~` marker only selects the operator; it is never part of the value.
    let mut regex = false;
    if let Some(stripped) = value.strip_prefix('~') {
        regex = true;
        value = stripped.trim();
    }

    let op = match (negated, regex) {
        (false, false) => TermOp::Eq,
        (false, true) => TermOp::Match,
        (true, false) => TermOp::Ne,
        (true, true) => TermOp::NotMatch,
    };

    let key = if key == "name" { NAME_TAG } else { key };

    Ok(TaggedTerm {
        key: key.to_string(),
        op,
        value: value.to_string(),
    })
}

/// Terms are grouped by operator rank; within a rank the reserved name tag
/// sorts first, since an exact name filter is usually the most selective.
fn canonical_order(a: &TaggedTerm, b: &TaggedTerm) -> Ordering {
    a.op.cmp(&b.op)
        .then_with(|| match (a.key == NAME_TAG, b.key == NAME_TAG) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => Ordering::Equal,
        })
}
