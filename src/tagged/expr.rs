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

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, multispace0, none_of},
    combinator::{all_consuming, cut, map},
    error::{Error as NomError, context},
    multi::{fold_many0, separated_list1},
    sequence::{delimited, preceded},
};

use super::TagExprError;

type NomResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

/// Parses a `seriesByTag('k1=v1', 'k2!=v2', ...)` call into its raw string
/// arguments. Empty arguments are dropped; a call with no remaining argument,
/// a different function name, non-string arguments, or trailing garbage is
/// rejected as a whole.
pub fn parse_series_by_tag(query: &str) -> Result<Vec<String>, TagExprError> {
    let (_, args) = all_consuming(delimited(multispace0, call, multispace0))
        .parse(query)
        .map_err(|_| TagExprError::InvalidCall(query.to_string()))?;
    let args: Vec<String> = args.into_iter().filter(|arg| !arg.is_empty()).collect();
    if args.is_empty() {
        return Err(TagExprError::InvalidCall(query.to_string()));
    }
    Ok(args)
}

fn call(input: &str) -> NomResult<'_, Vec<String>> {
    let (input, _) = tag("seriesByTag")(input)?;
    context(
        "seriesByTag arguments",
        delimited(
            preceded(multispace0, char('(')),
            separated_list1(
                preceded(multispace0, char(',')),
                preceded(multispace0, string_literal),
            ),
            preceded(multispace0, char(')')),
        ),
    )
    .parse(input)
}

fn string_literal(input: &str) -> NomResult<'_, String> {
    context(
        "string literal",
        alt((single_quoted_literal, double_quoted_literal)),
    )
    .parse(input)
}

fn single_quoted_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('\''),
        cut(fold_many0(
            alt((none_of("\\'"), escaped_char)),
            String::new,
            |mut acc, item| {
                acc.push(item);
                acc
            },
        )),
        char('\''),
    )
    .parse(input)
}

fn double_quoted_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('"'),
        cut(fold_many0(
            alt((none_of("\\\""), escaped_char)),
            String::new,
            |mut acc, item| {
                acc.push(item);
                acc
            },
        )),
        char('"'),
    )
    .parse(input)
}

fn escaped_char(input: &str) -> NomResult<'_, char> {
    preceded(
        char('\\'),
        alt((
            char('\\'),
            char('\''),
            char('"'),
            map(char('n'), |_| '\n'),
            map(char('t'), |_| '\t'),
        )),
    )
    .parse(input)
}
