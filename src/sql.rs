use std::fmt;

/// Accumulates boolean fragments into a single predicate. Every fragment is
/// parenthesized on its own; fragments are joined by the operator chosen per
/// call, so `and`/`or` can be mixed.
#[derive(Default)]
pub struct Where {
    stmt: String,
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(&mut self, expr: &str) {
        self.join("AND", expr);
    }

    #[allow(dead_code)]
    pub fn or(&mut self, expr: &str) {
        self.join("OR", expr);
    }

    fn join(&mut self, op: &str, expr: &str) {
        if expr.is_empty() {
            return;
        }
        if self.stmt.is_empty() {
            self.stmt = format!("({expr})");
        } else {
            self.stmt = format!("{} {op} ({expr})", self.stmt);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stmt.is_empty()
    }

    /// Renders the accumulated predicate with a `WHERE` prefix, or an empty
    /// string when nothing was accumulated.
    pub fn sql(&self) -> String {
        if self.stmt.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.stmt)
        }
    }
}

impl fmt::Display for Where {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stmt)
    }
}

/// Renders `value` as a ClickHouse string literal. Every user-supplied key or
/// value must pass through here before it is placed into generated SQL.
pub fn q(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}
