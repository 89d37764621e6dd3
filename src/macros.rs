//! Time range macros for user SQL
//!
//! Supported macros:
//! - `$__timeFrom()` - Start of the query time range as a UTC literal
//! - `$__timeTo()` - End of the query time range as a UTC literal
//! - `$__timeFilter(column)` - `column >= <from> AND column <= <to>`
//!
//! Expansion is a single pure pass over the query text. Unknown `$__name`
//! tokens are left as they are.

use crate::{DataSourceError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Time range of a single query request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }
}

/// Render a timestamp as a single-quoted RFC 3339 UTC literal
fn timestamp_literal(ts: &DateTime<Utc>) -> String {
    format!("'{}'", ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn render_time_from(range: &TimeRange, _args: &[String]) -> String {
    timestamp_literal(&range.from)
}

fn render_time_to(range: &TimeRange, _args: &[String]) -> String {
    timestamp_literal(&range.to)
}

fn render_time_filter(range: &TimeRange, args: &[String]) -> String {
    let column = args[0].trim();
    format!(
        "{} >= {} AND {} <= {}",
        column,
        timestamp_literal(&range.from),
        column,
        timestamp_literal(&range.to)
    )
}

/// A named SQL macro with a fixed argument count
#[derive(Debug, Clone, Copy)]
pub struct Macro {
    pub name: &'static str,
    pub argc: usize,
    render: fn(&TimeRange, &[String]) -> String,
}

impl Macro {
    /// Validate the argument list and render the macro
    ///
    /// A single blank argument (`$__timeFrom( )`) counts as no arguments.
    pub fn apply(&self, range: &TimeRange, args: &[String]) -> Result<String> {
        let received = match args {
            [only] if only.trim().is_empty() => 0,
            _ => args.len(),
        };
        let blank_arg = received > 0 && args.iter().any(|arg| arg.trim().is_empty());

        if received != self.argc || blank_arg {
            return Err(DataSourceError::MacroError(format!(
                "{}: unexpected number of arguments: expected {} arguments, received {}",
                self.name, self.argc, received
            )));
        }

        Ok((self.render)(range, args))
    }
}

/// Table of macros available to queries
#[derive(Debug, Clone)]
pub struct MacroTable {
    macros: Vec<Macro>,
}

impl Default for MacroTable {
    fn default() -> Self {
        Self {
            macros: vec![
                Macro {
                    name: "timeFrom",
                    argc: 0,
                    render: render_time_from,
                },
                Macro {
                    name: "timeTo",
                    argc: 0,
                    render: render_time_to,
                },
                Macro {
                    name: "timeFilter",
                    argc: 1,
                    render: render_time_filter,
                },
            ],
        }
    }
}

/// Regex for macro call sites: `$__` followed by an identifier
fn macro_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$__([A-Za-z_][A-Za-z0-9_]*)").expect("Invalid macro regex"))
}

impl MacroTable {
    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.macros.iter().find(|m| m.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.macros.iter().map(|m| m.name).collect()
    }

    /// Expand every known macro in `sql` using `range`
    ///
    /// Calls nested in another call's arguments are expanded first. Any
    /// invalid call fails the whole expansion; partially expanded SQL is
    /// never returned.
    pub fn expand(&self, sql: &str, range: &TimeRange) -> Result<String> {
        let mut expanded = String::with_capacity(sql.len());
        let mut last = 0;

        for caps in macro_regex().captures_iter(sql) {
            let (Some(call), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            // Inside the argument list of a call already consumed
            if call.start() < last {
                continue;
            }
            let Some(mac) = self.get(name.as_str()) else {
                continue;
            };

            let (args, end) = parse_arguments(sql, call.end(), mac.name)?;
            let args = args
                .iter()
                .map(|arg| self.expand(arg, range))
                .collect::<Result<Vec<_>>>()?;
            expanded.push_str(&sql[last..call.start()]);
            expanded.push_str(&mac.apply(range, &args)?);
            last = end;
        }

        expanded.push_str(&sql[last..]);
        Ok(expanded)
    }
}

/// Parse an optional parenthesised argument list starting at `start`
///
/// Returns the arguments and the byte offset just past the closing
/// parenthesis. Commas nested in parentheses or quoted strings do not split
/// arguments.
fn parse_arguments(sql: &str, start: usize, name: &str) -> Result<(Vec<String>, usize)> {
    let rest = &sql[start..];
    if !rest.starts_with('(') {
        return Ok((Vec::new(), start));
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (offset, c) in rest.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            current.push(c);
            continue;
        }

        match c {
            '(' => {
                if depth > 0 {
                    current.push(c);
                }
                depth += 1;
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    args.push(current);
                    return Ok((args, start + offset + 1));
                }
                current.push(c);
            }
            ',' if depth == 1 => args.push(std::mem::take(&mut current)),
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            _ => current.push(c),
        }
    }

    Err(DataSourceError::MacroError(format!(
        "{}: missing closing parenthesis",
        name
    )))
}

/// Expand the default macro table over `sql`
pub fn expand(sql: &str, range: &TimeRange) -> Result<String> {
    MacroTable::default().expand(sql, range)
}
