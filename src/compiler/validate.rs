//! Static checks on generated query text
//!
//! - Delimiters balance (strings and quoted identifiers skipped)
//! - Every table/column referenced exists in the catalog, every bare name is
//!   an alias the query itself declares
//! - DAX: SUMMARIZECOLUMNS must not group columns of several tables unless
//!   the relationships between them were attested

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{visit_expressions, visit_relations, Expr, ObjectName};
use sqlparser::dialect::{GenericDialect, MsSqlDialect};
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tracing::warn;

use super::{CompiledQuery, Dialect, Pattern};
use crate::catalog::SchemaCatalog;
use crate::error::{QueryBridgeError, Result};

/// A plain `'table'[column]` argument.
static COLUMN_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^'((?:[^']|'')+)'\[(?:[^\]]|\]\])+\]$").expect("column argument pattern")
});

pub fn validate(query: &CompiledQuery, catalog: &SchemaCatalog, pattern: Pattern) -> Result<()> {
    let problems = match check_balanced(&query.text, query.dialect) {
        Err(problem) => vec![problem],
        Ok(()) if query.dialect.is_relational() => check_sql(query, catalog),
        Ok(()) => check_dax(query, catalog, pattern),
    };
    if problems.is_empty() {
        return Ok(());
    }
    let message = problems.join("; ");
    warn!("Rejected generated {} query: {}", query.dialect, message);
    Err(QueryBridgeError::InvalidQuery {
        dialect: query.dialect.to_string(),
        message,
        query_text: query.text.clone(),
    })
}

/// Consume a quoted region up to `close`; a doubled `close` is an escape.
fn skip_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, close: char) -> bool {
    while let Some(c) = chars.next() {
        if c == close {
            if chars.peek() == Some(&close) {
                chars.next();
            } else {
                return true;
            }
        }
    }
    false
}

pub fn check_balanced(text: &str, dialect: Dialect) -> std::result::Result<(), String> {
    let brackets_quote = matches!(dialect, Dialect::TSql | Dialect::Dax);
    let mut stack: Vec<char> = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                if !skip_quoted(&mut chars, c) {
                    return Err(format!("unterminated {} quote", c));
                }
            }
            '[' if brackets_quote => {
                if !skip_quoted(&mut chars, ']') {
                    return Err("unterminated '[' identifier".to_string());
                }
            }
            '(' | '{' | '[' => stack.push(c),
            ')' | '}' | ']' => {
                let expected = match c {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                if stack.pop() != Some(expected) {
                    return Err(format!("unbalanced '{}'", c));
                }
            }
            _ => {}
        }
    }
    match stack.last() {
        Some(open) => Err(format!("unclosed '{}'", open)),
        None => Ok(()),
    }
}

fn check_sql(query: &CompiledQuery, catalog: &SchemaCatalog) -> Vec<String> {
    let parsed = match query.dialect {
        Dialect::TSql => Parser::parse_sql(&MsSqlDialect {}, &query.text),
        _ => Parser::parse_sql(&GenericDialect {}, &query.text),
    };
    let statements = match parsed {
        Ok(statements) => statements,
        Err(e) => return vec![format!("does not parse: {}", e)],
    };

    let mut problems: Vec<String> = Vec::new();
    let mut tables: BTreeSet<String> = BTreeSet::new();
    let _ = visit_relations(&statements, |name: &ObjectName| {
        let table = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
        if catalog.table(&table).is_none() {
            problems.push(format!("unknown table {}", table));
        }
        tables.insert(table);
        ControlFlow::<()>::Continue(())
    });
    let _ = visit_expressions(&statements, |expr: &Expr| {
        match expr {
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let table = &parts[parts.len() - 2].value;
                let column = &parts[parts.len() - 1].value;
                if !tables.contains(table) {
                    problems.push(format!("{}.{} references a table outside FROM", table, column));
                } else if !catalog.has_column(table, column) {
                    problems.push(format!("unknown column {}.{}", table, column));
                }
            }
            Expr::Identifier(ident) => {
                let known = query.aliases.contains(&ident.value)
                    || tables.iter().any(|t| catalog.has_column(t, &ident.value));
                if !known {
                    problems.push(format!("unknown identifier {}", ident.value));
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    problems
}

#[derive(Debug, PartialEq)]
enum DaxRef {
    Table(String),
    Column(String, String),
    Bare(String),
}

/// Name up to the closing `]`; `]]` stands for a literal `]`.
fn bracket_name(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(c) = chars.next() {
        if c == ']' {
            if chars.peek() == Some(&']') {
                chars.next();
            } else {
                break;
            }
        }
        name.push(c);
    }
    name
}

/// Table, column and bare bracket references outside string literals.
fn dax_refs(text: &str) -> Vec<DaxRef> {
    let mut refs = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                skip_quoted(&mut chars, '"');
            }
            '\'' => {
                let mut name = String::new();
                while let Some(n) = chars.next() {
                    if n == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            name.push('\'');
                            continue;
                        }
                        break;
                    }
                    name.push(n);
                }
                if chars.peek() == Some(&'[') {
                    chars.next();
                    let column = bracket_name(&mut chars);
                    refs.push(DaxRef::Column(name, column));
                } else {
                    refs.push(DaxRef::Table(name));
                }
            }
            '[' => {
                let name = bracket_name(&mut chars);
                refs.push(DaxRef::Bare(name));
            }
            _ => {}
        }
    }
    refs
}

fn check_dax(query: &CompiledQuery, catalog: &SchemaCatalog, pattern: Pattern) -> Vec<String> {
    let mut problems: Vec<String> = Vec::new();
    for reference in dax_refs(&query.text) {
        match reference {
            DaxRef::Table(t) if catalog.table(&t).is_none() => {
                problems.push(format!("unknown table '{}'", t))
            }
            DaxRef::Column(t, c) if !catalog.has_column(&t, &c) => {
                problems.push(format!("unknown column '{}'[{}]", t, c))
            }
            DaxRef::Bare(name) if !query.aliases.contains(&name) => {
                problems.push(format!("undeclared name [{}]", name))
            }
            _ => {}
        }
    }

    if pattern != Pattern::RelationshipDeclared {
        let tables = summarize_group_tables(&query.text);
        if tables.len() > 1 {
            problems.push(format!(
                "SUMMARIZECOLUMNS groups columns from several tables ({}) \
                 without attested relationships",
                tables.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
    }
    problems
}

/// Tables of the plain column arguments of every SUMMARIZECOLUMNS call.
fn summarize_group_tables(text: &str) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();
    let mut rest = text;
    while let Some(pos) = rest.find("SUMMARIZECOLUMNS(") {
        let after = &rest[pos + "SUMMARIZECOLUMNS(".len()..];
        for arg in top_level_args(after) {
            if let Some(caps) = COLUMN_ARG.captures(arg.trim()) {
                tables.insert(caps[1].replace("''", "'"));
            }
        }
        rest = after;
    }
    tables
}

/// Split the argument list that starts right after an opening parenthesis.
fn top_level_args(text: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '[' => quote = Some(']'),
            '(' | '{' => depth += 1,
            ')' | '}' if depth == 0 => {
                args.push(&text[start..i]);
                return args;
            }
            ')' | '}' => depth -= 1,
            ',' if depth == 0 => {
                args.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    args
}
