//! Relational compiler
//!
//! Every column is fully qualified by its table name; no table aliases are
//! introduced. The join tree is rendered as LEFT JOINs so fact rows without a
//! matching dimension row survive with a NULL group, and measures are
//! null-safe (`SUM(COALESCE(x, 0))`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::planner::{PlanFilter, QueryPlan};
use super::{CompiledQuery, Compiler, Dialect};
use crate::error::{QueryBridgeError, Result};
use crate::intent::{format_number, Aggregation, ColumnRef, FilterOp, FilterValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlFlavor {
    /// Double-quoted identifiers, `LIMIT`
    Ansi,
    /// Bracketed identifiers, `TOP`
    TSql,
}

impl SqlFlavor {
    pub fn dialect(&self) -> Dialect {
        match self {
            SqlFlavor::Ansi => Dialect::AnsiSql,
            SqlFlavor::TSql => Dialect::TSql,
        }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            SqlFlavor::Ansi => format!("\"{}\"", ident.replace('"', "\"\"")),
            SqlFlavor::TSql => format!("[{}]", ident.replace(']', "]]")),
        }
    }

    fn column(&self, c: &ColumnRef) -> String {
        format!("{}.{}", self.quote(&c.table), self.quote(&c.column))
    }

    fn literal(&self, value: &FilterValue) -> String {
        match value {
            FilterValue::Bool(b) => match self {
                SqlFlavor::Ansi => (if *b { "TRUE" } else { "FALSE" }).to_string(),
                SqlFlavor::TSql => (if *b { "1" } else { "0" }).to_string(),
            },
            FilterValue::Number(n) => format_number(*n),
            FilterValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            FilterValue::List(items) => format!(
                "({})",
                items.iter().map(|i| self.literal(i)).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl fmt::Display for SqlFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlFlavor::Ansi => write!(f, "ansi"),
            SqlFlavor::TSql => write!(f, "tsql"),
        }
    }
}

impl FromStr for SqlFlavor {
    type Err = QueryBridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ansi" | "postgres" | "postgresql" => Ok(SqlFlavor::Ansi),
            "tsql" | "t-sql" | "mssql" | "azuresql" => Ok(SqlFlavor::TSql),
            other => Err(QueryBridgeError::Config(format!("unknown SQL flavor '{}'", other))),
        }
    }
}

pub struct RelationalCompiler {
    flavor: SqlFlavor,
}

impl RelationalCompiler {
    pub fn new(flavor: SqlFlavor) -> Self {
        Self { flavor }
    }

    /// Escape `LIKE` wildcards (and T-SQL's `[` class) with `\`.
    fn escape_like(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            if matches!(c, '\\' | '%' | '_') || (c == '[' && self.flavor == SqlFlavor::TSql) {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    /// Text compares case-insensitively, the way the tabular model does.
    fn predicate(&self, filter: &PlanFilter) -> String {
        let column = self.flavor.column(&filter.column);
        if filter.op == FilterOp::Contains {
            let pattern = format!("%{}%", self.escape_like(&filter.value.as_text().to_lowercase()));
            return format!(
                "LOWER({}) LIKE {} ESCAPE '\\'",
                column,
                self.flavor.literal(&FilterValue::Text(pattern))
            );
        }
        let (target, value) = if filter.value.is_text() {
            (format!("LOWER({})", column), filter.value.to_lowercase())
        } else {
            (column, filter.value.clone())
        };
        match filter.op {
            FilterOp::In => {
                let list = match value {
                    FilterValue::List(_) => value,
                    single => FilterValue::List(vec![single]),
                };
                format!("{} IN {}", target, self.flavor.literal(&list))
            }
            op => format!("{} {} {}", target, op.symbol(), self.flavor.literal(&value)),
        }
    }

    fn measure_expr(&self, aggregation: Aggregation, column: Option<&ColumnRef>) -> String {
        match (aggregation, column) {
            (Aggregation::Sum, Some(c)) => format!("SUM(COALESCE({}, 0))", self.flavor.column(c)),
            (Aggregation::Avg, Some(c)) => match self.flavor {
                SqlFlavor::Ansi => format!("AVG({})", self.flavor.column(c)),
                SqlFlavor::TSql => format!("AVG(CAST({} AS FLOAT))", self.flavor.column(c)),
            },
            (Aggregation::Count, Some(c)) => format!("COUNT({})", self.flavor.column(c)),
            _ => "COUNT(*)".to_string(),
        }
    }
}

impl Compiler for RelationalCompiler {
    fn dialect(&self) -> Dialect {
        self.flavor.dialect()
    }

    fn compile(&self, plan: &QueryPlan) -> Result<CompiledQuery> {
        let q = |ident: &str| self.flavor.quote(ident);

        let mut select: Vec<String> = plan
            .columns
            .iter()
            .map(|c| format!("{} AS {}", self.flavor.column(&c.column), q(&c.alias)))
            .collect();
        if let Some(measure) = &plan.measure {
            select.push(format!(
                "{} AS {}",
                self.measure_expr(measure.aggregation, measure.column.as_ref()),
                q(&measure.alias)
            ));
        }

        let top = match (self.flavor, plan.limit) {
            (SqlFlavor::TSql, Some(n)) => format!("TOP {} ", n),
            _ => String::new(),
        };
        let mut lines = vec![
            format!("SELECT {}{}", top, select.join(", ")),
            format!("FROM {}", q(&plan.base_table)),
        ];
        for join in &plan.joins {
            lines.push(format!(
                "LEFT JOIN {} ON {}.{} = {}.{}",
                q(&join.to_table),
                q(&join.from_table),
                q(&join.from_column),
                q(&join.to_table),
                q(&join.to_column)
            ));
        }
        if !plan.filters.is_empty() {
            let predicates: Vec<String> = plan.filters.iter().map(|f| self.predicate(f)).collect();
            lines.push(format!("WHERE {}", predicates.join(" AND ")));
        }
        if plan.is_aggregate() && !plan.columns.is_empty() {
            let groups: Vec<String> =
                plan.columns.iter().map(|c| self.flavor.column(&c.column)).collect();
            lines.push(format!("GROUP BY {}", groups.join(", ")));
        }
        if let (Some(sort), Some(alias)) = (plan.sort, plan.sort_alias()) {
            lines.push(format!(
                "ORDER BY {} {}",
                q(alias),
                if sort.descending { "DESC" } else { "ASC" }
            ));
        }
        if let (SqlFlavor::Ansi, Some(n)) = (self.flavor, plan.limit) {
            lines.push(format!("LIMIT {}", n));
        }

        let output_columns: Vec<String> =
            plan.output_aliases().into_iter().map(|(a, _)| a).collect();
        Ok(CompiledQuery::new(
            self.flavor.dialect(),
            lines.join("\n"),
            output_columns.clone(),
            output_columns,
        ))
    }
}
