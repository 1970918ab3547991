//! Multidimensional (DAX) compiler
//!
//! - DirectFilter: `SUMMARIZECOLUMNS` over base-table columns with
//!   `FILTER(ALL(col), ...)` filter arguments
//! - RelationshipLookup: `ADDCOLUMNS` one computed column per cross-table
//!   value, resolved by nested `LOOKUPVALUE` along the join path, then
//!   `GROUPBY` / `SELECTCOLUMNS` on the computed columns. Model
//!   relationships are never consulted.
//! - RelationshipDeclared: `SUMMARIZECOLUMNS` over dimension columns,
//!   relying on attested active relationships for filter propagation

use super::planner::{PlanFilter, PlanMeasure, QueryPlan, SortKey};
use super::{CompiledQuery, Compiler, Dialect, Pattern};
use crate::catalog::JoinPath;
use crate::error::Result;
use crate::intent::{format_number, Aggregation, ColumnRef, FilterOp, FilterValue};

pub struct MultidimensionalCompiler;

impl Default for MultidimensionalCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// How one output column is referenced inside the query and named in the result.
struct Output {
    reference: String,
    name: String,
}

impl MultidimensionalCompiler {
    pub fn new() -> Self {
        Self
    }
}

pub fn table_ref(table: &str) -> String {
    format!("'{}'", table.replace('\'', "''"))
}

pub fn column_ref(c: &ColumnRef) -> String {
    format!("{}[{}]", table_ref(&c.table), c.column.replace(']', "]]"))
}

/// Result-set name the engine gives a plain column reference.
fn result_name(c: &ColumnRef) -> String {
    format!("{}[{}]", c.table, c.column)
}

fn string_literal(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn literal(value: &FilterValue) -> String {
    match value {
        FilterValue::Bool(b) => (if *b { "TRUE()" } else { "FALSE()" }).to_string(),
        FilterValue::Number(n) => format_number(*n),
        FilterValue::Text(s) => string_literal(s),
        FilterValue::List(items) => {
            format!("{{{}}}", items.iter().map(literal).collect::<Vec<_>>().join(", "))
        }
    }
}

/// Filter test on `target`. A blank compares as 0 or "" in DAX where SQL
/// NULL matches nothing, so nullable values are excluded explicitly.
fn predicate(target: &str, filter: &PlanFilter) -> String {
    let value = &filter.value;
    let test = match filter.op {
        FilterOp::Contains => {
            format!("CONTAINSSTRING({}, {})", target, string_literal(&value.as_text()))
        }
        FilterOp::In => {
            let list = match value {
                FilterValue::List(_) => literal(value),
                single => format!("{{{}}}", literal(single)),
            };
            format!("{} IN {}", target, list)
        }
        op => format!("{} {} {}", target, op.symbol(), literal(value)),
    };
    if filter.nullable {
        format!("NOT ISBLANK({}) && {}", target, test)
    } else {
        test
    }
}

/// `LOOKUPVALUE` chain walking `path` from the base table to `column`.
pub fn lookup_expr(column: &ColumnRef, path: &JoinPath) -> String {
    let Some(first) = path.first() else {
        return column_ref(column);
    };
    let mut key = column_ref(&ColumnRef::new(&first.from_table, &first.from_column));
    for (i, edge) in path.iter().enumerate() {
        let wanted = match path.get(i + 1) {
            Some(next) => next.from_column.as_str(),
            None => column.column.as_str(),
        };
        key = format!(
            "LOOKUPVALUE({}, {}, {})",
            column_ref(&ColumnRef::new(&edge.to_table, wanted)),
            column_ref(&ColumnRef::new(&edge.to_table, &edge.to_column)),
            key
        );
    }
    key
}

/// `NAME(` args one per line `)`, nested arguments indented.
fn call(name: &str, args: &[String]) -> String {
    let body: Vec<String> = args
        .iter()
        .map(|a| a.lines().map(|l| format!("    {}", l)).collect::<Vec<_>>().join("\n"))
        .collect();
    format!("{}(\n{}\n)", name, body.join(",\n"))
}

fn named(alias: &str, expr: &str) -> String {
    format!("{}, {}", string_literal(alias), expr)
}

/// Where a measure is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// A single row over the whole (filtered) table
    Total,
    /// `CURRENTGROUP()` inside `GROUPBY`
    CurrentGroup,
    /// A `SUMMARIZECOLUMNS` group; a blank measure removes the row
    Summarized,
}

/// Counts add `+ 0` so an empty count is 0 like SQL `COUNT`. Under
/// `SUMMARIZECOLUMNS` that only applies to groups with rows, otherwise every
/// combination of group values would come back.
fn measure_expr(measure: &PlanMeasure, table: &str, scope: Scope) -> String {
    match (measure.aggregation, measure.column.as_ref(), scope) {
        (Aggregation::Sum, Some(c), _) => {
            format!("SUMX({}, COALESCE({}, 0))", table, column_ref(c))
        }
        (Aggregation::Avg, Some(c), _) => format!("AVERAGEX({}, {})", table, column_ref(c)),
        (Aggregation::Count, Some(c), Scope::Summarized) => format!(
            "IF(COUNTROWS({}) > 0, COUNTX({}, {}) + 0)",
            table,
            table,
            column_ref(c)
        ),
        (Aggregation::Count, Some(c), _) => format!("COUNTX({}, {}) + 0", table, column_ref(c)),
        // CURRENTGROUP() only accepts X aggregations.
        (_, _, Scope::CurrentGroup) => format!("COUNTX({}, 1)", table),
        (_, _, Scope::Total) => format!("COUNTROWS({}) + 0", table),
        (_, _, Scope::Summarized) => format!("COUNTROWS({})", table),
    }
}

impl MultidimensionalCompiler {
    fn filter_target(&self, plan: &QueryPlan, filter: &PlanFilter) -> String {
        if filter.is_local() || plan.pattern != Pattern::RelationshipLookup {
            column_ref(&filter.column)
        } else {
            format!("[{}]", filter.alias)
        }
    }

    fn filtered(&self, plan: &QueryPlan, source: String) -> String {
        if plan.filters.is_empty() {
            return source;
        }
        let predicates: Vec<String> = plan
            .filters
            .iter()
            .map(|f| predicate(&self.filter_target(plan, f), f))
            .collect();
        call("FILTER", &[source, predicates.join(" && ")])
    }

    /// `FILTER(ALL(col), pred)` filter arguments for SUMMARIZECOLUMNS/CALCULATE.
    fn filter_args(&self, plan: &QueryPlan) -> Vec<String> {
        plan.filters
            .iter()
            .map(|f| {
                let target = column_ref(&f.column);
                format!("FILTER(ALL({}), {})", target, predicate(&target, f))
            })
            .collect()
    }

    /// Base table with one computed column per cross-table value.
    fn lookup_source(&self, plan: &QueryPlan) -> (String, Vec<String>) {
        let lookups = plan.lookup_columns();
        let base = table_ref(&plan.base_table);
        if lookups.is_empty() {
            return (base, Vec::new());
        }
        let mut args = vec![base];
        let mut aliases = Vec::new();
        for lookup in lookups {
            args.push(named(lookup.alias, &lookup_expr(lookup.column, lookup.path)));
            aliases.push(lookup.alias.to_string());
        }
        (call("ADDCOLUMNS", &args), aliases)
    }

    fn render(&self, plan: &QueryPlan) -> (String, Vec<Output>, Vec<String>) {
        let base = table_ref(&plan.base_table);
        let mut aliases: Vec<String> = Vec::new();
        let mut outputs: Vec<Output> = Vec::new();

        let expr = match (plan.pattern, &plan.measure) {
            // Listing
            (pattern, None) => {
                let (source, lookup_aliases) = match pattern {
                    Pattern::RelationshipLookup => self.lookup_source(plan),
                    _ => (base.clone(), Vec::new()),
                };
                aliases.extend(lookup_aliases);
                let source = self.filtered_listing(plan, source);
                let mut args = vec![source];
                for column in &plan.columns {
                    let value = match pattern {
                        _ if column.is_local() => column_ref(&column.column),
                        Pattern::RelationshipLookup => format!("[{}]", column.alias),
                        _ => format!("RELATED({})", column_ref(&column.column)),
                    };
                    args.push(named(&column.alias, &value));
                    outputs.push(Output {
                        reference: format!("[{}]", column.alias),
                        name: format!("[{}]", column.alias),
                    });
                    if !aliases.contains(&column.alias) {
                        aliases.push(column.alias.clone());
                    }
                }
                call("SELECTCOLUMNS", &args)
            }

            // Ungrouped aggregate: a single row
            (pattern, Some(measure)) if plan.columns.is_empty() => {
                aliases.push(measure.alias.clone());
                outputs.push(Output {
                    reference: format!("[{}]", measure.alias),
                    name: format!("[{}]", measure.alias),
                });
                let value = match pattern {
                    Pattern::RelationshipDeclared => {
                        let mut args = vec![measure_expr(measure, &base, Scope::Total)];
                        args.extend(self.filter_args(plan));
                        if args.len() == 1 {
                            args.remove(0)
                        } else {
                            call("CALCULATE", &args)
                        }
                    }
                    _ => {
                        let (source, lookup_aliases) = self.lookup_source(plan);
                        aliases.extend(lookup_aliases);
                        let source = self.filtered(plan, source);
                        measure_expr(measure, &source, Scope::Total)
                    }
                };
                call("ROW", &[named(&measure.alias, &value)])
            }

            (Pattern::RelationshipLookup, Some(measure)) => {
                let (source, lookup_aliases) = self.lookup_source(plan);
                aliases.extend(lookup_aliases);
                let mut args = vec![self.filtered(plan, source)];
                for column in &plan.columns {
                    let (reference, name) = if column.is_local() {
                        (column_ref(&column.column), result_name(&column.column))
                    } else {
                        (format!("[{}]", column.alias), format!("[{}]", column.alias))
                    };
                    args.push(reference.clone());
                    outputs.push(Output { reference, name });
                }
                args.push(named(
                    &measure.alias,
                    &measure_expr(measure, "CURRENTGROUP()", Scope::CurrentGroup),
                ));
                aliases.push(measure.alias.clone());
                outputs.push(Output {
                    reference: format!("[{}]", measure.alias),
                    name: format!("[{}]", measure.alias),
                });
                call("GROUPBY", &args)
            }

            // DirectFilter and RelationshipDeclared share SUMMARIZECOLUMNS
            (_, Some(measure)) => {
                let mut args: Vec<String> = Vec::new();
                for column in &plan.columns {
                    let reference = column_ref(&column.column);
                    args.push(reference.clone());
                    outputs.push(Output {
                        reference,
                        name: result_name(&column.column),
                    });
                }
                args.extend(self.filter_args(plan));
                args.push(named(
                    &measure.alias,
                    &measure_expr(measure, &base, Scope::Summarized),
                ));
                aliases.push(measure.alias.clone());
                outputs.push(Output {
                    reference: format!("[{}]", measure.alias),
                    name: format!("[{}]", measure.alias),
                });
                call("SUMMARIZECOLUMNS", &args)
            }
        };

        (expr, outputs, aliases)
    }

    fn filtered_listing(&self, plan: &QueryPlan, source: String) -> String {
        if plan.filters.is_empty() {
            return source;
        }
        let predicates: Vec<String> = plan
            .filters
            .iter()
            .map(|f| {
                let target = match plan.pattern {
                    Pattern::RelationshipDeclared if !f.is_local() => {
                        format!("RELATED({})", column_ref(&f.column))
                    }
                    _ => self.filter_target(plan, f),
                };
                predicate(&target, f)
            })
            .collect();
        call("FILTER", &[source, predicates.join(" && ")])
    }
}

impl Compiler for MultidimensionalCompiler {
    fn dialect(&self) -> Dialect {
        Dialect::Dax
    }

    fn compile(&self, plan: &QueryPlan) -> Result<CompiledQuery> {
        let (mut expr, outputs, aliases) = self.render(plan);

        let sort_ref = plan.sort.and_then(|sort| {
            let index = match sort.key {
                SortKey::Measure => outputs.len().checked_sub(1)?,
                SortKey::Column(i) => i,
            };
            let direction = if sort.descending { "DESC" } else { "ASC" };
            outputs.get(index).map(|o| (o.reference.clone(), direction))
        });
        let single_row = plan.is_aggregate() && plan.columns.is_empty();
        if let (Some(n), Some((reference, direction)), false) =
            (plan.limit, &sort_ref, single_row)
        {
            expr = call(
                "TOPN",
                &[n.to_string(), expr, reference.clone(), direction.to_string()],
            );
        }

        let mut text = format!("EVALUATE\n{}", expr);
        if let (Some((reference, direction)), false) = (&sort_ref, single_row) {
            text.push_str(&format!("\nORDER BY {} {}", reference, direction));
        }

        Ok(CompiledQuery::new(
            Dialect::Dax,
            text,
            outputs.into_iter().map(|o| o.name).collect(),
            aliases,
        ))
    }
}
