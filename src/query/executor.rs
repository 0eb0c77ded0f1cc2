use super::row::Row;
use crate::error::{DriverError, Phase};
use crate::session::{Connector, CursorConnection, QueryContext};
use crate::template::{render, Params};
use crate::{PgReportError, Result};
use tracing::debug;

/// Runs a bounded query on a fresh connection and keeps nothing afterwards.
///
/// Meant for report views whose tables are small enough that one page is the
/// whole answer, so no cursor or session is worth holding open.
pub struct OneShotExecutor;

impl OneShotExecutor {
    pub async fn query<C: Connector>(
        connector: &C,
        ctx: &QueryContext,
        text: &str,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let body = statement_body(text);
        if body.is_empty() {
            return Err(PgReportError::QueryExecution {
                phase: Phase::Query,
                source: DriverError::with_code("42601", "query text is empty"),
            });
        }
        let sql = limited(body, limit);

        ctx.check(Phase::Connect)?;
        let mut conn = ctx
            .run(Phase::Connect, async {
                connector.connect().await.map_err(PgReportError::Connectivity)
            })
            .await?;

        debug!("One-shot query: {}", sql.chars().take(200).collect::<String>());
        let rows = ctx
            .run(Phase::Query, async {
                conn.query(&sql).await.map_err(|source| PgReportError::QueryExecution {
                    phase: Phase::Query,
                    source,
                })
            })
            .await?;

        debug!("One-shot query returned {} rows", rows.len());
        Ok(rows)
    }

    /// Render `template` and run it as a one-shot query
    pub async fn query_template<C: Connector>(
        connector: &C,
        ctx: &QueryContext,
        template: &str,
        params: &Params,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let sql = render(template, params);
        Self::query(connector, ctx, &sql, limit).await
    }
}

/// Strip trailing whitespace and statement terminators so the text can be
/// embedded in a larger statement
pub fn statement_body(sql: &str) -> &str {
    sql.trim_end().trim_end_matches(';').trim_end()
}

/// Append a row limit on its own line; template directives live in trailing
/// `--` comments and would swallow anything appended to the same line
fn limited(body: &str, limit: usize) -> String {
    format!("{body}\nLIMIT {limit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_body() {
        assert_eq!(statement_body("SELECT 1\n"), "SELECT 1");
        assert_eq!(statement_body("SELECT 1;\n\n"), "SELECT 1");
        assert_eq!(statement_body("SELECT 1;;"), "SELECT 1");
        assert_eq!(statement_body("  \n"), "");
    }

    #[test]
    fn test_limit_goes_on_its_own_line() {
        assert_eq!(
            limited("SELECT * FROM t -- #flag", 25),
            "SELECT * FROM t -- #flag\nLIMIT 25"
        );
    }
}
