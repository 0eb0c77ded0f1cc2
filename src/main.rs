use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use pgreport::config::Config;
use pgreport::{render, CursorPool, Direction, PgConnector, QueryContext, Row};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    // Display version
    info!("pgreport v{}", env!("CARGO_PKG_VERSION"));

    let template_path = config
        .template
        .clone()
        .context("no report template given (use --template)")?;
    let template = std::fs::read_to_string(&template_path)
        .with_context(|| format!("Failed to read template {}", template_path.display()))?;
    let params = config.template_params();

    if config.render_only {
        print!("{}", render(&template, &params));
        return Ok(());
    }

    let pool = Arc::new(CursorPool::connect(config.pg_config()?, config.pool_config()?)?);

    // Refuse to start against an unreachable database
    pool.ping(config.ping_timeout_duration())
        .await
        .context("Database health check failed")?;
    info!("Database reachable");

    if config.one_shot {
        let ctx = QueryContext::with_timeout(config.query_timeout_duration());
        let rows = pool
            .query_template(&ctx, &template, &params, pool.default_page_size())
            .await?;
        print_rows(&rows)?;
        return Ok(());
    }

    pool.start_reaper();

    let session_id = config.session.clone().unwrap_or_else(CursorPool::<PgConnector>::new_session_id);
    let mut page_size = pool.default_page_size();
    let ctx = QueryContext::with_timeout(config.query_timeout_duration());
    let rows = pool
        .execute_query(&ctx, &session_id, &template, page_size, &params)
        .await?;
    info!("Session {} opened", session_id);
    print_rows(&rows)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let command = line.trim();

        match command.to_ascii_lowercase().as_str() {
            "" => continue,
            "q" | "quit" | "exit" => break,
            "size" => {
                // Reopen the report with the next selectable page size
                page_size = pool.next_page_size(page_size);
                let ctx = QueryContext::with_timeout(config.query_timeout_duration());
                match pool
                    .execute_query(&ctx, &session_id, &template, page_size, &params)
                    .await
                {
                    Ok(rows) => {
                        info!("Page size is now {}", page_size);
                        print_rows(&rows)?;
                    }
                    Err(e) => {
                        error!("[{}] {}", e.sqlstate(), e);
                        break;
                    }
                }
            }
            _ => {
                let direction: Direction = match command.parse() {
                    Ok(direction) => direction,
                    Err(e) => {
                        warn!("{} (commands: first, next, prev, size, quit)", e);
                        continue;
                    }
                };
                let ctx = QueryContext::with_timeout(config.query_timeout_duration());
                match pool.fetch_page(&ctx, &session_id, direction).await {
                    Ok(rows) => print_rows(&rows)?,
                    Err(e) if e.is_cancelled() => warn!("[{}] {}", e.sqlstate(), e),
                    Err(e) => {
                        error!("[{}] {}", e.sqlstate(), e);
                        break;
                    }
                }
            }
        }
    }

    pool.shutdown().await;
    Ok(())
}

/// Write rows to stdout as JSON lines
fn print_rows(rows: &[Row]) -> Result<()> {
    for row in rows {
        println!("{}", serde_json::to_string(row)?);
    }
    if rows.is_empty() {
        info!("No rows");
    }
    Ok(())
}
