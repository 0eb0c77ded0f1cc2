//! Runs against a live server when PGREPORT_TEST_DATABASE_URL is set, e.g.
//! `PGREPORT_TEST_DATABASE_URL="host=localhost user=postgres" cargo test --test postgres_cursor_test`

use pgreport::{CursorPool, Direction, Params, PgReportError, PoolConfig, QueryContext};
use serde_json::json;
use std::time::Duration;

fn test_pool() -> Option<CursorPool> {
    let url = match std::env::var("PGREPORT_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("PGREPORT_TEST_DATABASE_URL not set, skipping");
            return None;
        }
    };
    let pg_config = url.parse().expect("invalid PGREPORT_TEST_DATABASE_URL");
    Some(CursorPool::connect(pg_config, PoolConfig::default()).unwrap())
}

fn ctx() -> QueryContext {
    QueryContext::with_timeout(Duration::from_secs(10))
}

const SERIES: &str = "SELECT n AS id, 'row-' || n AS name, n * 1.5::numeric AS amount
FROM generate_series(1, :total) AS n
WHERE n % 2 = 0 --#even_only
ORDER BY n";

#[tokio::test]
async fn test_paging_against_postgres() {
    let Some(pool) = test_pool() else { return };
    pool.ping(Duration::from_secs(5)).await.unwrap();

    let params: Params = [("total".to_string(), json!(25))].into_iter().collect();
    let ctx = ctx();

    let first = pool.execute_query(&ctx, "pg-1", SERIES, 10, &params).await.unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(first[0]["id"], json!(1));
    assert_eq!(first[0]["name"], json!("row-1"));
    assert_eq!(first[0]["amount"], json!("1.5"));

    let page = pool.fetch_page(&ctx, "pg-1", Direction::Next).await.unwrap();
    assert_eq!(page[0]["id"], json!(11));

    let page = pool.fetch_page(&ctx, "pg-1", Direction::Next).await.unwrap();
    assert_eq!(page.len(), 5);

    let page = pool.fetch_page(&ctx, "pg-1", Direction::Prev).await.unwrap();
    assert_eq!(page[0]["id"], json!(11));

    let page = pool.fetch_page(&ctx, "pg-1", Direction::Prev).await.unwrap();
    assert_eq!(page, first);

    let page = pool.fetch_page(&ctx, "pg-1", Direction::First).await.unwrap();
    assert_eq!(page, first);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_filtered_template_against_postgres() {
    let Some(pool) = test_pool() else { return };

    let params: Params = [
        ("total".to_string(), json!(10)),
        ("even_only".to_string(), json!(true)),
    ]
    .into_iter()
    .collect();

    let rows = pool.query_template(&ctx(), SERIES, &params, 100).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(4), json!(6), json!(8), json!(10)]);
}

#[tokio::test]
async fn test_declare_error_against_postgres() {
    let Some(pool) = test_pool() else { return };

    let err = pool
        .execute_query(&ctx(), "pg-2", "SELECT * FROM pgreport_missing_table", 10, &Params::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PgReportError::CursorDeclare { .. }));
    assert_eq!(err.sqlstate(), "42P01");
    assert!(!pool.has_session("pg-2"));
}

#[tokio::test]
async fn test_column_types_against_postgres() {
    let Some(pool) = test_pool() else { return };

    let sql = "SELECT interval '1 day' AS iv, ARRAY[1, 2] AS arr, inet '10.0.0.1' AS ip,
  12345678901234567890123456789012345::numeric AS big, 'NaN'::numeric AS nan,
  'a'::\"char\" AS ch, 'x'::varchar AS vc, NULL::int AS missing";
    let rows = pool.query_template(&ctx(), sql, &Params::new(), 10).await.unwrap();
    assert_eq!(rows.len(), 1);

    let row = &rows[0];
    assert_eq!(row["iv"], json!("1 day"));
    assert_eq!(row["arr"], json!([1, 2]));
    assert_eq!(row["ip"], json!("10.0.0.1"));
    assert_eq!(row["big"], json!("12345678901234567890123456789012345"));
    assert_eq!(row["nan"], json!("NaN"));
    assert_eq!(row["ch"], json!("a"));
    assert_eq!(row["vc"], json!("x"));
    assert_eq!(row["missing"], json!(null));
}
