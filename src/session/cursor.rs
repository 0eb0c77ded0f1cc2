use super::connector::CursorConnection;
use super::context::QueryContext;
use crate::error::{DriverError, Phase};
use crate::query::Row;
use crate::{PgReportError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};
use uuid::Uuid;

/// Paging direction for an open cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    First,
    Next,
    Prev,
}

impl FromStr for Direction {
    type Err = PgReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIRST" => Ok(Direction::First),
            "NEXT" => Ok(Direction::Next),
            "PREV" | "PREVIOUS" | "PRIOR" => Ok(Direction::Prev),
            _ => Err(PgReportError::InvalidParameter(format!(
                "unknown paging direction: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::First => f.write_str("FIRST"),
            Direction::Next => f.write_str("NEXT"),
            Direction::Prev => f.write_str("PREV"),
        }
    }
}

/// Where a cursor rests, as far as the session knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePosition {
    /// Declared, nothing fetched yet
    Fresh,
    /// Last fetch returned `len` rows starting at zero-based row `start`
    Page { start: u64, len: u64 },
    /// A fetch was interrupted and the server-side position is unknown
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    Relative(i64),
    Absolute(u64),
}

impl CursorMove {
    pub fn sql(&self, cursor: &str) -> String {
        match self {
            CursorMove::Relative(n) => format!("MOVE RELATIVE {n} FROM {cursor}"),
            CursorMove::Absolute(n) => format!("MOVE ABSOLUTE {n} FROM {cursor}"),
        }
    }
}

/// Positioning needed before fetching the next page, and where that page starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    pub movement: Option<CursorMove>,
    pub start: Option<u64>,
}

impl PagePlan {
    /// Position after the planned fetch returned `fetched` rows
    pub fn landed(&self, fetched: usize) -> PagePosition {
        match self.start {
            Some(start) => PagePosition::Page { start, len: fetched as u64 },
            None => PagePosition::Unknown,
        }
    }
}

impl PagePosition {
    pub fn plan(&self, direction: Direction, page_size: u64) -> PagePlan {
        match direction {
            Direction::Next => PagePlan {
                movement: None,
                start: match *self {
                    PagePosition::Fresh => Some(0),
                    PagePosition::Page { start, len } => Some(start + len),
                    PagePosition::Unknown => None,
                },
            },
            Direction::First => PagePlan {
                movement: Some(CursorMove::Absolute(0)),
                start: Some(0),
            },
            Direction::Prev => match *self {
                // A full page leaves the cursor on its last row, so stepping
                // back two pages lands right before the previous one
                PagePosition::Page { start, len } if len == page_size && start >= page_size => {
                    PagePlan {
                        movement: Some(CursorMove::Relative(-2 * page_size as i64)),
                        start: Some(start - page_size),
                    }
                }
                // Short final page, first page or an empty page past the end
                PagePosition::Page { start, .. } => {
                    let target = start.saturating_sub(page_size);
                    PagePlan {
                        movement: Some(CursorMove::Absolute(target)),
                        start: Some(target),
                    }
                }
                PagePosition::Fresh | PagePosition::Unknown => PagePlan {
                    movement: Some(CursorMove::Absolute(0)),
                    start: Some(0),
                },
            },
        }
    }
}

/// Generate a server-side cursor name
pub fn cursor_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("cur_{}", &id[..8])
}

/// An open transaction on an owned connection with one scroll cursor declared
/// inside it. The connection and the transaction end together in [`close`].
///
/// [`close`]: CursorState::close
pub struct CursorState<T: CursorConnection> {
    conn: T,
    cursor_name: String,
    page_size: usize,
    position: PagePosition,
    _permit: OwnedSemaphorePermit,
}

impl<T: CursorConnection> CursorState<T> {
    /// Begin a transaction on `conn` and declare a scroll cursor for `query`.
    ///
    /// On failure the transaction is rolled back and the connection dropped
    /// before the error is returned.
    pub async fn open(
        ctx: &QueryContext,
        session_id: &str,
        mut conn: T,
        permit: OwnedSemaphorePermit,
        query: &str,
        page_size: usize,
    ) -> Result<Self> {
        ctx.run(Phase::Begin, async {
            conn.execute("BEGIN").await.map_err(|source| PgReportError::QueryExecution {
                phase: Phase::Begin,
                source,
            })
        })
        .await?;

        let cursor_name = cursor_name();
        let declare = format!("DECLARE {cursor_name} SCROLL CURSOR FOR {query}");
        let declared = ctx
            .run(Phase::Declare, async {
                conn.execute(&declare).await.map_err(|source| PgReportError::CursorDeclare {
                    session_id: session_id.to_string(),
                    source,
                })
            })
            .await;

        if let Err(e) = declared {
            // A cancelled call may still be running on the connection, so only
            // roll back when the server answered; dropping the connection ends
            // the transaction either way
            if !e.is_cancelled() {
                if let Err(rollback_err) = conn.execute("ROLLBACK").await {
                    warn!("Rollback after failed declare for session {} failed: {}", session_id, rollback_err);
                }
            }
            return Err(e);
        }

        debug!("Declared cursor {} for session {}", cursor_name, session_id);
        Ok(CursorState {
            conn,
            cursor_name,
            page_size,
            position: PagePosition::Fresh,
            _permit: permit,
        })
    }

    pub fn cursor_name(&self) -> &str {
        &self.cursor_name
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn position(&self) -> PagePosition {
        self.position
    }

    /// Position the cursor for `direction` and fetch one page
    pub async fn fetch(&mut self, ctx: &QueryContext, direction: Direction) -> Result<Vec<Row>> {
        let plan = self.position.plan(direction, self.page_size as u64);

        if let Some(movement) = plan.movement {
            let sql = movement.sql(&self.cursor_name);
            let moved = ctx
                .run(Phase::Move, async {
                    self.conn.execute(&sql).await.map_err(|source| PgReportError::QueryExecution {
                        phase: Phase::Move,
                        source,
                    })
                })
                .await;
            if let Err(e) = moved {
                self.position = PagePosition::Unknown;
                return Err(e);
            }
        }

        let sql = format!("FETCH FORWARD {} FROM {}", self.page_size, self.cursor_name);
        let fetched = ctx
            .run(Phase::Fetch, async {
                self.conn.query(&sql).await.map_err(|source| PgReportError::QueryExecution {
                    phase: Phase::Fetch,
                    source,
                })
            })
            .await;

        match fetched {
            Ok(rows) => {
                self.position = plan.landed(rows.len());
                Ok(rows)
            }
            Err(e) => {
                self.position = PagePosition::Unknown;
                Err(e)
            }
        }
    }

    /// Roll back the transaction and release the connection
    pub async fn close(mut self) -> std::result::Result<(), DriverError> {
        let result = if self.conn.is_closed() {
            Ok(())
        } else {
            self.conn.execute("ROLLBACK").await
        };
        drop(self);
        result
    }
}
