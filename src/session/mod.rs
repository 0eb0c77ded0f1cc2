// Module for cursor session management
pub mod connector;
pub mod context;
pub mod cursor;
pub mod pool;
pub mod reaper;

pub use connector::{Connector, CursorConnection, PgConnection, PgConnector};
pub use context::QueryContext;
pub use cursor::{CursorMove, CursorState, Direction, PagePlan, PagePosition};
pub use pool::CursorPool;
pub use reaper::ReaperHandle;

pub use crate::config::PoolConfig;
