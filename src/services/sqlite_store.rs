//! SQLite persistence for accounts and positions.
//!
//! The engine treats this as an external durable log: rows are read/written
//! by primary key, and balance/margin updates go through a single-statement
//! delta adjustment so concurrent engine paths cannot interleave partial
//! account mutations.

use crate::types::{Account, CloseReason, PositionStatus, TradePosition, TradeType};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("position not found: {0}")]
    PositionNotFound(String),
}

/// SQLite store for accounts and trade positions.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("in-memory SQLite store initialized");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                balance REAL NOT NULL,
                margin REAL NOT NULL DEFAULT 0,
                leverage REAL NOT NULL DEFAULT 100,
                currency TEXT NOT NULL DEFAULT 'USD',
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                trade_type TEXT NOT NULL,
                amount REAL NOT NULL,
                open_price REAL NOT NULL,
                current_price REAL NOT NULL,
                leverage REAL NOT NULL,
                margin REAL NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                pnl REAL NOT NULL DEFAULT 0,
                pnl_percent REAL NOT NULL DEFAULT 0,
                commission REAL NOT NULL DEFAULT 0,
                swap REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER,
                close_reason TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_account ON positions(account_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
            [],
        )?;

        Ok(())
    }

    // ========== Accounts ==========

    pub fn create_account(&self, account: &Account) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO accounts (id, user_id, balance, margin, leverage, currency, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.id,
                account.user_id,
                account.balance,
                account.margin,
                account.leverage,
                account.currency,
                account.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_account(&self, id: &str) -> Option<Account> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, balance, margin, leverage, currency, created_at
             FROM accounts WHERE id = ?1",
            params![id],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    balance: row.get(2)?,
                    margin: row.get(3)?,
                    leverage: row.get(4)?,
                    currency: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        )
        .optional()
        .ok()
        .flatten()
    }

    /// Accounts with margin currently in use, for the stop-out sweep.
    pub fn accounts_with_margin(&self) -> Vec<Account> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, user_id, balance, margin, leverage, currency, created_at
             FROM accounts WHERE margin > 0",
        ) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };

        let rows = stmt.query_map([], |row| {
            Ok(Account {
                id: row.get(0)?,
                user_id: row.get(1)?,
                balance: row.get(2)?,
                margin: row.get(3)?,
                leverage: row.get(4)?,
                currency: row.get(5)?,
                created_at: row.get(6)?,
            })
        });

        match rows {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Atomically adjust balance and margin by deltas in one statement.
    pub fn adjust_account(
        &self,
        id: &str,
        balance_delta: f64,
        margin_delta: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE accounts SET balance = balance + ?1, margin = margin + ?2 WHERE id = ?3",
            params![balance_delta, margin_delta, id],
        )?;
        if updated == 0 {
            return Err(StoreError::AccountNotFound(id.to_string()));
        }
        Ok(())
    }

    // ========== Positions ==========

    pub fn create_position(&self, position: &TradePosition) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO positions (
                id, account_id, symbol, trade_type, amount, open_price, current_price,
                leverage, margin, stop_loss, take_profit, pnl, pnl_percent, commission,
                swap, status, open_time, close_time, close_reason
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                position.id,
                position.account_id,
                position.symbol,
                position.trade_type.as_str(),
                position.amount,
                position.open_price,
                position.current_price,
                position.leverage,
                position.margin,
                position.stop_loss,
                position.take_profit,
                position.pnl,
                position.pnl_percent,
                position.commission,
                position.swap,
                position.status.as_str(),
                position.open_time,
                position.close_time,
                position.close_reason.map(|r| r.as_str()),
            ],
        )?;
        Ok(())
    }

    /// Compensating delete for a failed execute. Idempotent by primary key.
    pub fn delete_position(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM positions WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_position(&self, id: &str) -> Option<TradePosition> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, account_id, symbol, trade_type, amount, open_price, current_price,
                    leverage, margin, stop_loss, take_profit, pnl, pnl_percent, commission,
                    swap, status, open_time, close_time, close_reason
             FROM positions WHERE id = ?1",
            params![id],
            Self::row_to_position,
        )
        .optional()
        .ok()
        .flatten()
    }

    /// All open positions, for engine warm-up after restart.
    pub fn open_positions(&self) -> Vec<TradePosition> {
        self.query_positions(
            "SELECT id, account_id, symbol, trade_type, amount, open_price, current_price,
                    leverage, margin, stop_loss, take_profit, pnl, pnl_percent, commission,
                    swap, status, open_time, close_time, close_reason
             FROM positions WHERE status = 'open'",
        )
    }

    fn query_positions(&self, sql: &str) -> Vec<TradePosition> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        let positions = match stmt.query_map([], Self::row_to_position) {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        };
        positions
    }

    /// Persist tick-driven revaluation fields.
    pub fn update_position_mark(&self, position: &TradePosition) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE positions SET current_price = ?1, pnl = ?2, pnl_percent = ?3 WHERE id = ?4",
            params![
                position.current_price,
                position.pnl,
                position.pnl_percent,
                position.id
            ],
        )?;
        Ok(())
    }

    /// Persist accumulated swap for a position.
    pub fn update_position_swap(&self, id: &str, swap: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE positions SET swap = ?1 WHERE id = ?2",
            params![swap, id],
        )?;
        if updated == 0 {
            return Err(StoreError::PositionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Move a position to closed. Closing is one-way: the WHERE clause skips
    /// rows that are already closed.
    pub fn close_position_row(
        &self,
        id: &str,
        close_price: f64,
        pnl: f64,
        close_time: i64,
        reason: CloseReason,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE positions
             SET status = 'closed', current_price = ?1, pnl = ?2, close_time = ?3, close_reason = ?4
             WHERE id = ?5 AND status != 'closed'",
            params![close_price, pnl, close_time, reason.as_str(), id],
        )?;
        Ok(updated > 0)
    }

    /// Compensating reopen for a close whose account settlement failed.
    /// Restores the row so margin and PnL accounting stay consistent.
    pub fn reopen_position_row(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE positions
             SET status = 'open', close_time = NULL, close_reason = NULL
             WHERE id = ?1 AND status = 'closed'",
            params![id],
        )?;
        Ok(updated > 0)
    }

    fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradePosition> {
        let trade_type: String = row.get(3)?;
        let status: String = row.get(15)?;
        let close_reason: Option<String> = row.get(18)?;

        Ok(TradePosition {
            id: row.get(0)?,
            account_id: row.get(1)?,
            symbol: row.get(2)?,
            trade_type: TradeType::parse(&trade_type).unwrap_or(TradeType::Buy),
            amount: row.get(4)?,
            open_price: row.get(5)?,
            current_price: row.get(6)?,
            leverage: row.get(7)?,
            margin: row.get(8)?,
            stop_loss: row.get(9)?,
            take_profit: row.get(10)?,
            pnl: row.get(11)?,
            pnl_percent: row.get(12)?,
            commission: row.get(13)?,
            swap: row.get(14)?,
            status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Closed),
            open_time: row.get(16)?,
            close_time: row.get(17)?,
            close_reason: close_reason.as_deref().and_then(CloseReason::parse),
        })
    }
}
