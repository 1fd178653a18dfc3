use crate::services::{SqliteStore, StoreError};
use crate::types::{
    Account, AccountMetrics, CloseReason, PositionStatus, PriceTick, TradePosition, TradeRequest,
    TradeResult, TradeType, TradeValidation, COMMISSION_RATE, CONTRACT_SIZE, MAX_LOT,
    MAX_RISK_PER_TRADE_PCT, MIN_LOT, MIN_MARGIN_LEVEL, MIN_STOP_DISTANCE_PCT, STOP_OUT_LEVEL,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Validates, executes, revalues and closes trade positions against accounts.
///
/// The engine is synchronous: callers supply current prices, so trading logic
/// stays deterministic and testable without a market-data connection. Open
/// positions are cached in memory; the store is the durable record.
pub struct TradingEngine {
    store: Arc<SqliteStore>,
    positions: DashMap<String, TradePosition>,
}

impl TradingEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            positions: DashMap::new(),
        }
    }

    /// Warm the position cache from the store after a restart.
    pub fn load_open_positions(&self) {
        let positions = self.store.open_positions();
        info!("loaded {} open positions from store", positions.len());
        for position in positions {
            self.positions.insert(position.id.clone(), position);
        }
    }

    /// Create a new trading account with a starting balance.
    pub fn create_account(&self, user_id: &str, balance: f64) -> Result<Account, StoreError> {
        let account = Account::new(user_id.to_string(), balance);
        self.store.create_account(&account)?;
        info!("created account {} for {}", account.id, user_id);
        Ok(account)
    }

    pub fn get_account(&self, account_id: &str) -> Option<Account> {
        self.store.get_account(account_id)
    }

    pub fn get_position(&self, position_id: &str) -> Option<TradePosition> {
        self.positions
            .get(position_id)
            .map(|p| p.clone())
            .or_else(|| self.store.get_position(position_id))
    }

    /// Open positions for one account, from the in-memory cache.
    pub fn open_positions(&self, account_id: &str) -> Vec<TradePosition> {
        self.positions
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .map(|entry| entry.clone())
            .collect()
    }

    /// All cached open positions, across accounts.
    pub fn all_open_positions(&self) -> Vec<TradePosition> {
        self.positions.iter().map(|entry| entry.clone()).collect()
    }

    /// Accrue a swap charge or credit onto a position, keeping the cache and
    /// the store in step. The position's pnl reflects the new swap on the
    /// next mark.
    pub fn apply_swap(&self, position_id: &str, delta: f64) -> Result<(), StoreError> {
        let Some(mut entry) = self.positions.get_mut(position_id) else {
            return Err(StoreError::PositionNotFound(position_id.to_string()));
        };
        entry.swap += delta;
        let swap = entry.swap;
        drop(entry);
        self.store.update_position_swap(position_id, swap)
    }

    #[cfg(test)]
    pub(crate) fn set_open_time(&self, position_id: &str, open_time: i64) {
        if let Some(mut entry) = self.positions.get_mut(position_id) {
            entry.open_time = open_time;
        }
    }

    /// Derived account health, computed fresh from balance plus the cached
    /// open positions. None when the account does not exist.
    pub fn account_metrics(&self, account_id: &str) -> Option<AccountMetrics> {
        let account = self.store.get_account(account_id)?;
        Some(self.metrics_for(&account))
    }

    fn metrics_for(&self, account: &Account) -> AccountMetrics {
        let mut total_pnl = 0.0;
        let mut total_volume = 0.0;
        let mut open_positions = 0;

        for entry in self.positions.iter() {
            if entry.account_id != account.id {
                continue;
            }
            total_pnl += entry.pnl;
            total_volume += entry.amount;
            open_positions += 1;
        }

        let equity = account.balance + total_pnl;
        let margin_level = if account.margin > 0.0 {
            Some(equity / account.margin * 100.0)
        } else {
            None
        };

        AccountMetrics {
            balance: account.balance,
            equity,
            margin: account.margin,
            free_margin: equity - account.margin,
            margin_level,
            total_pnl,
            open_positions,
            total_volume,
        }
    }

    /// Judge a trade request against account state at `current_price`.
    /// Errors block execution; warnings are advisory only.
    pub fn validate_trade(
        &self,
        account: &Account,
        request: &TradeRequest,
        current_price: f64,
    ) -> TradeValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let price = request.price.unwrap_or(current_price);
        if !price.is_finite() || price <= 0.0 {
            errors.push(format!("invalid price: {}", price));
        }

        if request.amount < MIN_LOT || request.amount > MAX_LOT {
            errors.push(format!(
                "lot size {} outside allowed range {} - {}",
                request.amount, MIN_LOT, MAX_LOT
            ));
        }

        let leverage = if request.leverage > 0.0 {
            request.leverage
        } else {
            errors.push(format!("invalid leverage: {}", request.leverage));
            1.0
        };

        let notional = request.amount * CONTRACT_SIZE * price;
        let required_margin = notional / leverage;
        let estimated_commission = notional * COMMISSION_RATE;

        let metrics = self.metrics_for(account);
        // Commission hits pnl the moment the position opens, so free margin
        // must cover margin plus commission or the open itself would leave
        // free margin negative.
        if required_margin + estimated_commission > metrics.free_margin {
            errors.push(format!(
                "insufficient free margin: need {:.2}, have {:.2}",
                required_margin + estimated_commission,
                metrics.free_margin
            ));
        }

        let min_distance = price * MIN_STOP_DISTANCE_PCT;
        if let Some(sl) = request.stop_loss {
            let ok = match request.trade_type {
                TradeType::Buy => sl < price - min_distance,
                TradeType::Sell => sl > price + min_distance,
            };
            if !ok {
                errors.push(format!(
                    "stop loss {} on wrong side of or too close to price {}",
                    sl, price
                ));
            }
        }
        if let Some(tp) = request.take_profit {
            let ok = match request.trade_type {
                TradeType::Buy => tp > price + min_distance,
                TradeType::Sell => tp < price - min_distance,
            };
            if !ok {
                errors.push(format!(
                    "take profit {} on wrong side of or too close to price {}",
                    tp, price
                ));
            }
        }

        // Risk is only defined relative to a stop; without one the request
        // gets the high-risk warning and nothing else.
        let risk_amount = match request.stop_loss {
            Some(sl) => (price - sl).abs() * request.amount * CONTRACT_SIZE,
            None => 0.0,
        };
        let risk_percent = if account.balance > 0.0 {
            risk_amount / account.balance * 100.0
        } else if request.stop_loss.is_some() {
            100.0
        } else {
            0.0
        };

        match request.stop_loss {
            None => warnings.push("no stop loss set".to_string()),
            Some(_) => {
                if risk_percent > MAX_RISK_PER_TRADE_PCT {
                    warnings.push(format!(
                        "risk {:.1}% of balance exceeds the {:.0}% guideline",
                        risk_percent, MAX_RISK_PER_TRADE_PCT
                    ));
                }
            }
        }

        let projected_margin = account.margin + required_margin;
        if projected_margin > 0.0 {
            let projected_level =
                (metrics.equity - estimated_commission) / projected_margin * 100.0;
            if projected_level < 100.0 {
                warnings.push(format!(
                    "projected margin level {:.1}% after open",
                    projected_level
                ));
            }
        }

        TradeValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
            required_margin,
            estimated_commission,
            risk_amount,
            risk_percent,
        }
    }

    /// Validate and open a position. On success the position margin is
    /// reserved on the account; on any persistence failure the position row
    /// is removed again so no half-applied trade survives.
    pub fn execute_trade(
        &self,
        account_id: &str,
        request: &TradeRequest,
        current_price: f64,
    ) -> TradeResult {
        let Some(account) = self.store.get_account(account_id) else {
            return TradeResult::failed(format!("account not found: {}", account_id));
        };

        let validation = self.validate_trade(&account, request, current_price);
        if !validation.valid {
            return TradeResult::failed(validation.errors.join("; "));
        }
        for warning in &validation.warnings {
            warn!("trade warning for {}: {}", account_id, warning);
        }

        let open_price = request.price.unwrap_or(current_price);
        let position = TradePosition {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            symbol: request.symbol.clone(),
            trade_type: request.trade_type,
            amount: request.amount,
            open_price,
            current_price: open_price,
            leverage: request.leverage,
            margin: validation.required_margin,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            // Commission is charged up front, so the position starts in the red.
            pnl: -validation.estimated_commission,
            pnl_percent: 0.0,
            commission: validation.estimated_commission,
            swap: 0.0,
            status: PositionStatus::Open,
            open_time: chrono::Utc::now().timestamp_millis(),
            close_time: None,
            close_reason: None,
        };

        if let Err(e) = self.store.create_position(&position) {
            error!("failed to persist position: {}", e);
            return TradeResult::failed(format!("failed to persist position: {}", e));
        }

        if let Err(e) = self
            .store
            .adjust_account(account_id, 0.0, validation.required_margin)
        {
            error!("failed to reserve margin, rolling back position: {}", e);
            if let Err(del) = self.store.delete_position(&position.id) {
                error!("rollback delete failed for {}: {}", position.id, del);
            }
            return TradeResult::failed(format!("failed to reserve margin: {}", e));
        }

        info!(
            "opened {} {} {:.2} lots @ {} for {}",
            position.trade_type.as_str(),
            position.symbol,
            position.amount,
            position.open_price,
            account_id
        );
        let id = position.id.clone();
        self.positions.insert(id.clone(), position);
        TradeResult::ok(id)
    }

    /// Close a position at `current_price`. Closing is one-way: a second call
    /// for the same position fails.
    pub fn close_position(
        &self,
        position_id: &str,
        current_price: f64,
        reason: CloseReason,
    ) -> TradeResult {
        let Some(mut position) = self.get_position(position_id) else {
            return TradeResult::failed(format!("position not found: {}", position_id));
        };
        if position.status == PositionStatus::Closed {
            return TradeResult::failed(format!("position already closed: {}", position_id));
        }

        position.mark_to(current_price);
        let realized = position.pnl;
        let close_time = chrono::Utc::now().timestamp_millis();

        match self
            .store
            .close_position_row(position_id, current_price, realized, close_time, reason)
        {
            Ok(true) => {}
            Ok(false) => {
                self.positions.remove(position_id);
                return TradeResult::failed(format!("position already closed: {}", position_id));
            }
            Err(e) => {
                error!("failed to close position {}: {}", position_id, e);
                return TradeResult::failed(format!("failed to close position: {}", e));
            }
        }

        if let Err(e) = self
            .store
            .adjust_account(&position.account_id, realized, -position.margin)
        {
            // Mirror the execute rollback: reopen the row so margin and PnL
            // are not left half-settled.
            error!(
                "settlement failed for {}, reopening position: {}",
                position_id, e
            );
            if let Err(reopen) = self.store.reopen_position_row(position_id) {
                error!("reopen failed for {}: {}", position_id, reopen);
            }
            return TradeResult::failed(format!("account settlement failed: {}", e));
        }

        self.positions.remove(position_id);

        info!(
            "closed {} ({}) @ {} pnl {:.2}",
            position_id,
            reason.as_str(),
            current_price,
            realized
        );
        TradeResult::ok(position_id.to_string())
    }

    /// Revalue open positions against fresh prices, trigger stop-loss and
    /// take-profit closes, then run the margin sweep. Stop-loss wins when
    /// both levels are crossed by the same tick.
    pub fn update_positions(&self, ticks: &[PriceTick]) {
        let prices: HashMap<&str, f64> =
            ticks.iter().map(|t| (t.symbol.as_str(), t.price)).collect();

        let ids: Vec<String> = self.positions.iter().map(|p| p.id.clone()).collect();
        for id in ids {
            let Some(mut entry) = self.positions.get_mut(&id) else {
                continue;
            };
            let Some(&price) = prices.get(entry.symbol.as_str()) else {
                continue;
            };

            entry.mark_to(price);
            let snapshot = entry.clone();
            drop(entry);

            if let Err(e) = self.store.update_position_mark(&snapshot) {
                warn!("failed to persist mark for {}: {}", id, e);
            }

            if snapshot.stop_loss_hit(price) {
                self.close_position(&id, price, CloseReason::StopLoss);
            } else if snapshot.take_profit_hit(price) {
                self.close_position(&id, price, CloseReason::TakeProfit);
            }
        }

        self.margin_sweep();
    }

    /// Force-close everything for accounts at or below the stop-out level;
    /// warn for accounts below the minimum margin level.
    fn margin_sweep(&self) {
        for account in self.store.accounts_with_margin() {
            let metrics = self.metrics_for(&account);
            let Some(level) = metrics.margin_level else {
                continue;
            };

            if level <= STOP_OUT_LEVEL {
                warn!(
                    "stop out on account {} at margin level {:.1}%",
                    account.id, level
                );
                for position in self.open_positions(&account.id) {
                    self.close_position(&position.id, position.current_price, CloseReason::MarginCall);
                }
            } else if level <= MIN_MARGIN_LEVEL {
                warn!(
                    "margin warning on account {}: level {:.1}%",
                    account.id, level
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_account(balance: f64) -> (TradingEngine, Account) {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let engine = TradingEngine::new(store);
        let account = engine.create_account("user-1", balance).unwrap();
        (engine, account)
    }

    fn buy_request(amount: f64) -> TradeRequest {
        TradeRequest {
            symbol: "EURUSD".to_string(),
            trade_type: TradeType::Buy,
            amount,
            leverage: 100.0,
            stop_loss: None,
            take_profit: None,
            price: None,
        }
    }

    #[test]
    fn test_validate_rejects_lot_bounds() {
        let (engine, account) = engine_with_account(10_000.0);

        let too_small = engine.validate_trade(&account, &buy_request(0.001), 1.1);
        assert!(!too_small.valid);

        let too_large = engine.validate_trade(&account, &buy_request(150.0), 1.1);
        assert!(!too_large.valid);
    }

    #[test]
    fn test_validate_rejects_insufficient_margin() {
        let (engine, account) = engine_with_account(100.0);
        // 1.0 lot at 1.1 needs 1100 margin, far beyond a 100 balance.
        let validation = engine.validate_trade(&account, &buy_request(1.0), 1.1);
        assert!(!validation.valid);
        assert!(validation.errors.iter().any(|e| e.contains("free margin")));
    }

    #[test]
    fn test_validate_rejects_wrong_side_stop() {
        let (engine, account) = engine_with_account(10_000.0);
        let mut request = buy_request(0.1);
        request.stop_loss = Some(1.2); // above the buy price
        let validation = engine.validate_trade(&account, &request, 1.1);
        assert!(!validation.valid);
    }

    #[test]
    fn test_validate_warns_without_stop() {
        let (engine, account) = engine_with_account(100_000.0);
        let validation = engine.validate_trade(&account, &buy_request(0.1), 1.1);
        assert!(validation.valid);
        assert!(validation.warnings.iter().any(|w| w.contains("stop loss")));
    }

    #[test]
    fn test_no_stop_gets_only_the_high_risk_warning() {
        let (engine, account) = engine_with_account(100_000.0);
        // 2.0 lots reserve 2200 margin, above 2% of balance; without a stop
        // that must not surface as a risk-percent warning.
        let validation = engine.validate_trade(&account, &buy_request(2.0), 1.1);
        assert!(validation.valid);
        assert!(validation.warnings.iter().any(|w| w.contains("stop loss")));
        assert!(!validation.warnings.iter().any(|w| w.contains("risk")));
        assert_eq!(validation.risk_amount, 0.0);
        assert_eq!(validation.risk_percent, 0.0);
    }

    #[test]
    fn test_risk_warning_fires_with_wide_stop() {
        let (engine, account) = engine_with_account(100_000.0);
        let mut request = buy_request(1.0);
        // 300 pips of stop distance on 1.0 lot risks 3000, 3% of balance.
        request.stop_loss = Some(1.07);
        let validation = engine.validate_trade(&account, &request, 1.1);
        assert!(validation.valid);
        assert!(validation.warnings.iter().any(|w| w.contains("risk")));
        assert!((validation.risk_percent - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_margin_check_covers_open_commission() {
        // Opening charges commission into pnl immediately, so admission
        // requires free margin for margin plus commission: 1100 + 77 here.
        let (engine, account) = engine_with_account(1_150.0);
        let validation = engine.validate_trade(&account, &buy_request(1.0), 1.1);
        assert!(!validation.valid);

        let (engine, account) = engine_with_account(1_180.0);
        let result = engine.execute_trade(&account.id, &buy_request(1.0), 1.1);
        assert!(result.success, "{:?}", result.error);
        let metrics = engine.account_metrics(&account.id).unwrap();
        assert!(metrics.free_margin >= 0.0);
    }

    #[test]
    fn test_execute_reserves_margin() {
        let (engine, account) = engine_with_account(10_000.0);
        let result = engine.execute_trade(&account.id, &buy_request(0.1), 1.1);
        assert!(result.success, "{:?}", result.error);

        let loaded = engine.get_account(&account.id).unwrap();
        assert!((loaded.margin - 110.0).abs() < 1e-6);
        assert_eq!(loaded.balance, 10_000.0);
        assert_eq!(engine.open_positions(&account.id).len(), 1);
    }

    #[test]
    fn test_rejected_trade_has_no_side_effects() {
        let (engine, account) = engine_with_account(100.0);
        let result = engine.execute_trade(&account.id, &buy_request(1.0), 1.1);
        assert!(!result.success);

        let loaded = engine.get_account(&account.id).unwrap();
        assert_eq!(loaded.balance, 100.0);
        assert_eq!(loaded.margin, 0.0);
        assert!(engine.open_positions(&account.id).is_empty());
    }

    #[test]
    fn test_close_realizes_pnl_and_releases_margin() {
        let (engine, account) = engine_with_account(10_000.0);
        let result = engine.execute_trade(&account.id, &buy_request(0.1), 1.1);
        let position_id = result.position_id.unwrap();

        // +10 pips on 0.1 lot = 10.00 gross.
        let close = engine.close_position(&position_id, 1.101, CloseReason::Manual);
        assert!(close.success);

        let loaded = engine.get_account(&account.id).unwrap();
        let commission = 0.1 * CONTRACT_SIZE * 1.1 * COMMISSION_RATE;
        assert!((loaded.balance - (10_000.0 + 10.0 - commission)).abs() < 1e-6);
        assert_eq!(loaded.margin, 0.0);
        assert!(engine.open_positions(&account.id).is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (engine, account) = engine_with_account(10_000.0);
        let result = engine.execute_trade(&account.id, &buy_request(0.1), 1.1);
        let position_id = result.position_id.unwrap();

        assert!(engine
            .close_position(&position_id, 1.1, CloseReason::Manual)
            .success);
        assert!(!engine
            .close_position(&position_id, 1.2, CloseReason::Manual)
            .success);

        // Balance settled exactly once.
        let loaded = engine.get_account(&account.id).unwrap();
        let commission = 0.1 * CONTRACT_SIZE * 1.1 * COMMISSION_RATE;
        assert!((loaded.balance - (10_000.0 - commission)).abs() < 1e-6);
    }

    #[test]
    fn test_update_positions_triggers_stop_loss() {
        let (engine, account) = engine_with_account(10_000.0);
        let mut request = buy_request(0.1);
        request.stop_loss = Some(1.09);
        let result = engine.execute_trade(&account.id, &request, 1.1);
        let position_id = result.position_id.unwrap();

        engine.update_positions(&[PriceTick {
            symbol: "EURUSD".to_string(),
            price: 1.089,
        }]);

        let position = engine.get_position(&position_id).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.close_reason, Some(CloseReason::StopLoss));
    }

    #[test]
    fn test_stop_loss_wins_over_take_profit() {
        let (engine, account) = engine_with_account(10_000.0);
        let mut request = buy_request(0.1);
        // A gap tick through both levels must resolve as a stop, the
        // conservative outcome.
        request.stop_loss = Some(1.09);
        request.take_profit = Some(1.12);
        let result = engine.execute_trade(&account.id, &request, 1.1);
        let position_id = result.position_id.unwrap();

        {
            let mut entry = engine.positions.get_mut(&position_id).unwrap();
            entry.stop_loss = Some(1.05);
            entry.take_profit = Some(1.04);
        }
        engine.update_positions(&[PriceTick {
            symbol: "EURUSD".to_string(),
            price: 1.045,
        }]);

        let position = engine.get_position(&position_id).unwrap();
        assert_eq!(position.close_reason, Some(CloseReason::StopLoss));
    }

    #[test]
    fn test_margin_sweep_stop_out() {
        let (engine, account) = engine_with_account(1_200.0);
        let result = engine.execute_trade(&account.id, &buy_request(1.0), 1.1);
        let position_id = result.position_id.unwrap();

        // A deep adverse move drives equity below 20% of the 1100 margin.
        engine.update_positions(&[PriceTick {
            symbol: "EURUSD".to_string(),
            price: 1.09,
        }]);

        let position = engine.get_position(&position_id).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.close_reason, Some(CloseReason::MarginCall));

        let loaded = engine.get_account(&account.id).unwrap();
        assert_eq!(loaded.margin, 0.0);
    }

    #[test]
    fn test_failed_settlement_reopens_position() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let engine = TradingEngine::new(Arc::clone(&store));

        // A position whose account row does not exist yet, as after a
        // partial restore.
        let mut orphan = Account::new("ghost-user".to_string(), 10_000.0);
        orphan.id = "ghost-account".to_string();
        let position = TradePosition {
            id: "pos-orphan".to_string(),
            account_id: orphan.id.clone(),
            symbol: "EURUSD".to_string(),
            trade_type: TradeType::Buy,
            amount: 0.1,
            open_price: 1.1,
            current_price: 1.1,
            leverage: 100.0,
            margin: 110.0,
            stop_loss: None,
            take_profit: None,
            pnl: -7.7,
            pnl_percent: 0.0,
            commission: 7.7,
            swap: 0.0,
            status: PositionStatus::Open,
            open_time: chrono::Utc::now().timestamp_millis(),
            close_time: None,
            close_reason: None,
        };
        store.create_position(&position).unwrap();
        engine.load_open_positions();

        // Settlement cannot land, so the close must roll back whole.
        let result = engine.close_position("pos-orphan", 1.101, CloseReason::Manual);
        assert!(!result.success);
        let stored = store.get_position("pos-orphan").unwrap();
        assert_eq!(stored.status, PositionStatus::Open);
        assert_eq!(stored.close_reason, None);
        assert_eq!(engine.open_positions(&orphan.id).len(), 1);

        // Once the account exists the same close settles normally.
        store.create_account(&orphan).unwrap();
        let result = engine.close_position("pos-orphan", 1.101, CloseReason::Manual);
        assert!(result.success);
        let settled = store.get_account(&orphan.id).unwrap();
        assert!((settled.balance - (10_000.0 + 10.0 - 7.7)).abs() < 1e-6);
    }

    #[test]
    fn test_load_open_positions_warms_cache() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let engine = TradingEngine::new(Arc::clone(&store));
        let account = engine.create_account("user-1", 10_000.0).unwrap();
        engine.execute_trade(&account.id, &buy_request(0.1), 1.1);

        // Fresh engine over the same store sees the position after warm-up.
        let restarted = TradingEngine::new(store);
        assert!(restarted.open_positions(&account.id).is_empty());
        restarted.load_open_positions();
        assert_eq!(restarted.open_positions(&account.id).len(), 1);
    }
}
