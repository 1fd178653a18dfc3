use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard lot: 1.0 lot = 100,000 base-currency units.
pub const CONTRACT_SIZE: f64 = 100_000.0;

/// Smallest tradable lot size.
pub const MIN_LOT: f64 = 0.01;

/// Largest tradable lot size.
pub const MAX_LOT: f64 = 100.0;

/// Commission as a fraction of trade notional.
pub const COMMISSION_RATE: f64 = 0.0007;

/// Advisory risk ceiling per trade, percent of balance.
pub const MAX_RISK_PER_TRADE_PCT: f64 = 2.0;

/// Margin level at which the engine only warns.
pub const MIN_MARGIN_LEVEL: f64 = 50.0;

/// Margin level at or below which all positions are force-closed.
pub const STOP_OUT_LEVEL: f64 = 20.0;

/// Minimum stop-loss/take-profit distance from the current price, as a
/// fraction of price. Prevents instant-trigger orders.
pub const MIN_STOP_DISTANCE_PCT: f64 = 0.001;

fn default_leverage() -> f64 {
    100.0
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Buy => "buy",
            TradeType::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(TradeType::Buy),
            "sell" => Some(TradeType::Sell),
            _ => None,
        }
    }
}

/// Position lifecycle state. `Closed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PositionStatus::Pending),
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    MarginCall,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::MarginCall => "margin_call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(CloseReason::Manual),
            "stop_loss" => Some(CloseReason::StopLoss),
            "take_profit" => Some(CloseReason::TakeProfit),
            "margin_call" => Some(CloseReason::MarginCall),
            _ => None,
        }
    }
}

/// A trading account. Balance is realized capital; margin is the portion
/// reserved against open positions. Both are mutated only through the
/// engine's designated update paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub balance: f64,
    pub margin: f64,
    /// Default leverage for new trades.
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    pub currency: String,
    /// When the account was created (ms).
    pub created_at: i64,
}

impl Account {
    /// Create a new account with a starting balance.
    pub fn new(user_id: String, balance: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            balance,
            margin: 0.0,
            leverage: default_leverage(),
            currency: "USD".to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Derived account health numbers. Computed fresh on demand, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountMetrics {
    pub balance: f64,
    /// Balance plus unrealized PnL of open positions.
    pub equity: f64,
    /// Capital reserved against open positions.
    pub margin: f64,
    /// Equity minus margin.
    pub free_margin: f64,
    /// `equity / margin * 100`; None when no margin is in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<f64>,
    pub total_pnl: f64,
    pub open_positions: usize,
    pub total_volume: f64,
}

/// An open or closed trade position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePosition {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    /// Lot size.
    pub amount: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub leverage: f64,
    /// Margin reserved for this position.
    pub margin: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub commission: f64,
    /// Accumulated overnight financing (negative = charge).
    pub swap: f64,
    pub status: PositionStatus,
    /// When the position was opened (ms).
    pub open_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
}

impl TradePosition {
    /// Notional value at the open price.
    pub fn notional(&self) -> f64 {
        self.amount * CONTRACT_SIZE * self.open_price
    }

    /// Unrealized gross PnL at `price`, before commission and swap.
    pub fn gross_pnl(&self, price: f64) -> f64 {
        let delta = match self.trade_type {
            TradeType::Buy => price - self.open_price,
            TradeType::Sell => self.open_price - price,
        };
        delta * self.amount * CONTRACT_SIZE
    }

    /// Mark the position to `price`, updating pnl and pnl_percent.
    /// Commission is a sunk cost from tick zero; swap accrues separately.
    pub fn mark_to(&mut self, price: f64) {
        self.current_price = price;
        self.pnl = self.gross_pnl(price) - self.commission + self.swap;
        self.pnl_percent = if self.margin > 0.0 {
            self.pnl / self.margin * 100.0
        } else {
            0.0
        };
    }

    /// Whether `price` crosses the stop-loss for this direction.
    pub fn stop_loss_hit(&self, price: f64) -> bool {
        match (self.trade_type, self.stop_loss) {
            (TradeType::Buy, Some(sl)) => price <= sl,
            (TradeType::Sell, Some(sl)) => price >= sl,
            _ => false,
        }
    }

    /// Whether `price` crosses the take-profit for this direction.
    pub fn take_profit_hit(&self, price: f64) -> bool {
        match (self.trade_type, self.take_profit) {
            (TradeType::Buy, Some(tp)) => price >= tp,
            (TradeType::Sell, Some(tp)) => price <= tp,
            _ => false,
        }
    }
}

/// A trade intent from the consuming layer. Validated immediately before
/// execution; validation results are never cached because account state may
/// change between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub symbol: String,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    /// Lot size.
    pub amount: f64,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Requested entry price; market price is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

/// Pure judgement on a trade request. Errors block execution, warnings are
/// advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub required_margin: f64,
    pub estimated_commission: f64,
    pub risk_amount: f64,
    pub risk_percent: f64,
}

/// Outcome of an execute/close call. Public engine methods return this shape
/// instead of throwing so the consuming layer always has something to branch
/// on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TradeResult {
    pub fn ok(position_id: String) -> Self {
        Self {
            success: true,
            position_id: Some(position_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            position_id: None,
            error: Some(error.into()),
        }
    }
}

/// A new price for one symbol, fed into position revaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(trade_type: TradeType) -> TradePosition {
        TradePosition {
            id: "pos-1".to_string(),
            account_id: "acct-1".to_string(),
            symbol: "EURUSD".to_string(),
            trade_type,
            amount: 1.0,
            open_price: 1.1,
            current_price: 1.1,
            leverage: 100.0,
            margin: 1100.0,
            stop_loss: None,
            take_profit: None,
            pnl: 0.0,
            pnl_percent: 0.0,
            commission: 77.0,
            swap: 0.0,
            status: PositionStatus::Open,
            open_time: 0,
            close_time: None,
            close_reason: None,
        }
    }

    #[test]
    fn test_gross_pnl_buy() {
        let pos = sample_position(TradeType::Buy);
        // +10 pips on 1.0 lot = 100 units of quote currency
        assert!((pos.gross_pnl(1.101) - 100.0).abs() < 1e-6);
        assert!((pos.gross_pnl(1.099) + 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_gross_pnl_sell() {
        let pos = sample_position(TradeType::Sell);
        assert!((pos.gross_pnl(1.099) - 100.0).abs() < 1e-6);
        assert!((pos.gross_pnl(1.101) + 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_mark_to_includes_commission() {
        let mut pos = sample_position(TradeType::Buy);
        pos.mark_to(1.1);
        assert!((pos.pnl + 77.0).abs() < 1e-6);
    }

    #[test]
    fn test_stop_loss_hit_direction() {
        let mut buy = sample_position(TradeType::Buy);
        buy.stop_loss = Some(1.09);
        assert!(buy.stop_loss_hit(1.089));
        assert!(!buy.stop_loss_hit(1.095));

        let mut sell = sample_position(TradeType::Sell);
        sell.stop_loss = Some(1.11);
        assert!(sell.stop_loss_hit(1.1105));
        assert!(!sell.stop_loss_hit(1.105));
    }

    #[test]
    fn test_take_profit_hit_direction() {
        let mut buy = sample_position(TradeType::Buy);
        buy.take_profit = Some(1.12);
        assert!(buy.take_profit_hit(1.121));
        assert!(!buy.take_profit_hit(1.115));

        let mut sell = sample_position(TradeType::Sell);
        sell.take_profit = Some(1.08);
        assert!(sell.take_profit_hit(1.079));
        assert!(!sell.take_profit_hit(1.085));
    }

    #[test]
    fn test_close_reason_serialization() {
        assert_eq!(serde_json::to_string(&CloseReason::StopLoss).unwrap(), "\"stop_loss\"");
        assert_eq!(serde_json::to_string(&CloseReason::MarginCall).unwrap(), "\"margin_call\"");
        assert_eq!(serde_json::to_string(&CloseReason::Manual).unwrap(), "\"manual\"");
    }

    #[test]
    fn test_trade_request_deserialization() {
        let json = r#"{
            "symbol": "EURUSD",
            "type": "buy",
            "amount": 0.5,
            "stopLoss": 1.08
        }"#;
        let req: TradeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.trade_type, TradeType::Buy);
        assert_eq!(req.amount, 0.5);
        assert_eq!(req.leverage, 100.0);
        assert_eq!(req.stop_loss, Some(1.08));
        assert_eq!(req.take_profit, None);
    }

    #[test]
    fn test_account_creation() {
        let account = Account::new("user-1".to_string(), 10_000.0);
        assert!(!account.id.is_empty());
        assert_eq!(account.balance, 10_000.0);
        assert_eq!(account.margin, 0.0);
        assert_eq!(account.leverage, 100.0);
        assert_eq!(account.currency, "USD");
    }

    #[test]
    fn test_status_round_trip() {
        for status in [PositionStatus::Pending, PositionStatus::Open, PositionStatus::Closed] {
            assert_eq!(PositionStatus::parse(status.as_str()), Some(status));
        }
        for reason in [
            CloseReason::Manual,
            CloseReason::StopLoss,
            CloseReason::TakeProfit,
            CloseReason::MarginCall,
        ] {
            assert_eq!(CloseReason::parse(reason.as_str()), Some(reason));
        }
    }
}
