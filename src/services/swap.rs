use crate::services::TradingEngine;
use crate::types::{InstrumentClass, TradeType};
use chrono::{DateTime, Datelike, Utc, Weekday};
use dashmap::DashMap;
use tracing::{debug, info, warn};

/// Weekend financing is settled midweek, so Wednesday's rollover charges
/// three days at once.
const TRIPLE_SWAP_DAY: Weekday = Weekday::Wed;

/// Overnight financing per 1.0 lot held across the daily rollover, in
/// account currency. Negative values are charges.
fn daily_rate(class: InstrumentClass, trade_type: TradeType) -> f64 {
    let (long, short) = match class {
        InstrumentClass::Major => (-6.5, -1.5),
        InstrumentClass::JpyPair => (2.4, -8.2),
        InstrumentClass::Gold => (-28.0, 12.0),
        InstrumentClass::Silver => (-3.5, 1.2),
        InstrumentClass::Energy => (-10.0, -4.0),
        InstrumentClass::Index => (-7.5, -2.0),
        InstrumentClass::Crypto => (-25.0, -25.0),
    };
    match trade_type {
        TradeType::Buy => long,
        TradeType::Sell => short,
    }
}

/// Applies overnight financing to open positions at the UTC day rollover.
///
/// Accrual runs off the tick path: a scheduler calls `run_rollover`
/// periodically and the manager decides per position whether today's charge
/// is still owed, so repeated calls within one day are no-ops.
pub struct SwapManager {
    /// Last UTC day number charged, per position id.
    applied: DashMap<String, i32>,
}

impl SwapManager {
    pub fn new() -> Self {
        Self {
            applied: DashMap::new(),
        }
    }

    /// Charge or credit every open position that has not yet been rolled
    /// over today. Returns the number of positions touched.
    pub fn run_rollover(&self, engine: &TradingEngine, now: DateTime<Utc>) -> usize {
        let today = now.date_naive().num_days_from_ce();
        let multiplier = if now.weekday() == TRIPLE_SWAP_DAY {
            3.0
        } else {
            1.0
        };

        let positions = engine.all_open_positions();
        let mut touched = 0;

        for position in &positions {
            let already = self
                .applied
                .get(&position.id)
                .map(|day| *day == today)
                .unwrap_or(false);
            if already {
                continue;
            }

            // Positions opened after the previous rollover have not been
            // held overnight yet.
            let opened = DateTime::from_timestamp_millis(position.open_time)
                .unwrap_or(now)
                .date_naive()
                .num_days_from_ce();
            if opened >= today {
                self.applied.insert(position.id.clone(), today);
                continue;
            }

            let class = InstrumentClass::of(&position.symbol);
            let charge = daily_rate(class, position.trade_type) * position.amount * multiplier;

            match engine.apply_swap(&position.id, charge) {
                Ok(()) => {
                    self.applied.insert(position.id.clone(), today);
                    debug!("swap {:.2} applied to {}", charge, position.id);
                    touched += 1;
                }
                Err(e) => warn!("swap accrual failed for {}: {}", position.id, e),
            }
        }

        // Drop bookkeeping for positions that are no longer open.
        self.applied
            .retain(|id, _| positions.iter().any(|p| p.id == *id));

        if touched > 0 {
            info!("rollover applied swap to {} positions", touched);
        }
        touched
    }
}

impl Default for SwapManager {
    fn default() -> Self {
        Self::new()
    }
}
