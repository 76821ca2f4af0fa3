use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::models::{CloseReason, Direction};

/// A fully closed position, as reported to the risk governor and statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: u64,
    pub direction: Direction,
    pub pattern: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_loss: f64,
    pub volume: f64,
    /// Realized P&L across all partial and final closes, account currency.
    pub pnl: f64,
    pub reason: CloseReason,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: DateTime<Utc>,
    pub pyramid_level: u32,
    pub reentry_attempt: u32,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn hold_seconds(&self) -> Option<i64> {
        self.opened_at.map(|o| (self.closed_at - o).num_seconds())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub trades: usize,
    pub wins: usize,
    pub total_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
}

impl PatternStats {
    fn record(&mut self, pnl: f64) {
        self.trades += 1;
        self.total_pnl += pnl;
        if pnl > 0.0 {
            self.wins += 1;
            self.gross_profit += pnl;
        } else {
            self.gross_loss += -pnl;
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }

    /// Average P&L per trade.
    pub fn edge(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.total_pnl / self.trades as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub by_pattern: HashMap<String, PatternStats>,
    pub by_reason: HashMap<String, usize>,
}

impl TradingStats {
    pub fn from_trades(trades: &[ClosedTrade]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let mut by_pattern: HashMap<String, PatternStats> = HashMap::new();
        let mut by_reason: HashMap<String, usize> = HashMap::new();
        for t in trades {
            by_pattern.entry(t.pattern.clone()).or_default().record(t.pnl);
            *by_reason.entry(t.reason.to_string()).or_default() += 1;
        }

        let wins: Vec<f64> = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).collect();
        let losses: Vec<f64> = trades.iter().filter(|t| t.pnl <= 0.0).map(|t| t.pnl).collect();
        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = -losses.iter().sum::<f64>();

        Self {
            total_trades: trades.len(),
            wins: wins.len(),
            losses: losses.len(),
            win_rate: round1(wins.len() as f64 / trades.len() as f64 * 100.0),
            total_pnl: round2(trades.iter().map(|t| t.pnl).sum()),
            profit_factor: if gross_loss > 0.0 {
                round2(gross_profit / gross_loss)
            } else if gross_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            },
            avg_win: if wins.is_empty() {
                0.0
            } else {
                round2(gross_profit / wins.len() as f64)
            },
            avg_loss: if losses.is_empty() {
                0.0
            } else {
                round2(-gross_loss / losses.len() as f64)
            },
            best_trade: round2(trades.iter().map(|t| t.pnl).fold(f64::NEG_INFINITY, f64::max)),
            worst_trade: round2(trades.iter().map(|t| t.pnl).fold(f64::INFINITY, f64::min)),
            by_pattern,
            by_reason,
        }
    }
}

// Hard floor/ceiling for the tuned strength threshold
const MIN_STRENGTH_FLOOR: f64 = 0.3;
const MIN_STRENGTH_CEILING: f64 = 0.9;

/// Nudges a per-pattern minimum strength up after a losing streak of results
/// and back down once the pattern earns again. Feeds the self-tuned filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrengthTuner {
    pub base: f64,
    pub step: f64,
    pub min_sample: usize,
    pub thresholds: HashMap<String, f64>,
}

impl StrengthTuner {
    pub fn new(base: f64, step: f64, min_sample: usize) -> Self {
        Self {
            base,
            step,
            min_sample,
            thresholds: HashMap::new(),
        }
    }

    pub fn threshold(&self, pattern: &str) -> Option<f64> {
        self.thresholds.get(pattern).copied()
    }

    /// Re-derive thresholds from the per-pattern statistics. Returns the
    /// patterns whose threshold moved.
    pub fn refine(&mut self, by_pattern: &HashMap<String, PatternStats>) -> Vec<String> {
        let mut changed = Vec::new();
        for (pattern, stats) in by_pattern {
            if stats.trades < self.min_sample {
                continue;
            }
            let current = self.thresholds.get(pattern).copied().unwrap_or(self.base);

            let new_val = if stats.edge() < 0.0 {
                (current + self.step).min(MIN_STRENGTH_CEILING)
            } else if stats.win_rate() > 0.55 {
                (current - self.step).max(MIN_STRENGTH_FLOOR)
            } else {
                current
            };

            if (new_val - current).abs() > f64::EPSILON || !self.thresholds.contains_key(pattern) {
                let new_val = round4(new_val);
                info!(
                    "Tuned min strength for {}: {:.2} -> {:.2} (edge={:+.2}, n={})",
                    pattern,
                    current,
                    new_val,
                    stats.edge(),
                    stats.trades
                );
                self.thresholds.insert(pattern.clone(), new_val);
                changed.push(pattern.clone());
            }
        }
        changed
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(pattern: &str, pnl: f64, reason: CloseReason) -> ClosedTrade {
        let now = Utc::now();
        ClosedTrade {
            id: 1,
            direction: Direction::Long,
            pattern: pattern.to_string(),
            entry_price: 1.1,
            exit_price: 1.1,
            stop_loss: 1.09,
            volume: 0.1,
            pnl,
            reason,
            opened_at: Some(now - chrono::Duration::minutes(30)),
            closed_at: now,
            pyramid_level: 0,
            reentry_attempt: 0,
        }
    }

    #[test]
    fn empty_history() {
        let s = TradingStats::from_trades(&[]);
        assert_eq!(s.total_trades, 0);
        assert_eq!(s.win_rate, 0.0);
    }

    #[test]
    fn breakdowns() {
        let trades = vec![
            trade("liquidity_sweep", 100.0, CloseReason::Win),
            trade("liquidity_sweep", -50.0, CloseReason::Loss),
            trade("retail_trap", 0.0, CloseReason::Breakeven),
        ];
        let s = TradingStats::from_trades(&trades);
        assert_eq!(s.total_trades, 3);
        assert_eq!(s.wins, 1);
        assert_eq!(s.profit_factor, 2.0);
        assert_eq!(s.best_trade, 100.0);
        assert_eq!(s.worst_trade, -50.0);
        assert_eq!(s.by_pattern["liquidity_sweep"].trades, 2);
        assert_eq!(s.by_reason["breakeven"], 1);
        assert_eq!(trades[0].hold_seconds(), Some(1800));
    }

    #[test]
    fn tuner_raises_bar_for_losing_pattern() {
        let mut tuner = StrengthTuner::new(0.5, 0.05, 3);
        let trades: Vec<ClosedTrade> = (0..4).map(|_| trade("retail_trap", -10.0, CloseReason::Loss)).collect();
        let stats = TradingStats::from_trades(&trades);
        assert_eq!(tuner.refine(&stats.by_pattern), vec!["retail_trap".to_string()]);
        assert!((tuner.threshold("retail_trap").unwrap() - 0.55).abs() < 1e-9);
        assert_eq!(tuner.threshold("liquidity_sweep"), None);
    }

    #[test]
    fn tuner_respects_ceiling() {
        let mut tuner = StrengthTuner::new(0.88, 0.05, 1);
        let stats = TradingStats::from_trades(&[trade("x", -1.0, CloseReason::Loss)]);
        tuner.refine(&stats.by_pattern);
        assert_eq!(tuner.threshold("x"), Some(0.9));
    }
}
