use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::InstrumentSpec;
use crate::error::ExecutionError;
use crate::exchange::{AccountInfo, ExecutionEvent, ExecutionGateway, Placement};
use crate::models::{Direction, OrderSpec, OrderStyle, Quote};
use crate::trading::position::{pnl, VOLUME_EPSILON};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaperState {
    Working,
    Filled,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    direction: Direction,
    style: OrderStyle,
    entry: f64,
    stop: f64,
    volume: f64,
    expiry: Option<DateTime<Utc>>,
    state: PaperState,
    fill_price: f64,
}

impl PaperOrder {
    fn triggered(&self, quote: &Quote) -> bool {
        let px = quote.entry_side(self.direction);
        match (self.style, self.direction) {
            (OrderStyle::Market, _) => true,
            (OrderStyle::PendingStop, Direction::Long) => px >= self.entry,
            (OrderStyle::PendingStop, Direction::Short) => px <= self.entry,
            (OrderStyle::PendingLimit, Direction::Long) => px <= self.entry,
            (OrderStyle::PendingLimit, Direction::Short) => px >= self.entry,
        }
    }
}

/// In-process broker simulation. Market orders fill at the touch, pending
/// orders fill when a quote crosses their trigger. Stops are recorded and
/// validated but never executed here; exits come from the engine.
pub struct PaperGateway {
    instrument: InstrumentSpec,
    balance: f64,
    quote: Option<Quote>,
    orders: BTreeMap<u64, PaperOrder>,
    events: Vec<ExecutionEvent>,
    next_id: u64,
}

impl PaperGateway {
    pub fn new(instrument: InstrumentSpec, balance: f64) -> Self {
        Self {
            instrument,
            balance,
            quote: None,
            orders: BTreeMap::new(),
            events: Vec::new(),
            next_id: 1,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn stop_for(&self, id: u64) -> Option<f64> {
        self.orders.get(&id).map(|o| o.stop)
    }

    pub fn remaining_volume(&self, id: u64) -> Option<f64> {
        self.orders.get(&id).map(|o| o.volume)
    }

    pub fn working_orders(&self) -> usize {
        self.orders.values().filter(|o| o.state == PaperState::Working).count()
    }

    /// Feed a new top of book: triggers pending orders whose level was crossed.
    pub fn on_quote(&mut self, quote: Quote) {
        self.quote = Some(quote);
        for (&id, order) in self.orders.iter_mut() {
            if order.state != PaperState::Working {
                continue;
            }
            if order.expiry.is_some_and(|e| quote.time >= e) {
                continue;
            }
            if order.triggered(&quote) {
                let price = quote.entry_side(order.direction);
                order.state = PaperState::Filled;
                order.fill_price = price;
                debug!("Paper #{} {} triggered @ {:.5}", id, order.style, price);
                self.events.push(ExecutionEvent::Filled {
                    id,
                    price,
                    time: quote.time,
                });
            }
        }
    }

    /// Drop a filled position as if the broker closed it on its own.
    pub fn close_externally(&mut self, id: u64) -> bool {
        let Some(quote) = self.quote else {
            return false;
        };
        let filled = self
            .orders
            .get(&id)
            .filter(|o| o.state == PaperState::Filled)
            .map(|o| (o.direction, o.volume));
        match filled {
            Some((direction, volume)) => {
                let price = quote.exit_side(direction);
                self.settle(id, volume, price);
                self.events.push(ExecutionEvent::Closed {
                    id,
                    price,
                    time: quote.time,
                });
                true
            }
            _ => false,
        }
    }

    fn floating(&self, quote: &Quote) -> f64 {
        self.orders
            .values()
            .filter(|o| o.state == PaperState::Filled)
            .map(|o| {
                pnl(
                    o.direction,
                    o.fill_price,
                    quote.exit_side(o.direction),
                    o.volume,
                    self.instrument.contract_size,
                )
            })
            .sum()
    }

    fn margin_for(&self, volume: f64, price: f64) -> f64 {
        volume * self.instrument.contract_size * price * self.instrument.margin_rate
    }

    fn used_margin(&self) -> f64 {
        self.orders
            .values()
            .map(|o| {
                let px = if o.state == PaperState::Filled { o.fill_price } else { o.entry };
                self.margin_for(o.volume, px)
            })
            .sum()
    }

    fn settle(&mut self, id: u64, volume: f64, price: f64) -> f64 {
        let contract = self.instrument.contract_size;
        let Some(order) = self.orders.get_mut(&id) else {
            return 0.0;
        };
        let realized = pnl(order.direction, order.fill_price, price, volume, contract);
        order.volume -= volume;
        self.balance += realized;
        if order.volume <= VOLUME_EPSILON {
            self.orders.remove(&id);
        }
        realized
    }

    fn validate_volume(&self, volume: f64) -> Result<(), ExecutionError> {
        let inst = &self.instrument;
        if volume + 1e-9 < inst.min_lot || volume > inst.max_lot_per_trade + 1e-9 {
            return Err(ExecutionError::InvalidVolume(volume));
        }
        if inst.lot_step > 0.0 {
            let steps = volume / inst.lot_step;
            if (steps - steps.round()).abs() > 1e-6 {
                return Err(ExecutionError::InvalidVolume(volume));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn place_order(&mut self, spec: &OrderSpec) -> Result<Placement, ExecutionError> {
        let quote = self.quote.ok_or(ExecutionError::MarketClosed)?;
        self.validate_volume(spec.volume)?;
        if !spec.is_well_formed() {
            return Err(ExecutionError::InvalidStops(format!(
                "entry {:.5} stop {:.5}",
                spec.entry_price, spec.stop_loss
            )));
        }

        let market = quote.entry_side(spec.direction);
        let price_ref = if spec.style == OrderStyle::Market { market } else { spec.entry_price };
        let required = self.margin_for(spec.volume, price_ref);
        let free = self.balance + self.floating(&quote) - self.used_margin();
        if required > free {
            return Err(ExecutionError::InsufficientMargin { required, free });
        }

        let id = self.next_id;
        let mut order = PaperOrder {
            direction: spec.direction,
            style: spec.style,
            entry: spec.entry_price,
            stop: spec.stop_loss,
            volume: spec.volume,
            expiry: spec.expiry,
            state: PaperState::Working,
            fill_price: 0.0,
        };

        let filled_price = match spec.style {
            OrderStyle::Market => {
                if !spec.direction.is_better(market, spec.stop_loss) {
                    return Err(ExecutionError::InvalidStops(format!(
                        "stop {:.5} already through market {:.5}",
                        spec.stop_loss, market
                    )));
                }
                order.state = PaperState::Filled;
                order.fill_price = market;
                Some(market)
            }
            OrderStyle::PendingStop | OrderStyle::PendingLimit => {
                // A pending order must rest away from the market on its own side
                let wrong_side = match spec.style {
                    OrderStyle::PendingStop => !spec.direction.is_better(spec.entry_price, market),
                    _ => !spec.direction.is_better(market, spec.entry_price),
                };
                if wrong_side {
                    return Err(ExecutionError::InvalidStops(format!(
                        "{} at {:.5} on the wrong side of market {:.5}",
                        spec.style, spec.entry_price, market
                    )));
                }
                None
            }
        };

        self.next_id += 1;
        self.orders.insert(id, order);
        info!(
            "Paper {} {} #{} {:.2} lots @ {:.5}",
            spec.style,
            spec.direction,
            id,
            spec.volume,
            filled_price.unwrap_or(spec.entry_price)
        );
        Ok(Placement { id, filled_price })
    }

    async fn modify_stop(&mut self, id: u64, stop: f64) -> Result<(), ExecutionError> {
        let quote = self.quote;
        let order = self.orders.get_mut(&id).ok_or(ExecutionError::UnknownOrder(id))?;
        if order.state == PaperState::Filled {
            if let Some(q) = quote {
                let px = q.exit_side(order.direction);
                if !order.direction.is_better(px, stop) {
                    return Err(ExecutionError::InvalidStops(format!(
                        "stop {:.5} through market {:.5}",
                        stop, px
                    )));
                }
            }
        }
        order.stop = stop;
        Ok(())
    }

    async fn close_volume(&mut self, id: u64, volume: f64, price: f64) -> Result<f64, ExecutionError> {
        let order = self.orders.get(&id).ok_or(ExecutionError::UnknownOrder(id))?;
        if order.state != PaperState::Filled {
            return Err(ExecutionError::Other(format!("#{} is not filled", id)));
        }
        if volume <= 0.0 || volume > order.volume + VOLUME_EPSILON {
            return Err(ExecutionError::InvalidVolume(volume));
        }
        let volume = volume.min(order.volume);
        let realized = self.settle(id, volume, price);
        debug!("Paper #{} closed {:.2} @ {:.5} ({:+.2})", id, volume, price, realized);
        Ok(price)
    }

    async fn cancel_order(&mut self, id: u64) -> Result<(), ExecutionError> {
        match self.orders.get(&id) {
            Some(o) if o.state == PaperState::Working => {
                self.orders.remove(&id);
                Ok(())
            }
            Some(_) => {
                warn!("Cancel for filled #{} refused", id);
                Err(ExecutionError::Other(format!("#{} already filled", id)))
            }
            None => Err(ExecutionError::UnknownOrder(id)),
        }
    }

    async fn poll_events(&mut self) -> Vec<ExecutionEvent> {
        std::mem::take(&mut self.events)
    }

    async fn open_positions(&mut self) -> Result<Vec<u64>, ExecutionError> {
        Ok(self
            .orders
            .iter()
            .filter(|(_, o)| o.state == PaperState::Filled)
            .map(|(&id, _)| id)
            .collect())
    }

    async fn account(&mut self) -> Result<AccountInfo, ExecutionError> {
        let floating = self.quote.map_or(0.0, |q| self.floating(&q));
        let equity = self.balance + floating;
        let used_margin = self.used_margin();
        Ok(AccountInfo {
            balance: self.balance,
            equity,
            used_margin,
            free_margin: equity - used_margin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{default_test_config, long_spec};

    fn gateway(balance: f64) -> PaperGateway {
        let cfg = default_test_config();
        let mut gw = PaperGateway::new(cfg.instrument.clone(), balance);
        gw.on_quote(Quote::new(1.1000, 1.1001, Utc::now()));
        gw
    }

    #[tokio::test]
    async fn market_order_fills_at_ask() {
        let mut gw = gateway(10_000.0);
        let p = gw.place_order(&long_spec(1.1001, 1.0950, 0.1)).await.unwrap();
        assert_eq!(p.filled_price, Some(1.1001));
        assert_eq!(gw.open_positions().await.unwrap(), vec![p.id]);
    }

    #[tokio::test]
    async fn pending_stop_triggers_on_cross() {
        let mut gw = gateway(10_000.0);
        let mut spec = long_spec(1.1020, 1.0970, 0.1);
        spec.style = OrderStyle::PendingStop;
        let p = gw.place_order(&spec).await.unwrap();
        assert_eq!(p.filled_price, None);
        assert!(gw.poll_events().await.is_empty());

        gw.on_quote(Quote::new(1.1019, 1.1021, Utc::now()));
        let events = gw.poll_events().await;
        assert!(matches!(events[..], [ExecutionEvent::Filled { id, .. }] if id == p.id));
        assert_eq!(gw.working_orders(), 0);
    }

    #[tokio::test]
    async fn pending_on_wrong_side_is_rejected() {
        let mut gw = gateway(10_000.0);
        let mut spec = long_spec(1.0990, 1.0940, 0.1);
        spec.style = OrderStyle::PendingStop;
        let err = gw.place_order(&spec).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidStops(_)));
    }

    #[tokio::test]
    async fn margin_check_rejects_oversized_order() {
        // 1 lot of EURUSD at 1:30 needs ~3,667 margin
        let mut gw = gateway(1_000.0);
        let err = gw.place_order(&long_spec(1.1001, 1.0950, 1.0)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InsufficientMargin { .. }));
        assert!(gw.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_then_full_close_realizes_pnl() {
        let mut gw = gateway(10_000.0);
        let p = gw.place_order(&long_spec(1.1001, 1.0950, 1.0)).await.unwrap();
        gw.close_volume(p.id, 0.5, 1.1101).await.unwrap();
        assert!((gw.balance() - 10_500.0).abs() < 1e-6);
        assert!((gw.remaining_volume(p.id).unwrap() - 0.5).abs() < 1e-9);
        gw.close_volume(p.id, 0.5, 1.1001).await.unwrap();
        assert!(gw.remaining_volume(p.id).is_none());
        assert!(matches!(
            gw.close_volume(p.id, 0.5, 1.1).await,
            Err(ExecutionError::UnknownOrder(_))
        ));
    }

    #[tokio::test]
    async fn stop_through_market_is_rejected() {
        let mut gw = gateway(10_000.0);
        let p = gw.place_order(&long_spec(1.1001, 1.0950, 0.1)).await.unwrap();
        assert!(gw.modify_stop(p.id, 1.0990).await.is_ok());
        assert!(matches!(
            gw.modify_stop(p.id, 1.1005).await,
            Err(ExecutionError::InvalidStops(_))
        ));
        assert!(matches!(gw.modify_stop(99, 1.0).await, Err(ExecutionError::UnknownOrder(99))));
    }

    #[tokio::test]
    async fn external_close_emits_event() {
        let mut gw = gateway(10_000.0);
        let p = gw.place_order(&long_spec(1.1001, 1.0950, 0.1)).await.unwrap();
        assert!(gw.close_externally(p.id));
        let events = gw.poll_events().await;
        assert!(matches!(events[..], [ExecutionEvent::Closed { id, .. }] if id == p.id));
        assert!(gw.open_positions().await.unwrap().is_empty());
    }
}
