//! In-memory venue for tests and dry runs.
//!
//! Honors idempotency keys, keeps per-symbol positions, and can be scripted
//! to fail so the submit retry path is testable. With `auto_fill` on, every
//! accepted order fills immediately at the symbol's mark price and the fill
//! lands on [`PaperExchange::fills`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use rx_04_shadow_state::{ExchangePosition, PositionReader};
use shared_types::{FillEvent, Side};

use crate::ports::{ExchangeError, ExchangeGateway, OrderAck, OrderRequest};

struct PaperPosition {
    size: Decimal,
    avg_entry_price: Decimal,
}

/// The simulator.
pub struct PaperExchange {
    marks: Mutex<HashMap<String, Decimal>>,
    equity: Mutex<Decimal>,
    orders: Mutex<HashMap<Uuid, OrderAck>>,
    positions: Mutex<HashMap<String, PaperPosition>>,
    scripted_failures: Mutex<VecDeque<ExchangeError>>,
    attempts: AtomicU64,
    next_id: AtomicU64,
    auto_fill: bool,
    fills_tx: mpsc::Sender<FillEvent>,
    fills_rx: Mutex<Option<mpsc::Receiver<FillEvent>>>,
}

impl PaperExchange {
    /// A venue that accepts and immediately fills everything.
    #[must_use]
    pub fn auto_filling(equity: Decimal) -> Self {
        Self::build(equity, true)
    }

    /// A venue that accepts orders but fills nothing (ack-only).
    #[must_use]
    pub fn ack_only(equity: Decimal) -> Self {
        Self::build(equity, false)
    }

    fn build(equity: Decimal, auto_fill: bool) -> Self {
        let (fills_tx, fills_rx) = mpsc::channel(1024);
        Self {
            marks: Mutex::new(HashMap::new()),
            equity: Mutex::new(equity),
            orders: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            attempts: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            auto_fill,
            fills_tx,
            fills_rx: Mutex::new(Some(fills_rx)),
        }
    }

    /// Set the mark price for a symbol.
    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        self.marks.lock().insert(symbol.to_string(), price);
    }

    /// Queue failures for the next placement attempts, in order.
    pub fn script_failures(&self, failures: Vec<ExchangeError>) {
        self.scripted_failures.lock().extend(failures);
    }

    /// Total placement attempts observed (including failed ones).
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of distinct orders accepted.
    #[must_use]
    pub fn orders_placed(&self) -> usize {
        self.orders.lock().len()
    }

    /// Take the fill feed (single consumer).
    pub fn fills(&self) -> mpsc::Receiver<FillEvent> {
        self.fills_rx
            .lock()
            .take()
            .expect("fill feed already taken")
    }

    fn apply_fill_to_position(&self, symbol: &str, side: Side, qty: Decimal, price: Decimal) {
        let mut positions = self.positions.lock();
        let position = positions.entry(symbol.to_string()).or_insert(PaperPosition {
            size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
        });
        let signed = side.sign() * qty;
        let same_direction = position.size.is_zero() || position.size.signum() == signed.signum();
        if same_direction {
            let old_abs = position.size.abs();
            let new_abs = old_abs + qty;
            if !new_abs.is_zero() {
                position.avg_entry_price =
                    (old_abs * position.avg_entry_price + qty * price) / new_abs;
            }
        } else if (position.size + signed).is_zero() {
            position.avg_entry_price = Decimal::ZERO;
        } else if (position.size + signed).signum() == signed.signum() {
            position.avg_entry_price = price;
        }
        position.size += signed;
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self.scripted_failures.lock().pop_front() {
            return Err(failure);
        }

        // Idempotency: a key we have seen returns the original ack and
        // causes no second placement.
        if let Some(existing) = self.orders.lock().get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let order_id = format!("O-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let ack = OrderAck {
            order_id: order_id.clone(),
        };
        self.orders
            .lock()
            .insert(request.idempotency_key, ack.clone());

        if self.auto_fill {
            let price = match request.order_type {
                shared_types::OrderType::Market => *self
                    .marks
                    .lock()
                    .get(&request.symbol)
                    .ok_or_else(|| ExchangeError::Fatal(format!("no mark for {}", request.symbol)))?,
                _ => request
                    .limit_price
                    .ok_or_else(|| ExchangeError::Fatal("limit order without price".to_string()))?,
            };
            self.apply_fill_to_position(&request.symbol, request.side, request.quantity, price);
            let fill = FillEvent {
                fill_id: format!("F-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                intent_id: request.idempotency_key,
                order_id,
                symbol: request.symbol.clone(),
                side: request.side,
                filled_qty: request.quantity,
                fill_price: price,
                fees: Decimal::ZERO,
                filled_at: shared_types::now_ms(),
            };
            // Feed overflow just drops the fill; the reconciler will catch
            // the divergence.
            let _ = self.fills_tx.try_send(fill);
        }

        Ok(ack)
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.marks
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Transient(format!("no mark for {symbol}")))
    }

    async fn account_equity(&self, _account: &str) -> Result<Decimal, ExchangeError> {
        Ok(*self.equity.lock())
    }
}

#[async_trait]
impl PositionReader for PaperExchange {
    async fn positions(&self, _account: &str) -> Result<Vec<ExchangePosition>, String> {
        let marks = self.marks.lock();
        Ok(self
            .positions
            .lock()
            .iter()
            .filter(|(_, p)| !p.size.is_zero())
            .map(|(symbol, p)| ExchangePosition {
                symbol: symbol.clone(),
                size: p.size,
                avg_entry_price: p.avg_entry_price,
                mark_price: marks.get(symbol).copied(),
            })
            .collect())
    }
}
