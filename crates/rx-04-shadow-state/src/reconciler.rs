//! Periodic convergence against exchange truth.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use shared_types::{CanonicalPolicy, DriftEvent, RECONCILE_DEADLINE_MS, RECONCILE_INTERVAL_MS};

use crate::book::ShadowBook;
use crate::ports::{DriftSink, PositionReader};

/// Reconciliation failures. All transient: the next tick tries again.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The exchange pull failed.
    #[error("Position pull failed: {0}")]
    Pull(String),

    /// The exchange pull exceeded its deadline.
    #[error("Position pull exceeded {0} ms deadline")]
    Deadline(u64),
}

/// The reconciler: pulls authoritative positions, reports drift, and makes
/// the shadow agree.
pub struct Reconciler<R: PositionReader, S: DriftSink> {
    book: Arc<ShadowBook>,
    reader: Arc<R>,
    sink: Arc<S>,
    policy: Arc<CanonicalPolicy>,
    interval: Duration,
}

impl<R: PositionReader, S: DriftSink> Reconciler<R, S> {
    /// Create a reconciler with the standard 60 s interval.
    #[must_use]
    pub fn new(
        book: Arc<ShadowBook>,
        reader: Arc<R>,
        sink: Arc<S>,
        policy: Arc<CanonicalPolicy>,
    ) -> Self {
        Self::with_interval(book, reader, sink, policy, Duration::from_millis(RECONCILE_INTERVAL_MS))
    }

    /// [`Self::new`] with a custom interval (test hook).
    #[must_use]
    pub fn with_interval(
        book: Arc<ShadowBook>,
        reader: Arc<R>,
        sink: Arc<S>,
        policy: Arc<CanonicalPolicy>,
        interval: Duration,
    ) -> Self {
        Self {
            book,
            reader,
            sink,
            policy,
            interval,
        }
    }

    /// One reconciliation pass. Returns the drift events it reported.
    ///
    /// Covers the union of shadow symbols and exchange symbols, so both a
    /// phantom shadow position (exchange flat) and an unknown exchange
    /// position (shadow flat) count as drift.
    pub async fn reconcile_once(&self, now_ms: i64) -> Result<Vec<DriftEvent>, ReconcileError> {
        let deadline = Duration::from_millis(RECONCILE_DEADLINE_MS);
        let exchange_positions = tokio::time::timeout(
            deadline,
            self.reader.positions(self.book.account()),
        )
        .await
        .map_err(|_| ReconcileError::Deadline(RECONCILE_DEADLINE_MS))?
        .map_err(ReconcileError::Pull)?;

        let mut symbols: HashSet<String> = exchange_positions
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        for position in self.book.all_positions().await {
            symbols.insert(position.symbol);
        }

        let mut drifts = Vec::new();
        for symbol in symbols {
            let exchange = exchange_positions.iter().find(|p| p.symbol == symbol);
            let exchange_size = exchange.map(|p| p.size).unwrap_or(Decimal::ZERO);
            let exchange_entry = exchange.map(|p| p.avg_entry_price).unwrap_or(Decimal::ZERO);
            let shadow_size = self
                .book
                .position(&symbol)
                .await
                .map(|p| p.size)
                .unwrap_or(Decimal::ZERO);

            let tolerance = self.policy.recon_tolerance(&symbol);
            let divergence = (shadow_size - exchange_size).abs();

            if divergence > tolerance {
                let event = DriftEvent {
                    account: self.book.account().to_string(),
                    symbol: symbol.clone(),
                    shadow_size,
                    exchange_size,
                    tolerance,
                    timestamp: now_ms,
                };
                warn!(
                    symbol = %symbol,
                    shadow = %shadow_size,
                    exchange = %exchange_size,
                    "Shadow drift detected; exchange value adopted"
                );
                // Exchange is truth: replace before anything else reads the
                // stale value.
                self.book
                    .replace_from_exchange(&symbol, exchange_size, exchange_entry, now_ms)
                    .await;
                self.sink.report(event.clone()).await;
                drifts.push(event);
            } else {
                // In tolerance: refresh the sync stamp and mark price.
                self.book
                    .replace_from_exchange(&symbol, exchange_size, exchange_entry, now_ms)
                    .await;
                if let Some(mark) = exchange.and_then(|p| p.mark_price) {
                    self.book.mark(&symbol, mark).await;
                }
            }
        }
        Ok(drifts)
    }

    /// Run until shutdown, reconciling every interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let now = shared_types::now_ms();
                    if let Err(e) = self.reconcile_once(now).await {
                        warn!(error = %e, "Reconciliation pass failed; will retry");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ExchangePosition;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use shared_types::{FillEvent, Side};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct FixedReader {
        positions: Vec<ExchangePosition>,
    }

    #[async_trait]
    impl PositionReader for FixedReader {
        async fn positions(&self, _account: &str) -> Result<Vec<ExchangePosition>, String> {
            Ok(self.positions.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DriftEvent>>,
    }

    #[async_trait]
    impl DriftSink for RecordingSink {
        async fn report(&self, event: DriftEvent) {
            self.events.lock().push(event);
        }
    }

    fn policy() -> Arc<CanonicalPolicy> {
        let mut symbols = BTreeMap::new();
        symbols.insert(
            "BTCUSDT".to_string(),
            shared_types::SymbolPolicy {
                max_notional: dec!(100000),
                max_leverage: 5,
                recon_tolerance: dec!(0.01),
            },
        );
        Arc::new(CanonicalPolicy {
            version: 1,
            symbols,
            max_account_leverage: 10,
            strategy_daily_loss_cap: dec!(1000),
            breaker: shared_types::BreakerThresholds::default(),
            orders_per_second: 10,
            default_recon_tolerance: dec!(0.001),
        })
    }

    async fn book_with_btc(size: Decimal) -> Arc<ShadowBook> {
        let book = Arc::new(ShadowBook::new("main"));
        if !size.is_zero() {
            book.apply_fill(&FillEvent {
                fill_id: Uuid::new_v4().to_string(),
                intent_id: Uuid::new_v4(),
                order_id: "O-1".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: if size.is_sign_positive() { Side::Buy } else { Side::Sell },
                filled_qty: size.abs(),
                fill_price: dec!(100),
                fees: Decimal::ZERO,
                filled_at: 0,
            })
            .await
            .unwrap();
        }
        book
    }

    #[tokio::test]
    async fn test_within_tolerance_no_drift() {
        let book = book_with_btc(dec!(1)).await;
        let reader = Arc::new(FixedReader {
            positions: vec![ExchangePosition {
                symbol: "BTCUSDT".to_string(),
                size: dec!(1.005),
                avg_entry_price: dec!(100),
                mark_price: None,
            }],
        });
        let sink = Arc::new(RecordingSink::default());
        let reconciler =
            Reconciler::new(Arc::clone(&book), reader, Arc::clone(&sink), policy());

        let drifts = reconciler.reconcile_once(1_000).await.unwrap();
        assert!(drifts.is_empty());
        assert!(sink.events.lock().is_empty());
        // Shadow still converges to the exchange value.
        assert_eq!(book.position("BTCUSDT").await.unwrap().size, dec!(1.005));
        assert_eq!(book.position("BTCUSDT").await.unwrap().last_synced_at, 1_000);
    }

    #[tokio::test]
    async fn test_drift_reported_and_shadow_replaced() {
        let book = book_with_btc(dec!(1)).await;
        let reader = Arc::new(FixedReader {
            positions: vec![ExchangePosition {
                symbol: "BTCUSDT".to_string(),
                size: dec!(0.5),
                avg_entry_price: dec!(102),
                mark_price: None,
            }],
        });
        let sink = Arc::new(RecordingSink::default());
        let reconciler =
            Reconciler::new(Arc::clone(&book), reader, Arc::clone(&sink), policy());

        let drifts = reconciler.reconcile_once(2_000).await.unwrap();
        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].shadow_size, dec!(1));
        assert_eq!(drifts[0].exchange_size, dec!(0.5));

        let position = book.position("BTCUSDT").await.unwrap();
        assert_eq!(position.size, dec!(0.5));
        assert_eq!(position.avg_entry_price, dec!(102));
    }

    #[tokio::test]
    async fn test_phantom_shadow_position_is_drift() {
        // Shadow says long, exchange says flat.
        let book = book_with_btc(dec!(2)).await;
        let reader = Arc::new(FixedReader { positions: vec![] });
        let sink = Arc::new(RecordingSink::default());
        let reconciler =
            Reconciler::new(Arc::clone(&book), reader, Arc::clone(&sink), policy());

        let drifts = reconciler.reconcile_once(3_000).await.unwrap();
        assert_eq!(drifts.len(), 1);
        assert_eq!(drifts[0].exchange_size, Decimal::ZERO);
        assert!(book.position("BTCUSDT").await.unwrap().size.is_zero());
    }

    #[tokio::test]
    async fn test_unknown_exchange_position_is_drift() {
        // Shadow empty, exchange has a position (uses default tolerance).
        let book = Arc::new(ShadowBook::new("main"));
        let reader = Arc::new(FixedReader {
            positions: vec![ExchangePosition {
                symbol: "ETHUSDT".to_string(),
                size: dec!(3),
                avg_entry_price: dec!(50),
                mark_price: None,
            }],
        });
        let sink = Arc::new(RecordingSink::default());
        let reconciler =
            Reconciler::new(Arc::clone(&book), reader, Arc::clone(&sink), policy());

        let drifts = reconciler.reconcile_once(4_000).await.unwrap();
        assert_eq!(drifts.len(), 1);
        assert_eq!(book.position("ETHUSDT").await.unwrap().size, dec!(3));
    }

    struct FailingReader;

    #[async_trait]
    impl PositionReader for FailingReader {
        async fn positions(&self, _account: &str) -> Result<Vec<ExchangePosition>, String> {
            Err("venue 503".to_string())
        }
    }

    #[tokio::test]
    async fn test_pull_failure_is_transient() {
        let book = Arc::new(ShadowBook::new("main"));
        let sink = Arc::new(RecordingSink::default());
        let reconciler = Reconciler::new(book, Arc::new(FailingReader), sink, policy());
        let err = reconciler.reconcile_once(5_000).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Pull(_)));
    }
}
