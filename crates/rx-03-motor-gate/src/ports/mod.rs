//! Driven ports (outbound dependencies).

pub mod outbound;

pub use outbound::{
    EventSink, ExchangeError, ExchangeGateway, KeyProvider, MemoryStateStore, OrderAck,
    OrderRequest, StateStore, StateStoreError, StaticKeyProvider, SystemTimeSource, TimeSource,
};
