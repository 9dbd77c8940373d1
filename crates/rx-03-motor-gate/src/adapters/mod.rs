//! Adapters: venue simulator, durable state files, bus event sink.

pub mod bus_sink;
pub mod memory_sink;
pub mod paper_exchange;
pub mod state_file;

pub use bus_sink::BusEventSink;
pub use memory_sink::RecordingSink;
pub use paper_exchange::PaperExchange;
pub use state_file::FileStateStore;
