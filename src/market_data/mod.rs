pub mod binance_source;
pub mod simulated;
pub mod source;

pub use binance_source::BinanceMarketDataSource;
pub use simulated::SimulatedMarketDataSource;
pub use source::MarketDataSource;
