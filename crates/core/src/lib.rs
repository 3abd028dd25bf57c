pub mod config;
pub mod config_loader;
pub mod events;
pub mod pricing;
pub mod signal;
pub mod types;

pub use config::{AppConfig, ConfigError, RightMapping, RollPolicy};
pub use config_loader::ConfigLoader;
pub use events::NotifyEvent;
pub use signal::{MarketPosition, PositionTransition, Signal, SignalSide, TradeStrategy};
pub use types::{OptionContract, OptionRight, OrderIntent, OrderSide, QuoteSnapshot};
