//! The coin-aggregation, identity, credit and enforcement engine for the
//! vendo captive-portal gateway.

mod coin_aggregator;
mod credit_applier;
mod engine;
mod error;
mod fail_gate;
mod identity;
mod idle_monitor;
mod rate_planner;
mod source_registry;
mod ticker;
mod user_code;

pub use coin_aggregator::{CoinAggregator, CoinSessionView, CommitRequest, PulseOutcome, StartOutcome, VendoMode};
pub use credit_applier::{CreditApplier, CreditResult};
pub use engine::{spawn_coin_deadline_poller, spawn_idle_monitor, spawn_ticker, Engine, RestoreKey, StatusView};
pub use error::{EngineError, EngineResult};
pub use fail_gate::{FailAttemptGate, FailAttemptGateConfig};
pub use identity::IdentityResolver;
pub use idle_monitor::{IdleMonitor, IdleMonitorConfig};
pub use rate_planner::{plan, Plan, RateLine};
pub use source_registry::{SourceRegistry, LOCAL_SOURCE_ID};
pub use ticker::{Ticker, TickerConfig, TickReport};
pub use user_code::{generate as generate_user_code, is_well_formed as user_code_is_well_formed};
