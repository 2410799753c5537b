pub mod boiler;
pub mod thermal;
pub mod types;

pub use boiler::*;
pub use thermal::{battery_top_up_kwh, heat_demand, HeatDemand};
pub use types::*;
