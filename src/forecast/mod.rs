pub mod balancer;
pub mod vrm;

pub use balancer::*;
pub use vrm::*;
