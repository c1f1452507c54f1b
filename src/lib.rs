//! Server-side WebSocket upgrade negotiation ([`upgrade`]) and a
//! deterministic, time-controllable event loop for driving and testing
//! asynchronous connection code ([`virtual_loop`]).

pub mod error;
pub mod headers;
pub mod pipeline;
pub mod upgrade;
pub mod virtual_loop;

pub use error::{LoopError, PipelineError, UpgradeError};
pub use headers::{HttpHeaders, HttpRequestHead};
pub use pipeline::{Channel, Pipeline, PipelineHandler};
pub use upgrade::{ShouldUpgrade, Upgrader, UpgradePipelineHandler, UpgraderBuilder};
pub use virtual_loop::{LoopFuture, LoopPromise, Scheduled, VirtualLoop};
