//! fleet-services — the orchestration engine, node-agent dispatcher,
//! capability providers, liveness detector and the bus they talk over.

pub mod bus;
pub mod dispatcher;
pub mod engine;
pub mod liveness;
pub mod provider;
pub mod runtime_cache;
pub mod store;

pub use bus::{Bus, BusError, BusMessage, LocalBus, Subscription, TcpBus};
pub use dispatcher::{Dispatcher, Disposition};
pub use engine::{Engine, EngineSettings, NodeStep, Step};
pub use liveness::{LivenessDetector, Prober, TcpProber};
pub use provider::{CapabilityProvider, CommandRunner, ProviderResult, ShellRunner, TaskContext};
pub use runtime_cache::{ClientRuntimeConfig, RuntimeCache, ServerRuntimeConfig};
pub use store::{MemoryStore, Store};
