pub mod analysis;
pub mod attribution;
pub mod context;
pub mod executor;
pub mod gate;
pub mod ledger;
pub mod media;
pub mod messaging;
pub mod probe;
pub mod quality;
pub mod ranker;
pub mod resolver;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod traversal;

pub use context::RunContext;
pub use executor::{ExecutionResult, SendMethod};
pub use messaging::DirectMessenger;
pub use probe::{DomProbe, PageProbe, Probe};
pub use traversal::{EngineDeps, ExitReason, StoryEngine, TraversalConfig, TraversalStats};
