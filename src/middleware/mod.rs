pub mod cancellation;
pub mod context;
pub mod error;
pub mod implementations;
pub mod pipeline;
pub mod traits;

pub use cancellation::Cancellation;
pub use context::{CallContext, Scratch};
pub use error::SetupError;
pub use implementations::{install_defaults, QueryLogger, ReadOnlyGuard, SlowQueryWarning};
pub use pipeline::Registry;
pub use traits::{handler_fn, Handler, HandlerFn, OperationKind, Origin};
