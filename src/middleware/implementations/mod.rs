// Ready-made handlers; none are active until registered on a Database

pub mod defaults;
pub mod query_logger;
pub mod read_only;
pub mod slow_query;

pub use defaults::install_defaults;
pub use query_logger::QueryLogger;
pub use read_only::{ReadOnlyGuard, READ_ONLY_KINDS};
pub use slow_query::{SlowQueryWarning, ELAPSED_MS_KEY};
