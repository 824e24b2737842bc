pub mod config;
pub mod correlation;
pub mod db;
pub mod dispatcher;
pub mod frontend;
pub mod router;
pub mod style;
pub mod upstream;
pub mod users;

pub use config::{Config, ConfigError};
pub use db::{Db, DbError, UserRecord};
pub use dispatcher::{Dispatcher, SnapshotStats};
pub use router::{Decision, RouteOutcome};
