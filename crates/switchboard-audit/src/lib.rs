/// Audit subsystem for the Switchboard bridge.
///
/// One durable record per request:
/// - **Stores** (`store`): in-memory and Postgres backends plus migrations
/// - **Recorder** (`recorder`): bounded queue + worker keeping persistence
///   off the request path
pub mod recorder;
pub mod store;

pub use recorder::AuditRecorder;
pub use store::{InMemoryAuditStore, PostgresAuditStore};
