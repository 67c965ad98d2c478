/// MCP subsystem for the Switchboard bridge.
///
/// Everything between the bridge and the tool-providing servers:
/// - **Transports**: streamable HTTP/SSE and stdio, behind one trait
/// - **Client**: per-server session protocol, id correlation, result parsing
/// - **Registry**: discovery, tool-schema cache, health state, invocation
///   routing with transport-level retry
pub mod client;
pub mod registry;
pub mod transport_http;
pub mod transport_stdio;

pub use registry::McpRegistry;
