//! Example HTTP server instrumented with `apm_agent`.
//!
//! [`RequestServer`] serves one connection at a time and hands the raw
//! request line to a handler. Instrumentation wraps the handler rather than
//! the server:
//!
//! ```ignore
//! let handler = traced(tracer, counted(page_counter, basic_page));
//! let server = RequestServer::new(ServerConfig::default(), handler);
//! server.spawn();
//! ```

pub mod config;
pub mod page;
pub mod server;

pub use config::ServerConfig;
pub use page::{basic_page, Handler, HandlerError, THE_PAGE};
pub use server::{RequestServer, EXIT_REQUEST};
