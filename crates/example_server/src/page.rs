use thiserror::Error;

/// The only page the server ever renders.
pub const THE_PAGE: &str =
    "<HTML><HEAD><TITLE>ExampleHttpServer</TITLE></HEAD><BODY>Nothing Here</BODY></HTML>";

/// A request handler failed to produce a page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Handler type the [`RequestServer`](crate::RequestServer) calls with each request line.
pub type Handler = dyn Fn(&str) -> Result<String, HandlerError> + Send + Sync;

/// Renders the fixed page for every request, including `/exit`.
pub fn basic_page(_request_line: &str) -> Result<String, HandlerError> {
    Ok(THE_PAGE.to_string())
}
