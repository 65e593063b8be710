//! HTTP middleware: request ids + problem bodies, request logging.

pub mod logging;
pub mod request_id;

pub use logging::request_logging;
pub use request_id::{request_context, RequestId};
