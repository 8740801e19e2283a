//! Request classification, policy matching, and the dispatch pipeline.

pub mod dispatcher;
pub mod matcher;
pub mod request_info;

pub use dispatcher::{ConnectionContext, Dispatcher};
pub use request_info::RequestInfo;
