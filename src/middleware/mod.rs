//! Layers every application installs first, in this order:
//!
//! 1. [`query`] parses the query string with the application's
//!    `query parser fn`.
//! 2. [`init`] binds the request and response to the application that is
//!    currently dispatching them.

mod init;
mod query;

pub(crate) use init::init;
pub(crate) use query::query;
