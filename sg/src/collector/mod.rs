//! Reply collection
//!
//! A [`ReplyCollector`] runs one scatter-gather round at a time:
//! - **Subscribe first:** a fresh reply address is live before the request goes out
//! - **Race:** count replies until `max_replies` arrive or the window closes
//! - **Release:** the reply subscription is removed before the round returns

mod core;
mod session;
mod sink;

pub use core::{GatherReport, GatherRequest, ReplyCollector};
pub use session::{AggregationSession, SessionState};
pub use sink::{CollectingSink, NullSink, PrintSink, ReplySink, header_lines, render_body};
