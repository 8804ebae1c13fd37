//! Run history - a local record of actions and workflows that ran

mod schema;
mod store;

pub use store::History;
