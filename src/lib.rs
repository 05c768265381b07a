mod error;
pub use error::*;

mod executor;
pub use executor::*;

mod handler;
pub use handler::*;

mod message;
pub use message::*;

mod quic;
pub use quic::*;

mod session;
pub use session::*;

mod transaction;
pub use transaction::{EgressState, IngressState, Transaction};

mod push;
pub use push::PushId;

pub mod proto;

// Internal plumbing behind the session.
mod control;
mod dispatch;
mod qpack;
