mod frame;
pub use frame::*;

mod settings;
pub use settings::*;

mod stream;
pub use stream::*;

mod varint;
pub use varint::*;

pub mod error;
pub mod headers;
