pub mod clock;
pub mod error;
pub mod id;

pub use clock::*;
pub use error::*;
pub use id::*;
