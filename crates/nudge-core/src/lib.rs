pub mod error;
pub mod fakes;
pub mod repeat;
pub mod retry;
pub mod traits;
pub mod types;
pub mod validate;

pub use error::{Conflict, Error, Result};
pub use traits::*;
pub use types::*;
