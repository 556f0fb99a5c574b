//! Data models

pub mod outcome;
pub mod request;
pub mod resource;

pub use outcome::*;
pub use request::*;
pub use resource::*;
