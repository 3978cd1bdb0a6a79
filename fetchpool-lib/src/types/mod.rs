#![allow(unreachable_pub)]

mod credentials;
mod error;
mod request;
mod response;

pub use credentials::Credential;
pub use error::ErrorKind;
pub use request::FetchRequest;
pub use response::{FetchResponse, FetchResult};

/// The fetchpool `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
