//! `fetchpool` coordinates HTTP fetchers.
//!
//! It admits concurrent requests per host, pools a reusable transport
//! session, and lets pluggable decorators attach headers before a request is
//! dispatched.
//!
//! "Hello world" example, using a service in test mode so that nothing
//! reaches the network:
//!
//! ```
//! use fetchpool_lib::{FetcherService, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let service = FetcherService::mock(Some(b"hello".to_vec()), None)?;
//!   let fetcher = service.fetcher_with_url_string("https://example.com")?;
//!   fetcher.start();
//!   let response = fetcher.completion().await.expect("faked response");
//!   assert_eq!(response.text(), "hello");
//!   Ok(())
//! }
//! ```
//!
//! For real requests, configure a service with the
//! [`FetcherServiceBuilder`]:
//!
//! ```no_run
//! use std::time::Duration;
//! use fetchpool_lib::{FetcherServiceBuilder, FetcherServiceConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let config = FetcherServiceConfig {
//!     max_running_fetchers_per_host: 4,
//!     unused_session_timeout: Duration::from_secs(30),
//!     ..FetcherServiceConfig::default()
//!   };
//!   let service = FetcherServiceBuilder::builder().config(config).build().service()?;
//!   let fetcher = service.fetcher_with_url_string("https://example.com")?;
//!   fetcher.start();
//!   let response = fetcher.completion().await;
//!   println!("{response:?}");
//!   Ok(())
//! }
//! ```
#![warn(missing_docs)]

mod types;
mod utils;

pub mod decorator;
pub mod fetcher;
pub mod queue;
pub mod service;
pub mod session;
pub mod testing;
#[cfg(test)]
#[macro_use]
pub mod test_utils;

pub use decorator::{DecoratorChain, DecoratorPhase, HeaderDecorator};
pub use fetcher::{
    Authorizer, DefaultFetcherFactory, Fetcher, FetcherFactory, FetcherId, FetcherParts,
    FetcherPhase, FetcherSettings, RetryPolicy,
};
pub use queue::{FetcherCounts, HostKey};
pub use service::{
    FetcherService, FetcherServiceBuilder, FetcherServiceConfig, ServiceId, TestBlock,
};
pub use session::{
    ReqwestTransport, SessionConfiguration, SessionConfigurationBlock, SessionId,
    SessionInvalidated, Transport,
};
pub use types::*;
