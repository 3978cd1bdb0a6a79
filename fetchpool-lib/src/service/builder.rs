use std::sync::{Arc, RwLock};

use http::HeaderValue;
use tokio::runtime::Handle;
use typed_builder::TypedBuilder;

use super::dispatch::{Dispatcher, FakeDispatcher, TestBlock, TransportDispatcher};
use super::{FetcherService, FetcherServiceConfig, ServiceDefaults, ServiceId, ServiceInner};
use crate::decorator::DecoratorChain;
use crate::fetcher::{Authorizer, DefaultFetcherFactory, FetcherFactory};
use crate::queue::HostQueue;
use crate::session::{
    ReqwestTransport, SessionConfigurationBlock, SessionManager, Transport,
};
use crate::{Credential, ErrorKind, Result};

/// Builder for [`FetcherService`].
///
/// See the field docs for the available knobs. Every field is optional.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[builder(builder_method(doc = "
Create a builder for building `FetcherServiceBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `FetcherServiceBuilder`.
"))]
pub struct FetcherServiceBuilder {
    /// Service-wide defaults
    config: FetcherServiceConfig,

    /// Basic auth credential stamped onto every fetcher
    credential: Option<Credential>,

    /// Proxy credential stamped onto every fetcher
    proxy_credential: Option<Credential>,

    /// Hook run on every request right before dispatch
    authorizer: Option<Arc<dyn Authorizer>>,

    /// Hook adjusting the session configuration of every fetcher before a
    /// session is acquired for it
    session_configuration_block: Option<SessionConfigurationBlock>,

    /// Source of transport sessions. Defaults to [`ReqwestTransport`].
    transport: Option<Arc<dyn Transport>>,

    /// Builds the fetchers the service hands out. Defaults to
    /// [`DefaultFetcherFactory`].
    fetcher_factory: Option<Arc<dyn FetcherFactory>>,

    /// Put the service in test mode. Requests never reach the transport and
    /// are answered by this block instead.
    test_block: Option<TestBlock>,

    /// Runtime to spawn fetchers and session timers on. Defaults to the
    /// runtime the service is built in.
    runtime: Option<Handle>,
}

impl Default for FetcherServiceBuilder {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl FetcherServiceBuilder {
    /// Instantiate the [`FetcherService`].
    ///
    /// # Errors
    ///
    /// Returns an error if no runtime was given and the builder is not called
    /// from within a tokio runtime, or if the configured user agent is not a
    /// valid header value.
    pub fn service(self) -> Result<FetcherService> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ErrorKind::MissingRuntime)?,
        };
        let user_agent = self
            .config
            .user_agent
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()?;

        let id = ServiceId::next();
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport));
        let sessions = SessionManager::new(
            id,
            transport,
            runtime.clone(),
            self.config.reuse_session,
            self.config.unused_session_timeout,
        );
        let dispatcher: Arc<dyn Dispatcher> = match self.test_block {
            Some(block) => Arc::new(FakeDispatcher::new(block)),
            None => Arc::new(TransportDispatcher::new(sessions.clone())),
        };

        Ok(FetcherService {
            inner: Arc::new(ServiceInner {
                id,
                queue: HostQueue::new(self.config.max_running_fetchers_per_host),
                sessions,
                decorators: DecoratorChain::new(),
                defaults: RwLock::new(ServiceDefaults {
                    config: self.config,
                    credential: self.credential,
                    proxy_credential: self.proxy_credential,
                    authorizer: self.authorizer,
                    configuration_block: self.session_configuration_block,
                    user_agent,
                }),
                dispatcher: RwLock::new(dispatcher),
                factory: self
                    .fetcher_factory
                    .unwrap_or_else(|| Arc::new(DefaultFetcherFactory)),
                runtime,
            }),
        })
    }
}
