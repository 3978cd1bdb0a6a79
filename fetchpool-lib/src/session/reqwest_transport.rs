use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::{Session, SessionConfiguration, SessionDelegate, SessionId, Transport};
use crate::{Credential, ErrorKind, FetchRequest, FetchResponse, Result};

/// TCP keepalive
/// See <https://tldp.org/HOWTO/TCP-Keepalive-HOWTO/overview.html> for more info
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// The default transport, backed by a [`reqwest::Client`] per session
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestTransport;

impl Transport for ReqwestTransport {
    fn create_session(
        &self,
        configuration: &SessionConfiguration,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Result<Arc<dyn Session>> {
        let mut builder = reqwest::Client::builder()
            .tcp_keepalive(TCP_KEEPALIVE)
            .danger_accept_invalid_certs(configuration.accept_invalid_certs);
        if let Some(timeout) = configuration.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(connect_timeout) = configuration.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        if let Some(idle_timeout) = configuration.pool_idle_timeout {
            builder = builder.pool_idle_timeout(idle_timeout);
        }
        if let Some(max_idle) = configuration.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(max_idle);
        }
        if !configuration.default_headers.is_empty() {
            builder = builder.default_headers(configuration.default_headers.clone());
        }
        if let Some(proxy) = &configuration.proxy {
            let mut proxy =
                reqwest::Proxy::all(proxy.clone()).map_err(ErrorKind::BuildTransport)?;
            if let Some(credential) = &configuration.proxy_credential {
                proxy = proxy.basic_auth(&credential.username, credential.expose_password());
            }
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(ErrorKind::BuildTransport)?;

        let session = ReqwestSession {
            id: SessionId::next(),
            client,
            valid: AtomicBool::new(true),
            delegate,
        };
        debug!("Created {} with {configuration:?}", session.id);
        Ok(Arc::new(session))
    }
}

/// A session wrapping one [`reqwest::Client`] and its connection pool
#[derive(Debug)]
pub struct ReqwestSession {
    id: SessionId,
    client: reqwest::Client,
    valid: AtomicBool,
    delegate: Arc<dyn SessionDelegate>,
}

#[async_trait]
impl Session for ReqwestSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn invalidate(&self) {
        // Requests in flight keep their clone of the client and finish normally
        if self.valid.swap(false, Ordering::AcqRel) {
            self.delegate.session_did_become_invalid(self.id);
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    async fn execute(
        &self,
        request: FetchRequest,
        credential: Option<&Credential>,
    ) -> Result<FetchResponse> {
        let FetchRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(credential) = credential {
            builder = builder.basic_auth(&credential.username, Some(credential.expose_password()));
        }

        let response = builder.send().await.map_err(ErrorKind::NetworkRequest)?;
        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(ErrorKind::NetworkRequest)?;

        Ok(FetchResponse {
            url,
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
