#[cfg(test)]
mod service {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use fetchpool_lib::service::DEFAULT_USER_AGENT;
    use fetchpool_lib::testing::{RecordingTransport, SESSION_ID_HEADER, wait_for_all_fetchers};
    use fetchpool_lib::{
        Authorizer, Credential, DecoratorPhase, ErrorKind, FetchRequest, FetchResponse, Fetcher,
        FetcherFactory, FetcherParts, FetcherPhase, FetcherService, FetcherServiceBuilder,
        FetcherServiceConfig, HeaderDecorator, Result, SessionConfigurationBlock, Transport,
    };
    use http::header::AUTHORIZATION;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    struct ClientHeader;

    impl HeaderDecorator for ClientHeader {
        fn additional_headers(&self, _: &FetchRequest, phase: DecoratorPhase) -> Option<HeaderMap> {
            let mut headers = HeaderMap::new();
            let value = match phase {
                DecoratorPhase::Creation => "fetchpool",
                DecoratorPhase::Redirect | DecoratorPhase::Retry => return None,
            };
            headers.insert("x-client", HeaderValue::from_static(value));
            Some(headers)
        }
    }

    #[derive(Debug)]
    struct BearerToken(&'static str);

    #[async_trait]
    impl Authorizer for BearerToken {
        async fn authorize_request(&self, request: &mut FetchRequest) -> Result<()> {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.0))?;
            request.headers.insert(AUTHORIZATION, value);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct ExpiredToken;

    #[async_trait]
    impl Authorizer for ExpiredToken {
        async fn authorize_request(&self, _: &mut FetchRequest) -> Result<()> {
            Err(ErrorKind::Authorization("token expired".into()))
        }
    }

    #[derive(Debug)]
    struct IsolatingFactory;

    impl FetcherFactory for IsolatingFactory {
        fn create_fetcher(&self, mut parts: FetcherParts) -> Fetcher {
            parts.settings.use_isolated_session = true;
            Fetcher::from_parts(parts)
        }
    }

    fn recording_service(transport: &Arc<RecordingTransport>) -> FetcherService {
        let transport: Arc<dyn Transport> = transport.clone();
        FetcherServiceBuilder::builder()
            .transport(transport)
            .build()
            .service()
            .unwrap()
    }

    fn session_of(response: &FetchResponse) -> HeaderValue {
        response.headers[SESSION_ID_HEADER].clone()
    }

    #[tokio::test]
    async fn test_fetch_from_mock_server() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(header("x-client", "fetchpool"))
            .and(header("user-agent", DEFAULT_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = FetcherServiceConfig {
            allow_localhost_request: true,
            ..FetcherServiceConfig::default()
        };
        let service = FetcherServiceBuilder::builder()
            .config(config)
            .build()
            .service()
            .unwrap();
        let decorator: Arc<dyn HeaderDecorator> = Arc::new(ClientHeader);
        service.add_header_decorator(&decorator);

        let fetcher = service
            .fetcher_with_url_string(&format!("{}/data", mock_server.uri()))
            .unwrap();
        fetcher.start();
        let response = fetcher.completion().await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "payload");
        assert_eq!(fetcher.phase(), FetcherPhase::Finished);
        assert!(wait_for_all_fetchers(&service, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_plain_localhost_refused_by_default() {
        let mock_server = MockServer::start().await;
        let service = FetcherService::new().unwrap();
        let fetcher = service.fetcher_with_url_string(&mock_server.uri()).unwrap();
        fetcher.start();
        let err = fetcher.completion().await.unwrap_err();
        assert!(matches!(*err, ErrorKind::InsecureRequest(_)));
    }

    #[tokio::test]
    async fn test_mock_service_delivers_faked_data() {
        let service = FetcherService::mock(Some(b"D".to_vec()), None).unwrap();
        let fetcher = service
            .fetcher_with_url_string("https://example.com/data")
            .unwrap();
        fetcher.start();

        let response = fetcher.completion().await.unwrap();
        assert_eq!(response.body, b"D");
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_fetchers_share_session() {
        let transport = Arc::new(RecordingTransport::new());
        let service = recording_service(&transport);

        let first = service.fetcher_with_url_string("https://a.example").unwrap();
        first.start();
        let first = first.completion().await.unwrap();

        let second = service.fetcher_with_url_string("https://b.example").unwrap();
        second.start();
        let second = second.completion().await.unwrap();

        assert_eq!(session_of(&first), session_of(&second));
        assert_eq!(transport.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_session_expires() {
        let transport = Arc::new(RecordingTransport::new());
        let service = recording_service(&transport);
        service.set_unused_session_timeout(Duration::from_secs(5));
        let mut events = service.subscribe_session_events();

        let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
        fetcher.start();
        let first = fetcher.completion().await.unwrap();
        assert!(wait_for_all_fetchers(&service, Duration::from_secs(1)).await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
        fetcher.start();
        let second = fetcher.completion().await.unwrap();
        assert_eq!(session_of(&first), session_of(&second));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.service, service.id());
        assert_eq!(transport.invalidated(), vec![event.session]);

        let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
        fetcher.start();
        let third = fetcher.completion().await.unwrap();
        assert_ne!(session_of(&first), session_of(&third));
        assert_eq!(transport.created(), 2);
    }

    #[tokio::test]
    async fn test_reset_session_while_running() {
        let transport = Arc::new(RecordingTransport::gated());
        let service = recording_service(&transport);
        let mut events = service.subscribe_session_events();

        let running: Vec<_> = (0..2)
            .map(|i| {
                service
                    .fetcher_with_url_string(&format!("https://example.com/{i}"))
                    .unwrap()
            })
            .collect();
        for fetcher in &running {
            fetcher.start();
        }
        while transport.in_flight() < 2 {
            tokio::task::yield_now().await;
        }
        let old_session = running[0].session_id().unwrap();

        service.reset_session();
        assert_eq!(events.recv().await.unwrap().session, old_session);

        transport.open(2);
        for fetcher in &running {
            let response = fetcher.completion().await.unwrap();
            assert_eq!(
                session_of(&response),
                HeaderValue::from(old_session.as_u64())
            );
        }

        let next = service.fetcher_with_url_string("https://example.com/next").unwrap();
        next.start();
        while transport.in_flight() < 1 {
            tokio::task::yield_now().await;
        }
        assert_ne!(next.session_id(), Some(old_session));
        transport.open(1);
        assert!(next.completion().await.is_ok());
        assert_eq!(transport.created(), 2);
    }

    #[tokio::test]
    async fn test_cap_raise_promotes_exactly_one() {
        let transport = Arc::new(RecordingTransport::gated());
        let service = recording_service(&transport);
        service.set_max_running_fetchers_per_host(1);

        let fetchers: Vec<_> = (0..3)
            .map(|i| {
                service
                    .fetcher_with_url_string(&format!("https://a.example/{i}"))
                    .unwrap()
            })
            .collect();
        for fetcher in &fetchers {
            fetcher.start();
        }
        assert_eq!(service.number_of_running_fetchers(), 1);
        assert_eq!(service.number_of_delayed_fetchers(), 2);

        service.set_max_running_fetchers_per_host(2);
        assert_eq!(service.number_of_running_fetchers(), 2);
        assert_eq!(service.number_of_delayed_fetchers(), 1);
        assert_eq!(fetchers[1].phase(), FetcherPhase::Running);
        assert!(service.is_delaying_fetcher(&fetchers[2]));

        transport.open(3);
        assert!(wait_for_all_fetchers(&service, Duration::from_secs(5)).await);
        for fetcher in &fetchers {
            assert!(fetcher.completion().await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_isolated_fetchers_bypass_cap() {
        let transport = Arc::new(RecordingTransport::gated());
        let service = FetcherServiceBuilder::builder()
            .transport(transport.clone() as Arc<dyn Transport>)
            .fetcher_factory(Arc::new(IsolatingFactory) as Arc<dyn FetcherFactory>)
            .build()
            .service()
            .unwrap();
        service.set_max_running_fetchers_per_host(1);

        let fetchers: Vec<_> = (0..3)
            .map(|_| service.fetcher_with_url_string("https://example.com").unwrap())
            .collect();
        for fetcher in &fetchers {
            assert!(fetcher.uses_isolated_session());
            fetcher.start();
        }
        assert_eq!(service.number_of_running_fetchers(), 3);
        assert_eq!(service.number_of_delayed_fetchers(), 0);

        while transport.in_flight() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.created(), 3);
        assert!(service.sessions().session().is_none());

        transport.open(3);
        assert!(wait_for_all_fetchers(&service, Duration::from_secs(5)).await);
        // Private sessions go away with their fetcher
        assert_eq!(transport.invalidated().len(), 3);
    }

    #[tokio::test]
    async fn test_authorizer_runs_before_dispatch() {
        let transport = Arc::new(RecordingTransport::new());
        let service = FetcherServiceBuilder::builder()
            .transport(transport.clone() as Arc<dyn Transport>)
            .authorizer(Arc::new(BearerToken("t0ken")) as Arc<dyn Authorizer>)
            .build()
            .service()
            .unwrap();

        let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
        fetcher.start();
        assert!(fetcher.completion().await.is_ok());

        let executed = transport.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(
            executed[0].1.headers.get(AUTHORIZATION),
            Some(&HeaderValue::from_static("Bearer t0ken"))
        );
    }

    #[tokio::test]
    async fn test_refused_authorization_never_reaches_transport() {
        let transport = Arc::new(RecordingTransport::new());
        let service = recording_service(&transport);
        service.set_authorizer(Some(Arc::new(ExpiredToken) as Arc<dyn Authorizer>));

        let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
        fetcher.start();
        assert_eq!(
            *fetcher.completion().await.unwrap_err(),
            ErrorKind::Authorization("token expired".into())
        );
        assert!(transport.executed().is_empty());
        assert_eq!(transport.created(), 0);
    }

    #[tokio::test]
    async fn test_proxy_settings_reach_the_session() {
        let transport = Arc::new(RecordingTransport::new());
        let service = FetcherServiceBuilder::builder()
            .config(FetcherServiceConfig {
                proxy: Some(url::Url::parse("http://proxy.internal:3128").unwrap()),
                ..FetcherServiceConfig::default()
            })
            .proxy_credential(Credential::new("proxy", "secret"))
            .transport(transport.clone() as Arc<dyn Transport>)
            .build()
            .service()
            .unwrap();

        let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
        fetcher.start();
        assert!(fetcher.completion().await.is_ok());

        let configurations = transport.configurations();
        assert_eq!(configurations.len(), 1);
        assert_eq!(
            configurations[0].proxy.as_ref().map(url::Url::as_str),
            Some("http://proxy.internal:3128/")
        );
        assert_eq!(
            configurations[0].proxy_credential,
            Some(Credential::new("proxy", "secret"))
        );
    }

    #[tokio::test]
    async fn test_configuration_block_shapes_sessions() {
        let transport = Arc::new(RecordingTransport::new());
        let service = FetcherServiceBuilder::builder()
            .session_configuration_block(SessionConfigurationBlock::new(|configuration| {
                configuration.pool_idle_timeout = Some(Duration::from_secs(15));
                configuration
                    .default_headers
                    .insert("x-team", HeaderValue::from_static("search"));
            }))
            .transport(transport.clone() as Arc<dyn Transport>)
            .build()
            .service()
            .unwrap();

        for _ in 0..2 {
            let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
            fetcher.start();
            assert!(fetcher.completion().await.is_ok());
        }
        // Same hook, same configuration, so the session is shared
        assert_eq!(transport.created(), 1);
        let configuration = &transport.configurations()[0];
        assert_eq!(configuration.pool_idle_timeout, Some(Duration::from_secs(15)));
        assert_eq!(configuration.default_headers["x-team"], "search");

        service.set_session_configuration_block(Some(SessionConfigurationBlock::new(
            |configuration| configuration.pool_max_idle_per_host = Some(1),
        )));
        let fetcher = service.fetcher_with_url_string("https://example.com").unwrap();
        fetcher.start();
        assert!(fetcher.completion().await.is_ok());
        assert_eq!(transport.created(), 2);
        assert_eq!(transport.configurations()[1].pool_max_idle_per_host, Some(1));
    }

    #[tokio::test]
    async fn test_stop_all_discards_running_work() {
        let transport = Arc::new(RecordingTransport::gated());
        let service = recording_service(&transport);
        service.set_max_running_fetchers_per_host(1);

        let running = service.fetcher_with_url_string("https://example.com/1").unwrap();
        let delayed = service.fetcher_with_url_string("https://example.com/2").unwrap();
        running.start();
        delayed.start();
        while transport.in_flight() < 1 {
            tokio::task::yield_now().await;
        }

        service.stop_all_fetchers();
        service.stop_all_fetchers();
        assert_eq!(service.number_of_fetchers(), 0);
        assert_eq!(running.phase(), FetcherPhase::Stopped);
        assert_eq!(delayed.phase(), FetcherPhase::Stopped);
        assert!(running.completion().await.is_err());

        // The delayed fetcher never reached the transport
        assert_eq!(transport.executed().len(), 1);
    }
}
