//! The WebSocket server-side upgrade protocol engine: RFC 6455 handshake
//! negotiation and pipeline rewiring from HTTP framing to WebSocket framing.

mod accept;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::header;
use http::HeaderValue;
use tracing::{instrument, trace};

use crate::error::{PipelineError, UpgradeError};
use crate::headers::{HttpHeaders, HttpRequestHead};
use crate::pipeline::{Channel, PipelineHandler};
use accept::accept_token;

/// Default value of [`UpgraderBuilder::max_frame_size`].
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Upper bound on `max_frame_size`: the RFC allows up to 2^64-1, but this
/// implementation's precondition caps it at 2^32-1.
pub const MAX_FRAME_SIZE_LIMIT: u32 = u32::MAX;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `(Channel, HttpRequestHead) -> Future<Option<HttpHeaders>>`.
pub type ShouldUpgrade = Arc<
    dyn Fn(Arc<dyn Channel>, HttpRequestHead) -> BoxFuture<'static, Result<Option<HttpHeaders>, UpgradeError>>
        + Send
        + Sync,
>;

/// `(Channel, HttpRequestHead) -> Future<()>`.
pub type UpgradePipelineHandler =
    Arc<dyn Fn(Arc<dyn Channel>, HttpRequestHead) -> BoxFuture<'static, ()> + Send + Sync>;

/// Negotiates RFC 6455 handshakes atop an HTTP/1.1 request/response and
/// rewires a connection's pipeline from HTTP framing to WebSocket framing.
///
/// Holds no mutable state after construction; `Clone` is cheap (an `Arc`
/// bump per callback).
#[derive(Clone)]
pub struct Upgrader {
    max_frame_size: u32,
    automatic_error_handling: bool,
    should_upgrade: ShouldUpgrade,
    upgrade_pipeline_handler: UpgradePipelineHandler,
}

impl Upgrader {
    /// Start building an `Upgrader`. Both callbacks are required.
    pub fn builder(
        should_upgrade: ShouldUpgrade,
        upgrade_pipeline_handler: UpgradePipelineHandler,
    ) -> UpgraderBuilder {
        UpgraderBuilder {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            automatic_error_handling: true,
            should_upgrade,
            upgrade_pipeline_handler,
        }
    }

    /// The single `Upgrade` token this component advertises.
    ///
    /// The enclosing HTTP upgrade framework does not need to be told about
    /// `Sec-WebSocket-*` headers up front — the RFC does not require clients
    /// to list them in the `Upgrade` header, so this component validates them
    /// itself inside [`Self::build_upgrade_response`].
    pub const fn supported_protocol() -> &'static str {
        "websocket"
    }

    /// No upgrade headers are declared as required to the enclosing
    /// framework (see [`Self::supported_protocol`]).
    pub const fn required_upgrade_headers() -> &'static [&'static str] {
        &[]
    }

    /// Validate the request, consult `should_upgrade`, and compute the
    /// merged response headers. Does not mutate the pipeline.
    #[instrument(skip_all)]
    pub async fn build_upgrade_response(
        &self,
        channel: Arc<dyn Channel>,
        request: &HttpRequestHead,
        mut base_headers: HttpHeaders,
    ) -> Result<HttpHeaders, UpgradeError> {
        let key = request
            .headers
            .single(&header::SEC_WEBSOCKET_KEY)
            .ok_or(UpgradeError::InvalidUpgradeHeader("Sec-WebSocket-Key"))?;

        let version = request
            .headers
            .single_exact(&header::SEC_WEBSOCKET_VERSION)
            .ok_or(UpgradeError::InvalidUpgradeHeader("Sec-WebSocket-Version"))?;
        if version != "13" {
            return Err(UpgradeError::InvalidUpgradeHeader("Sec-WebSocket-Version"));
        }

        let extra = (self.should_upgrade)(channel, request.clone()).await?;
        let extra = extra.ok_or(UpgradeError::UnsupportedWebSocketTarget)?;

        base_headers.replace_or_add(header::UPGRADE, HeaderValue::from_static("websocket"));
        base_headers.add(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&accept_token(&key)).expect("base64 is a valid header value"),
        );
        base_headers.replace_or_add(header::CONNECTION, HeaderValue::from_static("upgrade"));
        for (name, value) in extra.iter() {
            base_headers.add(name.clone(), value.clone());
        }

        trace!(websocket.accept = true, "accepted websocket upgrade");
        Ok(base_headers)
    }

    /// Rewires the pipeline from HTTP framing to WebSocket framing, then
    /// invokes `upgrade_pipeline_handler`.
    ///
    /// Must only be called after the enclosing framework has flushed the 101
    /// response. If installing a handler fails partway through, handlers
    /// already installed are left in place — tearing down the pipeline on
    /// failure is the pipeline's responsibility, not this component's.
    #[instrument(skip_all)]
    pub async fn upgrade(
        &self,
        channel: Arc<dyn Channel>,
        request: HttpRequestHead,
    ) -> Result<(), PipelineError> {
        let pipeline = channel.pipeline();

        pipeline.add_handler(PipelineHandler::WebSocketFrameEncoder).await?;
        pipeline
            .add_handler(PipelineHandler::WebSocketFrameDecoder {
                max_frame_size: self.max_frame_size,
                automatic_error_handling: false,
            })
            .await?;
        if self.automatic_error_handling {
            pipeline.add_handler(PipelineHandler::ProtocolErrorHandler).await?;
        }

        (self.upgrade_pipeline_handler)(channel, request).await;
        Ok(())
    }
}

/// Builder for [`Upgrader`].
pub struct UpgraderBuilder {
    max_frame_size: u32,
    automatic_error_handling: bool,
    should_upgrade: ShouldUpgrade,
    upgrade_pipeline_handler: UpgradePipelineHandler,
}

impl UpgraderBuilder {
    /// Maximum WebSocket frame size the installed decoder will accept.
    ///
    /// # Panics
    ///
    /// Panics if `max_frame_size` is zero. The upper bound is enforced by the
    /// type (`u32`, i.e. at most 2^32-1).
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        assert!(max_frame_size >= 1, "max_frame_size must be at least 1");
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn automatic_error_handling(mut self, automatic_error_handling: bool) -> Self {
        self.automatic_error_handling = automatic_error_handling;
        self
    }

    pub fn build(self) -> Upgrader {
        Upgrader {
            max_frame_size: self.max_frame_size,
            automatic_error_handling: self.automatic_error_handling,
            should_upgrade: self.should_upgrade,
            upgrade_pipeline_handler: self.upgrade_pipeline_handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_util::RecordingChannel;
    use http::{HeaderValue, Method, Uri, Version};

    fn request_with(key: Option<&str>, version: Option<&str>) -> HttpRequestHead {
        let mut headers = HttpHeaders::new();
        if let Some(key) = key {
            headers.add(header::SEC_WEBSOCKET_KEY, HeaderValue::from_str(key).unwrap());
        }
        if let Some(version) = version {
            headers.add(
                header::SEC_WEBSOCKET_VERSION,
                HeaderValue::from_str(version).unwrap(),
            );
        }
        headers.add(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.add(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        HttpRequestHead::new(Method::GET, Uri::from_static("/chat"), Version::HTTP_11, headers)
    }

    fn accepting_upgrader() -> Upgrader {
        let should_upgrade: ShouldUpgrade = Arc::new(|_channel, _request| {
            Box::pin(async { Ok(Some(HttpHeaders::new())) })
        });
        let handler: UpgradePipelineHandler = Arc::new(|_channel, _request| Box::pin(async {}));
        Upgrader::builder(should_upgrade, handler).build()
    }

    #[tokio::test]
    async fn happy_upgrade_produces_required_headers() {
        let upgrader = accepting_upgrader();
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel::default());
        let request = request_with(Some("dGhlIHNhbXBsZSBub25jZQ=="), Some("13"));

        let response = upgrader
            .build_upgrade_response(channel, &request, HttpHeaders::new())
            .await
            .unwrap();

        assert_eq!(response.single(&header::UPGRADE).as_deref(), Some("websocket"));
        assert_eq!(response.single(&header::CONNECTION).as_deref(), Some("upgrade"));
        assert_eq!(
            response.single(&header::SEC_WEBSOCKET_ACCEPT).as_deref(),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[tokio::test]
    async fn rejected_by_predicate_does_not_mutate_pipeline() {
        let should_upgrade: ShouldUpgrade = Arc::new(|_channel, _request| Box::pin(async { Ok(None) }));
        let handler: UpgradePipelineHandler = Arc::new(|_channel, _request| Box::pin(async {}));
        let upgrader = Upgrader::builder(should_upgrade, handler).build();
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel::default());
        let request = request_with(Some("dGhlIHNhbXBsZSBub25jZQ=="), Some("13"));

        let err = upgrader
            .build_upgrade_response(channel, &request, HttpHeaders::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::UnsupportedWebSocketTarget));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let upgrader = accepting_upgrader();
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel::default());
        for version in ["8", "13 ", "14", "13,13", "12"] {
            let request = request_with(Some("dGhlIHNhbXBsZSBub25jZQ=="), Some(version));
            let err = upgrader
                .build_upgrade_response(channel.clone(), &request, HttpHeaders::new())
                .await
                .unwrap_err();
            assert!(matches!(err, UpgradeError::InvalidUpgradeHeader("Sec-WebSocket-Version")));
        }
    }

    #[tokio::test]
    async fn missing_version_is_rejected() {
        let upgrader = accepting_upgrader();
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel::default());
        let request = request_with(Some("dGhlIHNhbXBsZSBub25jZQ=="), None);
        let err = upgrader
            .build_upgrade_response(channel, &request, HttpHeaders::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::InvalidUpgradeHeader("Sec-WebSocket-Version")));
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let upgrader = accepting_upgrader();
        let channel: Arc<dyn Channel> = Arc::new(RecordingChannel::default());
        let mut request = request_with(Some("dGhlIHNhbXBsZSBub25jZQ=="), Some("13"));
        request
            .headers
            .add(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("other-key"));
        let err = upgrader
            .build_upgrade_response(channel, &request, HttpHeaders::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpgradeError::InvalidUpgradeHeader("Sec-WebSocket-Key")));
    }

    #[tokio::test]
    async fn upgrade_installs_handlers_then_invokes_user_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_calls_clone = hook_calls.clone();
        let should_upgrade: ShouldUpgrade =
            Arc::new(|_channel, _request| Box::pin(async { Ok(Some(HttpHeaders::new())) }));
        let handler: UpgradePipelineHandler = Arc::new(move |_channel, _request| {
            let hook_calls = hook_calls_clone.clone();
            Box::pin(async move {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let upgrader = Upgrader::builder(should_upgrade, handler)
            .max_frame_size(32)
            .build();

        let channel = Arc::new(RecordingChannel::default());
        let request = request_with(Some("dGhlIHNhbXBsZSBub25jZQ=="), Some("13"));
        upgrader
            .upgrade(channel.clone(), request)
            .await
            .expect("upgrade should succeed");

        let installed = channel.installed_handlers();
        assert_eq!(installed.len(), 3);
        assert!(matches!(installed[0], PipelineHandler::WebSocketFrameEncoder));
        assert!(matches!(
            installed[1],
            PipelineHandler::WebSocketFrameDecoder {
                max_frame_size: 32,
                automatic_error_handling: false
            }
        ));
        assert!(matches!(installed[2], PipelineHandler::ProtocolErrorHandler));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }
}
