//! `Channel` and `Pipeline`: the connection-side collaborators the upgrader
//! drives but does not own. Their real implementations — the byte pipeline,
//! the frame codecs, the protocol-error handler — live outside this crate;
//! what's modeled here is the narrow interface the upgrader needs.

use async_trait::async_trait;

use crate::error::PipelineError;

/// A handler the upgrader installs on a [`Pipeline`].
///
/// Each variant stands in for a handler whose implementation is out of
/// scope: the frame encoder/decoder wrap the (unspecified) WebSocket frame
/// codec, and `ProtocolErrorHandler` reacts to frame-decode failures by
/// sending an error response and closing the connection.
#[derive(Debug, Clone)]
pub enum PipelineHandler {
    WebSocketFrameEncoder,
    WebSocketFrameDecoder {
        max_frame_size: u32,
        /// Always `false` for handlers installed by [`crate::upgrade::Upgrader`]:
        /// decode errors are surfaced to the pipeline rather than handled by
        /// the decoder itself, so the dedicated `ProtocolErrorHandler` (or the
        /// caller) can react to them.
        automatic_error_handling: bool,
    },
    ProtocolErrorHandler,
}

/// Ordered chain of handlers processing bytes and messages on a connection.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Append `handler` at the tail of the pipeline.
    async fn add_handler(&self, handler: PipelineHandler) -> Result<(), PipelineError>;
}

/// An opaque per-connection handle, passed through the upgrader to user
/// callbacks and carrying the connection's [`Pipeline`].
pub trait Channel: Send + Sync {
    fn pipeline(&self) -> &dyn Pipeline;
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    //! An in-memory [`Channel`]/[`Pipeline`] pair for exercising the upgrader
    //! without a real connection.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPipeline {
        installed: Mutex<Vec<PipelineHandler>>,
    }

    impl RecordingPipeline {
        pub fn installed_handlers(&self) -> Vec<PipelineHandler> {
            self.installed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Pipeline for RecordingPipeline {
        async fn add_handler(&self, handler: PipelineHandler) -> Result<(), PipelineError> {
            self.installed.lock().unwrap().push(handler);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingChannel {
        pipeline: RecordingPipeline,
    }

    impl RecordingChannel {
        pub fn installed_handlers(&self) -> Vec<PipelineHandler> {
            self.pipeline.installed_handlers()
        }
    }

    impl Channel for RecordingChannel {
        fn pipeline(&self) -> &dyn Pipeline {
            &self.pipeline
        }
    }
}
