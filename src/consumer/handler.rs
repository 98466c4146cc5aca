use std::future::Future;

use crate::MessageData;

/// Error type a handler may return. Logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Callback invoked for every message a [`Consumer`](crate::Consumer)
/// receives.
///
/// Implemented for any `Fn(MessageData) -> impl Future<Output = HandlerResult>`,
/// so closures work directly:
///
/// ```
/// use mq_bridge::{HandlerError, MessageData};
///
/// let handler = |msg: MessageData| async move {
///     println!("got {}", msg.message_id);
///     Ok::<_, HandlerError>(())
/// };
/// # let _ = handler;
/// ```
///
/// A handler that fails or panics is logged and skipped; delivery to the
/// remaining handlers continues and nothing is acknowledged on its behalf.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: MessageData) -> HandlerResult;
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: MessageData) -> HandlerResult {
        (self)(message).await
    }
}
