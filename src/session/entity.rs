use bytes::Bytes;

use super::Session;
use crate::protocol::Route;
use crate::AppResult;

/// Capability fronting a logical client session.
///
/// A [`Session`] never owns a socket directly; it holds a weak reference to
/// whichever entity currently fronts it: an `Agent` on a frontend server or
/// an `Acceptor` on a backend server.
#[async_trait::async_trait]
pub trait NetworkEntity: Send + Sync {
    fn id(&self) -> u64;

    /// Writes raw bytes to the underlying link.
    async fn send(&self, data: Bytes) -> AppResult<()>;

    /// Pushes an unsolicited message toward the session's client.
    async fn push(&self, session: &Session, route: &str, payload: Bytes) -> AppResult<()>;

    /// Replies to the session's pending request.
    async fn response(&self, session: &Session, payload: Bytes) -> AppResult<()>;

    /// Performs a routed call on behalf of the session and awaits the result.
    async fn call(&self, session: &Session, route: Route, payload: Bytes) -> AppResult<Bytes>;

    async fn close(&self);
}
