//! Backend-side dispatch of forwarded client messages.

use std::sync::Arc;

use switchyard_protocol::{Message, MessageKind};
use tokio::sync::mpsc;

use crate::client::TransportClient;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::HandlerError;
use crate::handler::{HandlerRegistry, Route};
use crate::push::PushFanout;
use crate::remote::RemoteSession;
use crate::session::SessionHandle;

/// Runs handlers for envelopes received by a backend process and sends the
/// responses back to the originating gateway.
pub struct Dispatcher {
    transport: Arc<TransportClient>,
    handlers: Arc<HandlerRegistry>,
    fanout: Option<Arc<PushFanout>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<TransportClient>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            transport,
            handlers,
            fanout: None,
        }
    }

    /// Let handlers push to arbitrary users through `fanout`.
    pub fn with_fanout(mut self, fanout: Arc<PushFanout>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// Consume `inbound` until it ends, handling envelopes one at a time.
    pub async fn run(&self, mut inbound: mpsc::Receiver<Vec<u8>>) {
        while let Some(bytes) = inbound.recv().await {
            match Envelope::decode(&bytes) {
                Ok(envelope) => self.dispatch(envelope),
                Err(e) => tracing::warn!("dropping undecodable envelope: {e}"),
            }
        }
        tracing::debug!(identity = %self.transport.identity(), "dispatcher stopped");
    }

    /// Handle one envelope. Responses are sent to `envelope.source`.
    pub fn dispatch(&self, envelope: Envelope) {
        if envelope.kind != EnvelopeKind::Message {
            tracing::debug!(from = %envelope.source, "ignoring session sync on backend");
            return;
        }
        let Some(message) = envelope.message.clone() else {
            tracing::warn!(from = %envelope.source, "message envelope without a message");
            return;
        };
        if !matches!(message.kind, MessageKind::Request | MessageKind::Notify) {
            tracing::debug!(kind = ?message.kind, "ignoring non-request message");
            return;
        }

        let route = envelope.effective_route().unwrap_or_default().to_string();
        let mut session = RemoteSession::new(envelope, Arc::clone(&self.transport));
        if let Some(fanout) = &self.fanout {
            session = session.with_fanout(Arc::clone(fanout));
        }
        let result = self.invoke(&session, &route, &message.payload);

        if session.forwarded() {
            return;
        }
        match message.kind {
            MessageKind::Request => self.respond(&session, message.id, result),
            _ => {
                if let Err(e) = result {
                    tracing::warn!(route = %route, "notify handler failed: {e}");
                }
            }
        }
    }

    fn invoke(
        &self,
        session: &RemoteSession,
        route: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        let parsed = Route::parse(route)?;
        let handler = self.handlers.get(&parsed)?;
        handler.call(session, payload)
    }

    fn respond(&self, session: &RemoteSession, id: u64, result: Result<Vec<u8>, HandlerError>) {
        let message = match result {
            Ok(payload) => Message::response(id, payload),
            Err(e) => {
                tracing::debug!(id, connection = %session.connection_id(), "handler error: {e}");
                Message::error_response(id, e.to_body().to_bytes())
            }
        };
        let mut reply = Envelope::message(self.transport.identity(), session.gateway(), message);
        reply.connection_id = session.connection_id().to_string();
        reply.user_id = session.user_id();
        if let Err(e) = self.transport.send_envelope(&reply) {
            tracing::warn!(to = %session.gateway(), id, "failed to send response: {e}");
        }
    }
}
