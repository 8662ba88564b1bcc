//! Command dispatcher.
//!
//! Routes each decoded [`Envelope`] to the handler registered for its
//! `(Section1, Section2, Section3)` path and `SendState`. Unmatched commands
//! are logged and dropped; nothing is sent back for them. A handler may
//! return a reply, which is written to the same peer.
//!
//! The dispatcher is itself a [`MessageHandler`], so it plugs directly into a
//! `Listener` or `Connection`. Sessions call it concurrently.

use async_trait::async_trait;
use dashmap::DashMap;
use fourd_types::{CommandPath, Envelope, EnvelopeError, SendState, RESULT_OK};
use fourd_wire::{HandlerError, MessageContext, MessageHandler};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a [`CommandHandler`] returns: the reply to send, if any.
pub type CommandResult = Result<Option<Envelope>, HandlerError>;

/// Application logic for one command.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle `envelope`; return the envelope to send back, if any.
    async fn handle(&self, envelope: Envelope) -> CommandResult;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommandResult> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> CommandResult {
        (self)(envelope).await
    }
}

type RouteKey = (CommandPath, SendState);

/// Routing table from command path and direction to handler.
pub struct Dispatcher {
    routes: DashMap<RouteKey, Arc<dyn CommandHandler>>,
    default_sender: String,
}

impl Dispatcher {
    /// `default_sender` replaces a blank `From` on inbound envelopes.
    pub fn new(default_sender: impl Into<String>) -> Self {
        Self {
            routes: DashMap::new(),
            default_sender: default_sender.into(),
        }
    }

    /// Register `handler`, replacing any previous one for the same route.
    pub fn register(&self, path: CommandPath, state: SendState, handler: impl CommandHandler) {
        self.register_arc(path, state, Arc::new(handler));
    }

    pub fn register_arc(&self, path: CommandPath, state: SendState, handler: Arc<dyn CommandHandler>) {
        debug!(path = %path, state = %state, "Registered command");
        if self.routes.insert((path.clone(), state), handler).is_some() {
            info!(path = %path, state = %state, "Replaced existing command handler");
        }
    }

    pub fn unregister(&self, path: &CommandPath, state: SendState) -> bool {
        self.routes.remove(&(path.clone(), state)).is_some()
    }

    pub fn contains(&self, path: &CommandPath, state: SendState) -> bool {
        self.routes.contains_key(&(path.clone(), state))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decode and validate an inbound body.
    pub fn decode(&self, body: &str) -> Result<Envelope, EnvelopeError> {
        let mut envelope = Envelope::from_json(body)?;
        if envelope.from.trim().is_empty() {
            envelope.from = self.default_sender.clone();
        }
        envelope.validate()?;
        Ok(envelope)
    }

    /// Run the matching handler. `Ok(None)` when nothing matched or the
    /// handler had no reply.
    ///
    /// A reply in the `response` state without a `ResultCode` gets
    /// [`RESULT_OK`].
    pub async fn dispatch(&self, envelope: Envelope) -> CommandResult {
        let (Some(path), Some(state)) = (envelope.path(), envelope.send_state) else {
            debug!("Envelope without route key dropped");
            return Ok(None);
        };

        let handler = self
            .routes
            .get(&(path.clone(), state))
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            warn!(path = %path, state = %state, from = %envelope.from, "Unhandled command dropped");
            return Ok(None);
        };

        debug!(path = %path, state = %state, token = %envelope.token, "Dispatching command");
        let mut reply = handler.handle(envelope).await?;
        if let Some(reply) = reply.as_mut() {
            if reply.send_state == Some(SendState::Response) && reply.result_code().is_none() {
                reply.insert("ResultCode", RESULT_OK);
            }
        }
        Ok(reply)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes.len())
            .field("default_sender", &self.default_sender)
            .finish()
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn on_message(&self, ctx: &MessageContext, body: String) -> Result<(), HandlerError> {
        let envelope = match self.decode(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %ctx.peer, error = %e, "Discarding malformed envelope");
                return Ok(());
            }
        };
        if let Some(reply) = self.dispatch(envelope).await? {
            ctx.reply(&reply.to_json()?).await?;
        }
        Ok(())
    }
}

/// `Daemon/Information/Version` handler: replies with
/// `Version: {<name>: {version, date}}`.
pub fn version_handler(
    name: impl Into<String>,
    version: impl Into<String>,
    date: impl Into<String>,
) -> impl CommandHandler {
    let name = name.into();
    let info = json!({ "version": version.into(), "date": date.into() });
    move |request: Envelope| {
        let mut reply = request.reply();
        reply.insert("Version", json!({ name.as_str(): info.clone() }));
        reply.insert("ResultCode", RESULT_OK);
        async move { CommandResult::Ok(Some(reply)) }
    }
}

/// Command path answered by [`version_handler`].
pub fn version_path() -> CommandPath {
    CommandPath::new("Daemon", "Information", "Version")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(path: CommandPath) -> Envelope {
        Envelope::request(path, "4DPD", "AId")
    }

    #[tokio::test]
    async fn test_routes_by_path_and_state() {
        let dispatcher = Dispatcher::new("4DPD");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        dispatcher.register(
            CommandPath::new("AI", "Operation", "Calibration"),
            SendState::Request,
            move |req: Envelope| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { CommandResult::Ok(Some(req.reply())) }
            },
        );

        let reply = dispatcher
            .dispatch(request(CommandPath::new("AI", "Operation", "Calibration")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.send_state, Some(SendState::Response));
        assert_eq!(reply.result_code(), Some(RESULT_OK));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Same path, other direction: unmatched.
        let notify = Envelope::notify(CommandPath::new("AI", "Operation", "Calibration"), "a", "b");
        assert!(dispatcher.dispatch(notify).await.unwrap().is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_is_dropped() {
        let dispatcher = Dispatcher::new("4DPD");
        let result = dispatcher
            .dispatch(request(CommandPath::new("No", "Such", "Command")))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_handler_result_code_kept() {
        let dispatcher = Dispatcher::new("4DPD");
        dispatcher.register(
            CommandPath::new("AI", "Process", "Multi"),
            SendState::Request,
            |req: Envelope| async move {
                let mut reply = req.reply();
                reply.set_result(2100, "busy");
                CommandResult::Ok(Some(reply))
            },
        );
        let reply = dispatcher
            .dispatch(request(CommandPath::new("AI", "Process", "Multi")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.result_code(), Some(2100));
    }

    #[test]
    fn test_decode_fills_blank_sender() {
        let dispatcher = Dispatcher::new("4DPD");
        let body = r#"{"Section1":"Daemon","Section2":"Process","Section3":"Stop","From":" ","To":"AId","SendState":"request","Token":"t1"}"#;
        let envelope = dispatcher.decode(body).unwrap();
        assert_eq!(envelope.from, "4DPD");

        let missing_to = r#"{"Section1":"a","Section2":"b","Section3":"c","From":"x","SendState":"request","Token":"t1"}"#;
        assert!(dispatcher.decode(missing_to).is_err());
    }

    #[tokio::test]
    async fn test_version_handler() {
        let dispatcher = Dispatcher::new("4DPD");
        dispatcher.register(
            version_path(),
            SendState::Request,
            version_handler("AId", "1.4.2", "2025-06-01"),
        );
        let req = request(version_path());
        let reply = dispatcher.dispatch(req.clone()).await.unwrap().unwrap();
        assert_eq!(reply.token, req.token);
        assert_eq!(reply.from, "AId");
        assert_eq!(reply.to, "4DPD");
        assert_eq!(reply.result_code(), Some(RESULT_OK));
        assert_eq!(reply.get("Version").unwrap()["AId"]["version"], "1.4.2");
    }

    #[test]
    fn test_register_replaces() {
        let dispatcher = Dispatcher::new("4DPD");
        let path = CommandPath::new("a", "b", "c");
        dispatcher.register(path.clone(), SendState::Notify, |_: Envelope| async { CommandResult::Ok(None) });
        dispatcher.register(path.clone(), SendState::Notify, |_: Envelope| async { CommandResult::Ok(None) });
        assert_eq!(dispatcher.len(), 1);
        assert!(dispatcher.contains(&path, SendState::Notify));
        assert!(dispatcher.unregister(&path, SendState::Notify));
        assert!(dispatcher.is_empty());
    }
}
