//! `fourd serve`.

use super::{fail, runtime};
use fourd_kernel::{config::load_config, version_handler, version_path, Dispatcher};
use fourd_types::{Envelope, SendState};
use fourd_wire::{Listener, MessageContext, MessageHandler, PortRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Reported by the Version command; set at build time.
const BUILD_DATE: &str = match option_env!("FOURD_BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

pub fn cmd_serve(config: Option<PathBuf>, port: Option<u16>, name: Option<String>) {
    let mut cfg = load_config(config.as_deref());
    if let Some(port) = port {
        cfg.listener.port = port;
    }
    if let Some(name) = name {
        cfg.name = name;
    }

    let dispatcher = Arc::new(Dispatcher::new(cfg.default_sender.clone()));
    dispatcher.register(
        version_path(),
        SendState::Request,
        version_handler(cfg.name.clone(), env!("CARGO_PKG_VERSION"), BUILD_DATE),
    );

    // Notifications are logged before routing so unregistered ones still show up.
    let handler = move |ctx: MessageContext, body: String| {
        let dispatcher = dispatcher.clone();
        async move {
            if let Ok(envelope) = Envelope::from_json(&body) {
                if envelope.send_state == Some(SendState::Notify) {
                    info!(
                        peer = %ctx.peer,
                        path = %envelope.path().map(|p| p.to_string()).unwrap_or_default(),
                        from = %envelope.from,
                        payload = %serde_json::Value::Object(envelope.payload.clone()),
                        "Notify received"
                    );
                }
            }
            dispatcher.on_message(&ctx, body).await
        }
    };

    let rt = runtime();
    rt.block_on(async {
        let listener = Listener::new(cfg.listener.clone(), Arc::new(handler), &PortRegistry::new());
        if let Err(e) = listener.open().await {
            fail(&format!("Could not open listener: {e}"));
        }
        match listener.local_addr() {
            Some(addr) => println!("{} listening on {addr}", cfg.name),
            None => eprintln!(
                "Port {} is in use; waiting (Ctrl-C to stop)",
                cfg.listener.port
            ),
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to wait for Ctrl-C");
        }
        info!("Shutting down");
        listener.close().await;
    });
}
