//! Inbound loop: every channel adapter feeds one queue, processed in order.

use crate::commands::{self, CommandContext, Dispatcher};
use crate::error::{GatewayError, PolicyDenial};
use crate::guard::{GuardDecision, normalize_identity};
use crate::outbox::Conversation;
use crate::state::RelayState;
use relay_channels::InboundMessage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    state: Arc<RelayState>,
    dispatcher: Dispatcher,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
}

impl Gateway {
    pub fn new(state: Arc<RelayState>, inbound_rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&state)),
            state,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway loop stopping");
                    return;
                }
                inbound = rx.recv() => inbound,
            };
            let Some(inbound) = inbound else {
                tracing::info!("inbound queue closed; gateway loop exiting");
                return;
            };
            self.handle_inbound(inbound).await;
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %inbound.channel_id, message_id = %inbound.message_id)
    )]
    pub async fn handle_inbound(&self, inbound: InboundMessage) {
        let Some(command) = commands::parse(&inbound.content) else {
            tracing::debug!("ignoring non-command message");
            return;
        };
        let conversation = Conversation::from_inbound(&inbound);

        let decision = self
            .state
            .guard
            .evaluate(&inbound.sender_id, &inbound.content, Instant::now());
        let rejection = match decision {
            GuardDecision::Accept => None,
            GuardDecision::RejectNotOwner => Some(GatewayError::AuthDenied),
            GuardDecision::RejectPanic => {
                Some(GatewayError::PolicyDenied(PolicyDenial::PanicActive))
            }
            GuardDecision::RejectRateLimited => {
                Some(GatewayError::PolicyDenied(PolicyDenial::RateLimited))
            }
        };
        if let Some(rejection) = rejection {
            tracing::warn!(
                sender = %inbound.sender_id,
                command = %command.name,
                decision = ?decision,
                "command rejected"
            );
            self.state
                .outbox
                .reply(&conversation, &inbound.message_id, rejection.user_message())
                .await;
            return;
        }

        let ctx = CommandContext {
            identity: normalize_identity(&inbound.sender_id),
            conversation,
            message_id: inbound.message_id.clone(),
        };
        self.dispatcher.dispatch(&ctx, &command).await;
    }
}
