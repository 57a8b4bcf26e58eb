//! Chat command parser and dispatcher.
//!
//! A command is any message whose first non-blank character is `.`. The name
//! is case-insensitive and resolved through a small alias table. Handlers
//! return a closed [`GatewayError`]; panics inside a handler are caught and
//! reported as a generic failure so the dispatch loop keeps running.

use crate::confirmation::{ConfirmationOutcome, ConfirmationState, PendingConnection};
use crate::error::GatewayError;
use crate::outbox::Conversation;
use crate::provisioning::{self, FirewallProfile, InstallMode};
use crate::redact::redact;
use crate::remote_session::{CloseReason, RemoteSession, SessionTarget};
use crate::state::RelayState;
use crate::streaming::{self, chunk_output, fence};
use futures_util::FutureExt;
use relay_channels::MessageId;
use relay_remote::HostKeyCheck;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

const COMMAND_PREFIX: char = '.';
const ALIASES: &[(&str, &str)] = &[("menu", "help"), ("ya", "confirm")];

const CTRL_C: &[u8] = &[0x03];
const PREVIEW_WAIT: Duration = Duration::from_millis(1_500);
const CHECKSUM_WAIT: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Lowercased, alias-resolved name.
    pub name: String,
    /// Lowercased name as typed.
    pub invoked_as: String,
    pub args: Vec<String>,
    /// Text after the name with its inner spacing intact.
    pub rest: String,
}

impl ParsedCommand {
    fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Returns `None` for anything that is not a command.
///
/// Blanks after the marker are skipped, so `. help` is `.help`. A bare `.`
/// parses with an empty name and falls through to the unknown-command reply.
pub fn parse(text: &str) -> Option<ParsedCommand> {
    let body = text.trim().strip_prefix(COMMAND_PREFIX)?.trim_start();
    let (head, rest) = body
        .split_once(char::is_whitespace)
        .unwrap_or((body, ""));
    let invoked_as = head.to_lowercase();
    let name = ALIASES
        .iter()
        .find(|(alias, _)| *alias == invoked_as)
        .map_or_else(|| invoked_as.clone(), |(_, target)| (*target).to_string());
    Some(ParsedCommand {
        name,
        invoked_as,
        args: rest.split_whitespace().map(str::to_string).collect(),
        rest: rest.trim().to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    Connect,
    Confirm,
    Install,
    SafeInstall,
    DryRun,
    Ufw,
    Send,
    Enter,
    CtrlC,
    Status,
    Switch,
    Close,
    Panic,
    Unpanic,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "help" => Self::Help,
            "connect" => Self::Connect,
            "confirm" => Self::Confirm,
            "install" => Self::Install,
            "safeinstall" => Self::SafeInstall,
            "dryrun" => Self::DryRun,
            "ufw" => Self::Ufw,
            "send" => Self::Send,
            "enter" => Self::Enter,
            "ctrlc" => Self::CtrlC,
            "status" => Self::Status,
            "switch" => Self::Switch,
            "close" => Self::Close,
            "panic" => Self::Panic,
            "unpanic" => Self::Unpanic,
            _ => return None,
        })
    }
}

/// Who sent a command and where replies go.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Normalized sender identity.
    pub identity: String,
    pub conversation: Conversation,
    pub message_id: MessageId,
}

/// `Ok(Some(text))` is sent as the reply; `Ok(None)` means the handler
/// already replied.
pub type HandlerResult = Result<Option<String>, GatewayError>;

pub struct Dispatcher {
    state: Arc<RelayState>,
}

impl Dispatcher {
    pub fn new(state: Arc<RelayState>) -> Self {
        Self { state }
    }

    /// Runs one command and delivers its reply. Never fails.
    #[tracing::instrument(level = "info", skip_all, fields(command = %command.name))]
    pub async fn dispatch(&self, ctx: &CommandContext, command: &ParsedCommand) {
        match catch_handler_panic(self.execute(ctx, command)).await {
            Ok(Some(reply)) => self.state.outbox.send_text(&ctx.conversation, reply).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "command failed");
                self.state
                    .outbox
                    .reply(&ctx.conversation, &ctx.message_id, e.user_message())
                    .await;
            }
        }
    }

    async fn execute(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        let Some(kind) = CommandKind::from_name(&command.name) else {
            return Err(GatewayError::usage(format!(
                "Unknown command: .{}\n\nUse .help to see the command list.",
                command.invoked_as
            )));
        };
        match kind {
            CommandKind::Help => Ok(Some(provisioning::HELP_TEXT.to_string())),
            CommandKind::Connect => self.connect(ctx, command),
            CommandKind::Confirm => self.confirm(ctx, command).await,
            CommandKind::Install => self.install(ctx, command).await,
            CommandKind::SafeInstall => self.safe_install(ctx, command).await,
            CommandKind::DryRun => dry_run(command),
            CommandKind::Ufw => self.ufw(ctx, command).await,
            CommandKind::Send => self.send(ctx, command),
            CommandKind::Enter => self.raw_input(ctx, b"\n", "ENTER", "✅ ENTER sent"),
            CommandKind::CtrlC => self.raw_input(ctx, CTRL_C, "CTRL+C", "✅ Ctrl+C sent"),
            CommandKind::Status => self.status(ctx),
            CommandKind::Switch => self.switch(ctx, command),
            CommandKind::Close => self.close(ctx),
            CommandKind::Panic => Ok(Some(self.panic())),
            CommandKind::Unpanic => Ok(Some(self.unpanic())),
        }
    }

    /// The sender's current session, which must still be connected.
    fn connected_session(&self, ctx: &CommandContext) -> Result<Arc<RemoteSession>, GatewayError> {
        let session = self.state.registry.current_session(&ctx.identity)?;
        if !session.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        Ok(session)
    }

    fn touch(&self, session: &Arc<RemoteSession>, ctx: &CommandContext) {
        self.state.arm_idle_timer(session, &ctx.conversation);
    }

    async fn say(&self, ctx: &CommandContext, text: impl Into<String>) {
        self.state.outbox.send_text(&ctx.conversation, text).await;
    }

    fn connect(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let pending = self
            .state
            .confirmations
            .request(&ctx.identity, &args, &ctx.conversation)?;
        tracing::info!(host = %pending.host, user = %pending.user, port = pending.port, "connection awaiting confirmation");
        Ok(Some(format!(
            "⚠️ *CONFIRM CONNECTION*\n\nHost: {}\nUser: {}\nPort: {}\n\nReply .confirm {} to continue.",
            redact(&pending.host),
            pending.user,
            pending.port,
            self.state.confirmations.affirmative_token()
        )))
    }

    async fn confirm(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        // `.ya` on its own is its own answer.
        let token = match command.arg(0) {
            Some(token) => token,
            None if command.invoked_as != command.name => command.invoked_as.as_str(),
            None => "",
        };
        match self.state.confirmations.confirm(&ctx.identity, token)? {
            ConfirmationOutcome::Cancelled(pending) => {
                tracing::info!(host = %pending.host, "pending connection cancelled");
                Ok(Some(format!(
                    "❌ Connection to {} cancelled.",
                    redact(&pending.host)
                )))
            }
            ConfirmationOutcome::Confirmed(pending) => self.open_session(ctx, pending).await,
        }
    }

    async fn open_session(&self, ctx: &CommandContext, pending: PendingConnection) -> HandlerResult {
        self.say(ctx, format!("🔄 Connecting to {}...", redact(&pending.host)))
            .await;

        let session = RemoteSession::open(
            SessionTarget {
                host: pending.host.clone(),
                user: pending.user.clone(),
                port: pending.port,
            },
            self.state.connector.as_ref(),
            Arc::clone(&self.state.verifier),
            &self.state.settings.session,
        )
        .await?;

        if let Some(previous) = self.state.registry.put(Arc::clone(&session)) {
            previous.close(CloseReason::Replaced, None);
        }
        self.state.registry.set_current(&ctx.identity, session.host());
        self.state.arm_idle_timer(&session, &pending.conversation);

        let mut reply = format!(
            "✅ *Connected*\n\nHost: {}\nUser: {}\nPort: {}\nStatus: connected",
            redact(&pending.host),
            pending.user,
            pending.port
        );
        if let HostKeyCheck::AcceptedUnverified { .. } = session.host_key() {
            reply.push_str("\n⚠️ Host fingerprint is not pinned; accepted without verification.");
        }
        reply.push_str("\n\nUse .install <panel|wings|both> to start the installation.");
        Ok(Some(reply))
    }

    async fn install(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        let session = self.connected_session(ctx)?;
        let Some(mode) = command.arg(0).and_then(InstallMode::parse) else {
            return Err(GatewayError::usage(
                "Invalid mode. Use: panel, wings, both or uninstall",
            ));
        };

        self.say(
            ctx,
            format!("🚀 Starting installation: *{}*\n\nPlease wait...", mode.as_str()),
        )
        .await;
        session.send_input(&provisioning::bootstrap_command())?;
        tokio::time::sleep(self.state.settings.installer_load_delay).await;
        session.send_input(mode.menu_option())?;

        streaming::spawn_stream_loop(
            Arc::clone(&session),
            self.state.outbox.clone(),
            ctx.conversation.clone(),
            self.state.settings.streaming,
        );
        self.touch(&session, ctx);
        Ok(Some(
            "✅ Installer started. Output will be sent periodically.\n\nUse .send to answer the installer prompts."
                .to_string(),
        ))
    }

    async fn safe_install(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        let session = self.connected_session(ctx)?;
        let Some(mode) = command.arg(0).and_then(InstallMode::parse_verified) else {
            return Err(GatewayError::usage("Mode: panel, wings or both"));
        };
        let settings = &self.state.settings;

        self.say(ctx, "🔍 Downloading and verifying the installer script...")
            .await;
        session.send_input(&provisioning::download_command())?;
        tokio::time::sleep(settings.streaming.settle_delay).await;
        // Download noise is not part of the preview.
        session.drain_output();

        session.send_input(&provisioning::preview_command())?;
        tokio::time::sleep(PREVIEW_WAIT).await;
        let preview = redact(&session.drain_output());
        if let Some(head) = chunk_output(&preview, settings.streaming.chunk_max_chars)
            .first()
            .filter(|head| !head.trim().is_empty())
        {
            self.say(
                ctx,
                format!("📄 *Script preview (first 50 lines):*\n{}", fence(head)),
            )
            .await;
        }

        session.send_input(&provisioning::checksum_command())?;
        tokio::time::sleep(CHECKSUM_WAIT).await;
        let checksum = redact(&session.drain_output());
        if !checksum.trim().is_empty() {
            self.say(ctx, format!("🔐 *SHA256:*\n{}", fence(checksum.trim())))
                .await;
        }

        self.say(ctx, "✅ Verification finished. Continuing with the installation...")
            .await;
        session.send_input(&provisioning::run_downloaded_command())?;
        tokio::time::sleep(settings.installer_load_delay).await;
        session.send_input(mode.menu_option())?;

        streaming::spawn_stream_loop(
            Arc::clone(&session),
            self.state.outbox.clone(),
            ctx.conversation.clone(),
            settings.streaming,
        );
        self.touch(&session, ctx);
        Ok(Some(
            "🚀 Installation started. Use .send to interact.".to_string(),
        ))
    }

    async fn ufw(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        let session = self.connected_session(ctx)?;
        let profile = match (command.arg(0), command.arg(1)) {
            (Some(verb), Some(profile)) if verb.eq_ignore_ascii_case("open") => {
                FirewallProfile::parse(profile)
            }
            _ => None,
        };
        let Some(profile) = profile else {
            return Err(GatewayError::usage("Usage: .ufw open <panel|wings>"));
        };

        self.say(
            ctx,
            format!("🔥 Opening firewall ports for {}...", profile.as_str()),
        )
        .await;
        session.send_input(&profile.ufw_command())?;
        tokio::time::sleep(self.state.settings.streaming.settle_delay).await;
        let _emitting = session.lock_output().await;
        let output = session.drain_output();
        self.touch(&session, ctx);

        if output.trim().is_empty() {
            return Ok(Some("✅ UFW command sent.".to_string()));
        }
        self.say(ctx, "✅ *Firewall updated:*").await;
        streaming::emit_chunks(
            &self.state.outbox,
            &ctx.conversation,
            &output,
            &self.state.settings.streaming,
        )
        .await;
        Ok(None)
    }

    fn send(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        let session = self.connected_session(ctx)?;
        if command.rest.is_empty() {
            return Err(GatewayError::usage("Usage: .send <text>"));
        }
        session.send_input(&command.rest)?;
        self.touch(&session, ctx);
        streaming::spawn_one_shot_drain(
            Arc::clone(&session),
            self.state.outbox.clone(),
            ctx.conversation.clone(),
            self.state.settings.streaming,
        );
        Ok(Some(format!("✅ Sent: `{}`", redact(&command.rest))))
    }

    fn raw_input(
        &self,
        ctx: &CommandContext,
        bytes: &[u8],
        label: &str,
        reply: &str,
    ) -> HandlerResult {
        let session = self.connected_session(ctx)?;
        session.send_raw(bytes, label)?;
        self.touch(&session, ctx);
        Ok(Some(reply.to_string()))
    }

    fn status(&self, ctx: &CommandContext) -> HandlerResult {
        let session = match self.state.registry.current_session(&ctx.identity) {
            Ok(session) => session,
            Err(GatewayError::NoActiveSession) => {
                let reply = match self.state.confirmations.state(&ctx.identity) {
                    ConfirmationState::NoPending => "📊 *Status:* no active session".to_string(),
                    ConfirmationState::Pending(pending) => format!(
                        "📊 *Status:* no active session\n⏳ Awaiting confirmation for {}@{}:{}",
                        pending.user,
                        redact(&pending.host),
                        pending.port
                    ),
                };
                return Ok(Some(reply));
            }
            Err(e) => return Err(e),
        };
        self.touch(&session, ctx);

        let target = session.target();
        let mut open_hosts: Vec<String> = self
            .state
            .registry
            .all()
            .iter()
            .map(|open| redact(open.host()))
            .collect();
        open_hosts.sort();
        let (marker, connection) = if session.is_connected() {
            ("✅", "active")
        } else {
            ("❌", "disconnected")
        };
        let verification = match session.host_key() {
            HostKeyCheck::Pinned => "pinned",
            _ => "not verified",
        };
        Ok(Some(format!(
            "📊 *SESSION STATUS*\n\n\
             {marker} Connection: {connection}\n\
             🖥️ Host: {}\n\
             👤 User: {}\n\
             🔌 Port: {}\n\
             🔏 Fingerprint: {verification}\n\
             🕒 Started: {} UTC\n\
             ⏱️ Uptime: {}s\n\
             📂 Open sessions: {}\n\n\
             Use .close to end the session.",
            redact(&target.host),
            target.user,
            target.port,
            session.created_at().format("%Y-%m-%d %H:%M:%S"),
            session.uptime().as_secs(),
            open_hosts.join(", "),
        )))
    }

    fn switch(&self, ctx: &CommandContext, command: &ParsedCommand) -> HandlerResult {
        let Some(host) = command.arg(0) else {
            return Err(GatewayError::usage("Usage: .switch <host>"));
        };
        self.state.registry.switch(&ctx.identity, host)?;
        Ok(Some(format!("✅ Switched to session: {}", redact(host))))
    }

    fn close(&self, ctx: &CommandContext) -> HandlerResult {
        let session = self.state.registry.current_session(&ctx.identity)?;
        self.state.registry.remove(session.host());
        session.close(
            CloseReason::Operator,
            Some(self.state.log_delivery(&ctx.conversation)),
        );
        Ok(Some(
            "✅ Session closed.\n\nThe audit log will follow shortly.".to_string(),
        ))
    }

    fn panic(&self) -> String {
        self.state.guard.set_panic(true);
        let closed = self.state.close_all(CloseReason::Panic);
        tracing::warn!(sessions = closed, "panic mode engaged");
        format!(
            "🚨 *PANIC MODE ACTIVE*\n\n{closed} session(s) closed.\nAll commands are blocked.\n\nUse .unpanic to resume."
        )
    }

    fn unpanic(&self) -> String {
        if self.state.guard.set_panic(false) {
            tracing::warn!("panic mode cleared");
        }
        "✅ Panic mode disabled. Commands are accepted again.".to_string()
    }
}

fn dry_run(command: &ParsedCommand) -> HandlerResult {
    let Some(host) = command.arg(0) else {
        return Err(GatewayError::usage("Usage: .dryrun <host>"));
    };
    Ok(Some(provisioning::dry_run_plan(&redact(host))))
}

async fn catch_handler_panic<F>(handler: F) -> HandlerResult
where
    F: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            tracing::error!(panic = %detail, "command handler panicked");
            Err(GatewayError::HandlerFault(detail))
        }
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
