//! In-band command handling.
//!
//! Direct messages, and group messages that mention the bot, are matched
//! against a small vocabulary (`stop`, `start`, `status`, `help`/`menu`).
//! Anything else is ignored without a reply.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::InboundMessage;
use crate::supervisor::{StatusSnapshot, Supervisor};
use crate::switch::SystemSwitch;

const STOP_REPLY: &str = "🛑 *SISTEM SEND WA DIHENTIKAN*\n\n\
Semua pengiriman pesan telah dihentikan.\n\
Ketik \"START\" untuk mengaktifkan kembali sistem.";

const START_REPLY: &str = "✅ *SISTEM SEND WA DIAKTIFKAN*\n\n\
Semua pengiriman pesan sudah aktif kembali.\n\
Sistem siap menerima request.";

// ============================================================================
// Parsing
// ============================================================================

/// A recognized chat command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Start,
    Status,
    Help,
}

impl Command {
    /// Exact match on already-normalized text.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "stop" => Some(Self::Stop),
            "start" => Some(Self::Start),
            "status" => Some(Self::Status),
            "help" | "menu" => Some(Self::Help),
            _ => None,
        }
    }
}

/// The normalized command text of `message`, if it is addressed to the bot.
///
/// `bot_number` is the bare number of the bound account; without it no
/// group message can qualify.
pub fn qualify(message: &InboundMessage, bot_number: Option<&str>) -> Option<String> {
    if message.from_me {
        return None;
    }
    let text = message.text.as_deref()?;

    if !message.is_group() {
        return Some(normalize(text));
    }

    let number = bot_number.filter(|n| !n.is_empty())?;
    let mentioned = message.mentioned_jids.iter().any(|jid| jid.contains(number));
    if !mentioned {
        return None;
    }
    Some(normalize(&strip_mentions(text)))
}

/// Lowercase and trim.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Remove every `@` immediately followed by one or more digits, with the digits.
fn strip_mentions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '@' && chars.peek().is_some_and(char::is_ascii_digit) {
            while chars.peek().is_some_and(char::is_ascii_digit) {
                chars.next();
            }
            continue;
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Replies
// ============================================================================

fn status_reply(status: &StatusSnapshot) -> String {
    let (system_icon, system_label) = if status.enabled {
        ("✅", "AKTIF")
    } else {
        ("🛑", "NONAKTIF")
    };
    let (link_icon, link_label) = if status.is_connected() {
        ("🟢", "Tersambung")
    } else {
        ("🔴", "Terputus")
    };
    let user = status
        .user
        .as_ref()
        .map(|u| u.id.as_str())
        .unwrap_or("Not connected");

    format!(
        "📊 *STATUS SISTEM WA GATEWAY*\n\n\
         {system_icon} Status Sistem: *{system_label}*\n\
         {link_icon} Koneksi WA: *{link_label}*\n\
         🔄 Retry Count: {}/{}\n\
         🤖 User: {user}\n\n\
         *Perintah tersedia:*\n\
         • STOP - Hentikan sistem\n\
         • START - Aktifkan sistem\n\
         • STATUS - Cek status\n\n\
         _Kirim pesan private atau mention saya di grup_",
        status.retry_count, status.max_retries,
    )
}

fn help_reply(bot_number: &str) -> String {
    format!(
        "🤖 *WA GATEWAY BOT COMMANDS*\n\n\
         *Kontrol Sistem:*\n\
         • START - Aktifkan sistem send WA\n\
         • STOP - Hentikan sistem send WA\n\
         • STATUS - Lihat status sistem\n\
         • HELP - Tampilkan menu ini\n\n\
         *Cara Penggunaan:*\n\
         1. Kirim pesan private ke bot\n\
         2. Mention/tag bot di grup dengan perintah\n\n\
         *Contoh:* @{bot_number} status\n\n\
         _Bot akan merespon sesuai perintah yang diberikan_"
    )
}

// ============================================================================
// Router
// ============================================================================

/// Interprets inbound messages and flips the system switch.
#[derive(Clone)]
pub struct CommandRouter {
    supervisor: Supervisor,
    switch: SystemSwitch,
}

impl CommandRouter {
    pub fn new(supervisor: Supervisor) -> Self {
        let switch = supervisor.switch().clone();
        Self { supervisor, switch }
    }

    /// Consume inbound messages until the supervisor goes away.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        debug!("Command router started");
        while let Some(message) = inbound.recv().await {
            self.handle(&message).await;
        }
        debug!("Command router stopped");
    }

    /// Handle one message. Returns the command acted on, if any.
    pub async fn handle(&self, message: &InboundMessage) -> Option<Command> {
        let status = self.supervisor.status();
        let bot_number = status.user.as_ref().map(|u| u.number().to_string());

        let text = qualify(message, bot_number.as_deref())?;
        debug!(from = message.sender(), "Message received");

        let command = Command::parse(&text)?;
        let sender = message.sender();
        let reply = match command {
            Command::Stop => {
                self.switch.set(false, sender);
                STOP_REPLY.to_string()
            }
            Command::Start => {
                self.switch.set(true, sender);
                START_REPLY.to_string()
            }
            Command::Status => {
                info!(from = sender, "Status requested");
                status_reply(&self.supervisor.status())
            }
            Command::Help => help_reply(bot_number.as_deref().unwrap_or_default()),
        };

        if let Err(e) = self.supervisor.send(&message.remote_jid, &reply).await {
            warn!(error = %e, to = %message.remote_jid, ?command, "Failed to send command reply");
        }
        Some(command)
    }
}
