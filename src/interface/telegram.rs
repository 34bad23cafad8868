use crate::{
    bus::{EndReason, Event, EventBus, NotificationLevel},
    chat::QueueView,
    error::PlayerError,
    player::Player,
    track::{ChatId, LoopMode, TrackRequest},
};
use std::sync::Arc;
use std::time::Duration;
use teloxide::{
    prelude::*,
    types::{Chat, ChatId as TgChatId, InlineKeyboardButton, InlineKeyboardMarkup, User},
    utils::command::BotCommands,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct TelegramInterface {
    bus: Arc<EventBus>,
    player: Arc<Player>,
    token: String,
    admin_only: bool,
}

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(
    rename_rule = "lowercase",
    description = "These commands are supported:"
)]
enum Command {
    #[command(description = "Display this text.")]
    Help,
    #[command(description = "Play or queue a track: /play [@source] <query or link>")]
    Play(String),
    #[command(description = "Skip the current track.")]
    Skip,
    #[command(description = "Pause playback.")]
    Pause,
    #[command(description = "Resume playback.")]
    Resume,
    #[command(description = "Stop playback and clear the queue.")]
    Stop,
    #[command(description = "Set the volume: /volume <level>")]
    Volume(String),
    #[command(description = "Set the loop mode: /loop <off|single|all>")]
    Loop(String),
    #[command(description = "Show the queue.")]
    Queue,
    #[command(description = "Remove a queued track: /remove <position>")]
    Remove(String),
    #[command(description = "Clear upcoming tracks.")]
    Clear,
    #[command(description = "Keep the bot in this chat: /keepalive <on|off>")]
    Keepalive(String),
    #[command(description = "Mute the bot in the voice chat.")]
    Mute,
    #[command(description = "Unmute the bot.")]
    Unmute,
    #[command(description = "Jump forward in the current track: /seek <seconds>")]
    Seek(String),
    #[command(description = "Set the playback speed: /speed <0.5 to 4.0>")]
    Speed(String),
}

/// Commands that change playback for everyone in the chat.
fn requires_admin(cmd: &Command) -> bool {
    !matches!(cmd, Command::Help | Command::Play(_) | Command::Queue)
}

const ADMIN_REQUIRED: &str = "Only chat administrators can do that.";

impl TelegramInterface {
    pub fn new(bus: Arc<EventBus>, player: Arc<Player>, token: String) -> Self {
        Self {
            bus,
            player,
            token,
            admin_only: true,
        }
    }

    pub fn with_admin_only(mut self, admin_only: bool) -> Self {
        self.admin_only = admin_only;
        self
    }

    /// Admin lookups only happen in groups; a failed lookup denies.
    async fn may_control(&self, bot: &Bot, chat: &Chat, user: Option<&User>, cmd: &Command) -> bool {
        if !self.admin_only || !requires_admin(cmd) || chat.is_private() {
            return true;
        }
        let Some(user) = user else {
            return false;
        };
        match bot.get_chat_member(chat.id, user.id).await {
            Ok(member) => member.kind.is_privileged(),
            Err(e) => {
                warn!(chat_id = chat.id.0, user_id = user.id.0, error = %e, "Admin check failed");
                false
            }
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(130))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        let bot = Bot::with_client(self.token.clone(), client);
        let interface = self.clone();

        info!("Starting Telegram bot...");

        // Player events are relayed to the chats they concern.
        tokio::spawn(relay_events(bot.clone(), self.bus.subscribe()));

        let handler = Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(answer_command),
            )
            .branch(dptree::entry().endpoint(answer_message));

        let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

        Dispatcher::builder(
            bot,
            dptree::entry().branch(handler).branch(callback_handler),
        )
        .dependencies(dptree::deps![interface])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

        Ok(())
    }
}

async fn answer_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    interface: TelegramInterface,
) -> ResponseResult<()> {
    let chat = ChatId(msg.chat.id.0);
    interface.player.tracker().record_activity(chat);

    let requester = msg
        .from()
        .map(|user| user.username.clone().unwrap_or_else(|| user.first_name.clone()));
    if !interface.may_control(&bot, &msg.chat, msg.from(), &cmd).await {
        bot.send_message(msg.chat.id, ADMIN_REQUIRED).await?;
        return Ok(());
    }

    let with_controls = matches!(cmd, Command::Play(_) | Command::Queue);
    let reply = execute(&interface.player, chat, cmd, requester).await;

    let request = bot.send_message(msg.chat.id, reply);
    if with_controls {
        request.reply_markup(controls()).await?;
    } else {
        request.await?;
    }
    Ok(())
}

/// Any message counts as activity, commands or not.
async fn answer_message(msg: Message, interface: TelegramInterface) -> ResponseResult<()> {
    interface
        .player
        .tracker()
        .record_activity(ChatId(msg.chat.id.0));
    Ok(())
}

async fn handle_callback_query(
    bot: Bot,
    q: CallbackQuery,
    interface: TelegramInterface,
) -> ResponseResult<()> {
    let Some(tg_chat) = q.message.as_ref().map(|m| m.chat.clone()) else {
        bot.answer_callback_query(&q.id)
            .text("Error: Could not determine chat")
            .await?;
        return Ok(());
    };
    let chat_id = tg_chat.id;
    let chat = ChatId(chat_id.0);
    interface.player.tracker().record_activity(chat);

    let command = match q.data.as_deref().and_then(|d| d.strip_prefix("ctl:")) {
        Some("skip") => Command::Skip,
        Some("pause") => Command::Pause,
        Some("resume") => Command::Resume,
        Some("stop") => Command::Stop,
        Some("queue") => Command::Queue,
        _ => {
            bot.answer_callback_query(&q.id).text("Unknown action").await?;
            return Ok(());
        }
    };

    if !interface.may_control(&bot, &tg_chat, Some(&q.from), &command).await {
        bot.answer_callback_query(&q.id).text(ADMIN_REQUIRED).await?;
        return Ok(());
    }

    let requester = q.from.username.clone();
    if command == Command::Queue {
        let reply = execute(&interface.player, chat, command, requester).await;
        bot.answer_callback_query(&q.id).await?;
        bot.send_message(chat_id, reply).reply_markup(controls()).await?;
    } else {
        let reply = execute(&interface.player, chat, command, requester).await;
        bot.answer_callback_query(&q.id).text(reply).await?;
    }
    Ok(())
}

/// Run a command against the player and produce the reply text.
async fn execute(player: &Player, chat: ChatId, cmd: Command, requester: Option<String>) -> String {
    let result = match cmd {
        Command::Help => Ok(Command::descriptions().to_string()),
        Command::Play(text) => match TrackRequest::parse(&text) {
            None => Ok("Usage: /play [@source] <query or link>".to_string()),
            Some(mut request) => {
                request.requested_by = requester;
                player.enqueue(chat, request).await.map(|outcome| {
                    if outcome.started {
                        format!("Added {}. Starting playback.", outcome.track)
                    } else {
                        format!("Queued at position {}: {}", outcome.position, outcome.track)
                    }
                })
            }
        },
        Command::Skip => player.skip(chat).await.map(|next| match next {
            Some(_) => "Skipped.".to_string(),
            None => "Skipped. The queue is empty.".to_string(),
        }),
        Command::Pause => player.pause(chat).await.map(|_| "Paused.".to_string()),
        Command::Resume => player.resume(chat).await.map(|_| "Resumed.".to_string()),
        Command::Stop => player
            .stop(chat)
            .await
            .map(|_| "Stopped and cleared the queue.".to_string()),
        Command::Volume(arg) => match arg.trim().parse::<i64>() {
            Ok(level) => player
                .set_volume(chat, level)
                .await
                .map(|applied| format!("Volume set to {}.", applied)),
            Err(_) => Ok("Usage: /volume <level>".to_string()),
        },
        Command::Loop(arg) => match arg.parse::<LoopMode>() {
            Ok(mode) => player
                .set_loop(chat, mode)
                .await
                .map(|_| format!("Loop mode: {}.", mode)),
            Err(_) => Ok("Usage: /loop <off|single|all>".to_string()),
        },
        Command::Queue => player.queue_list(chat).map(|view| format_queue(&view)),
        Command::Remove(arg) => match arg.trim().parse::<usize>() {
            Ok(position) => player
                .remove(chat, position)
                .await
                .map(|track| format!("Removed {}.", track)),
            Err(_) => Ok("Usage: /remove <position>".to_string()),
        },
        Command::Clear => player
            .clear_queue(chat)
            .await
            .map(|n| format!("Cleared {} queued tracks.", n)),
        Command::Keepalive(arg) => match arg.trim().to_ascii_lowercase().as_str() {
            "on" => player
                .set_keep_alive(chat, true)
                .await
                .map(|_| "Keep-alive enabled. I will stay in this chat.".to_string()),
            "off" => player
                .set_keep_alive(chat, false)
                .await
                .map(|_| "Keep-alive disabled.".to_string()),
            _ => Ok("Usage: /keepalive <on|off>".to_string()),
        },
        Command::Mute => player.mute(chat).await.map(|changed| {
            if changed { "Muted." } else { "Already muted." }.to_string()
        }),
        Command::Unmute => player.unmute(chat).await.map(|changed| {
            if changed { "Unmuted." } else { "Not muted." }.to_string()
        }),
        Command::Seek(arg) => match arg.trim().parse::<u64>() {
            Ok(secs) => player
                .seek(chat, Duration::from_secs(secs))
                .await
                .map(|outcome| format!("Jumped to {} of {}.", mm_ss(outcome.position), mm_ss(outcome.length))),
            Err(_) => Ok("Usage: /seek <seconds>".to_string()),
        },
        Command::Speed(arg) => match arg.trim().trim_end_matches('x').parse::<f64>() {
            Ok(speed) => player
                .set_speed(chat, speed)
                .await
                .map(|applied| format!("Playback speed set to {}x.", applied)),
            Err(_) => Ok("Usage: /speed <0.5 to 4.0>".to_string()),
        },
    };

    result.unwrap_or_else(|e| describe_error(&e))
}

fn describe_error(e: &PlayerError) -> String {
    match e {
        PlayerError::NoSession(_) => "Nothing is playing in this chat.".to_string(),
        PlayerError::InvalidState(e) => format!("Can't do that right now: {}.", e),
        PlayerError::Resolution(e) => format!("Could not find that track: {}", e),
        PlayerError::Transport(e) => format!("Could not join the voice chat: {}", e),
        PlayerError::Cancelled(_) => "Playback was stopped before the track was ready.".to_string(),
        PlayerError::InvalidPosition { .. } => format!("{}.", e),
        PlayerError::Unplayable(title) => format!("Could not play {}: the stream is unavailable.", title),
        PlayerError::NothingPlaying(_) => "No track is playing right now.".to_string(),
        PlayerError::UnknownDuration => "This track has no known length, so it can't be seeked.".to_string(),
        PlayerError::SeekTooShort { .. } | PlayerError::SeekPastEnd { .. } | PlayerError::SpeedOutOfRange(_) => {
            format!("{}.", e)
        }
    }
}

fn mm_ss(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn format_queue(view: &QueueView) -> String {
    let mut out = String::new();
    match &view.now_playing {
        Some(track) => out.push_str(&format!("▶ {} ({})\n", track, view.status)),
        None => out.push_str("Nothing playing.\n"),
    }

    if view.upcoming.is_empty() {
        out.push_str("Queue is empty.\n");
    } else {
        for (i, track) in view.upcoming.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, track));
        }
    }

    out.push_str(&format!("\nVolume {} · loop {}", view.volume, view.loop_mode));
    if view.muted {
        out.push_str(" · muted");
    }
    if view.keep_alive {
        out.push_str(" · keep-alive");
    }
    out
}

fn controls() -> InlineKeyboardMarkup {
    let button = |label: &str, action: &str| InlineKeyboardButton::callback(label, format!("ctl:{}", action));
    InlineKeyboardMarkup::new(vec![
        vec![button("⏸", "pause"), button("▶", "resume"), button("⏭", "skip"), button("⏹", "stop")],
        vec![button("Queue", "queue")],
    ])
}

/// Text for an event, and whether it should carry playback controls.
fn render_event(event: &Event) -> Option<(ChatId, String, bool)> {
    match event {
        Event::Notification { chat, level, message } => {
            let text = match level {
                NotificationLevel::Info => message.clone(),
                NotificationLevel::Warning => format!("⚠️ {}", message),
                NotificationLevel::Error => format!("❌ {}", message),
            };
            Some((*chat, text, false))
        }
        Event::TrackStarted { chat, track } => {
            let mut text = format!("Now playing: {}", track);
            if let Some(user) = &track.requested_by {
                text.push_str(&format!("\nRequested by {}", user));
            }
            Some((*chat, text, true))
        }
        Event::SessionEnded { chat, reason } => match reason {
            EndReason::Stopped => None,
            EndReason::Evicted => Some((
                *chat,
                "Leaving this chat after a long time without activity. Add me back any time.".to_string(),
                false,
            )),
            EndReason::Unattended => Some((
                *chat,
                "Nobody is listening, so I stopped playback.".to_string(),
                false,
            )),
        },
    }
}

async fn relay_events(bot: Bot, mut rx: broadcast::Receiver<Event>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event relay lagged behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some((chat, text, with_controls)) = render_event(&event) else {
            continue;
        };
        let request = bot.send_message(TgChatId(chat.0), text);
        let sent = if with_controls {
            request.reply_markup(controls()).await
        } else {
            request.await
        };
        if let Err(e) = sent {
            error!(chat_id = %chat, error = %e, "Failed to relay event to Telegram");
        }
    }
}
