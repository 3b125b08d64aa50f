//! Telegram transport using teloxide long polling.
//!
//! Messages from one chat reach the handler one at a time, so the cheap
//! `accept` step runs inline to keep their order; the pipeline work for each
//! message is spawned so the dispatcher stays responsive.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use teloxide::dispatching::{Dispatcher, UpdateFilterExt};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, LinkPreviewOptions, Message, Update};

use crate::assistant::configuration::Configuration;
use crate::assistant::controller::{ChatSink, ConversationController};
use crate::assistant::error::ChatError;
use crate::assistant::state::UserId;
use crate::assistant::utils::split_message;
use crate::{build_controller, SWEEP_INTERVAL};

/// Telegram's limit for a single message.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

const TEXT_ONLY: &str = "I can only read text messages. Please type your question.";

/// Sessions belong to the sender; replies go to the chat they last wrote from.
pub struct TelegramSink {
    bot: Bot,
    chats: DashMap<UserId, ChatId>,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            chats: DashMap::new(),
        }
    }

    pub fn route(&self, user: &UserId, chat: ChatId) {
        self.chats.insert(user.clone(), chat);
    }

    fn chat_for(&self, user: &UserId) -> Result<ChatId, ChatError> {
        match self.chats.get(user) {
            Some(chat) => Ok(*chat),
            // In a private chat the chat id equals the user id.
            None => chat_id(user),
        }
    }
}

fn no_link_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}

/// The sender's id, or the chat's when the update has no sender (channel posts).
fn sender_of(msg: &Message) -> UserId {
    match msg.from.as_ref() {
        Some(user) => UserId(user.id.0.to_string()),
        None => UserId::from(msg.chat.id.0),
    }
}

fn chat_id(user: &UserId) -> Result<ChatId, ChatError> {
    user.0
        .parse::<i64>()
        .map(ChatId)
        .map_err(|_| ChatError::InvalidChat(user.0.clone()))
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send_text(&self, user: &UserId, text: &str) -> Result<(), ChatError> {
        let chat = self.chat_for(user)?;
        for chunk in split_message(text, MAX_MESSAGE_LENGTH) {
            if chunk.trim().is_empty() {
                continue;
            }
            self.bot
                .send_message(chat, chunk)
                .link_preview_options(no_link_preview())
                .await
                .map_err(|e| ChatError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn send_typing(&self, user: &UserId) -> Result<(), ChatError> {
        self.bot
            .send_chat_action(self.chat_for(user)?, ChatAction::Typing)
            .await
            .map_err(|e| ChatError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

async fn on_message(
    bot: Bot,
    msg: Message,
    controller: Arc<ConversationController>,
    sink: Arc<TelegramSink>,
) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        bot.send_message(msg.chat.id, TEXT_ONLY).await?;
        return Ok(());
    };
    let user = sender_of(&msg);
    sink.route(&user, msg.chat.id);

    match controller.accept(user.clone(), text).await {
        Ok(pending) => {
            let controller = controller.clone();
            tokio::spawn(async move { controller.drive(pending).await });
        }
        Err(e) => {
            tracing::error!(%user, error = %e, "could not load session");
            bot.send_message(msg.chat.id, "Sorry, something went wrong on my side. Please try again.")
                .await?;
        }
    }
    Ok(())
}

/// Starts the bot and serves updates until Ctrl-C.
pub async fn run_telegram(config: Configuration) -> anyhow::Result<()> {
    let token = config
        .telegram_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_TOKEN missing in environment"))?;
    let bot = Bot::new(token);

    let sink = Arc::new(TelegramSink::new(bot.clone()));
    let controller = build_controller(&config, sink.clone())?;
    controller.clone().spawn_sweeper(SWEEP_INTERVAL);

    let me = bot.get_me().await?;
    tracing::info!(bot = %me.username(), "Telegram bot started, polling for updates");

    let handler = Update::filter_message().endpoint(on_message);
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![controller, sink])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_ids_round_trip_through_user_ids() {
        assert_eq!(chat_id(&UserId::from(-100123_i64)).unwrap(), ChatId(-100123));
        assert!(matches!(
            chat_id(&UserId::from("web-user")),
            Err(ChatError::InvalidChat(_))
        ));
    }

    #[test]
    fn replies_follow_the_chat_the_user_wrote_from() {
        let sink = TelegramSink::new(Bot::new("123:test"));
        let member = UserId::from(777_i64);
        assert_eq!(sink.chat_for(&member).unwrap(), ChatId(777));

        sink.route(&member, ChatId(-100500));
        assert_eq!(sink.chat_for(&member).unwrap(), ChatId(-100500));
        assert_eq!(sink.chat_for(&UserId::from(778_i64)).unwrap(), ChatId(778));
    }

    #[test]
    fn previews_are_disabled_for_report_links() {
        assert!(no_link_preview().is_disabled);
    }
}
