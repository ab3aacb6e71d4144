use super::format::{render_outcome, render_unresolved_page};
use super::state::{BotState, is_admin_message, sender_user_id};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum BotCommand {
    #[command(description = "Справка")]
    Help,
    #[command(description = "Неудалённые ключи (админ)")]
    Unresolved,
    #[command(description = "Повторить удаление ключа из журнала (админ)")]
    Purge(String),
    #[command(description = "Отметить ключ удалённым вручную (админ)")]
    Forget(String),
}

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::Unresolved].endpoint(cmd_unresolved))
        .branch(dptree::case![BotCommand::Purge(arg)].endpoint(cmd_purge))
        .branch(dptree::case![BotCommand::Forget(arg)].endpoint(cmd_forget))
}

/// Достаёт `<id>` из аргументов команды.
fn parse_row_id(arg: &str) -> Option<i64> {
    arg.split_whitespace().next()?.parse().ok()
}

async fn refuse_non_admin(bot: &Bot, msg: &Message) -> HandlerResult {
    tracing::warn!(user_id = ?sender_user_id(msg), "Non-admin tried admin command");
    bot.send_message(msg.chat.id, "Команда доступна только администраторам")
        .await?;
    Ok(())
}

async fn cmd_help(bot: Bot, msg: Message) -> HandlerResult {
    let text = r#"Команды администратора:
/unresolved — ключи, которые не удалось удалить с серверов
/purge <id> — повторить удаление ключа из журнала
/forget <id> — отметить ключ удалённым вручную (очищает все записи этого ключа)"#;
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn cmd_unresolved(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return refuse_non_admin(&bot, &msg).await;
    }
    tracing::info!("Admin command /unresolved");

    let total = state.db.count_unresolved().await?;
    let rows = state
        .db
        .list_unresolved(state.config.unresolved_page_size)
        .await?;
    bot.send_message(msg.chat.id, render_unresolved_page(total, &rows))
        .await?;
    Ok(())
}

async fn cmd_purge(bot: Bot, msg: Message, state: BotState, arg: String) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return refuse_non_admin(&bot, &msg).await;
    }
    let Some(row_id) = parse_row_id(&arg) else {
        bot.send_message(msg.chat.id, "Использование: /purge <id>")
            .await?;
        return Ok(());
    };
    tracing::info!(row_id, "Admin command /purge");

    let Some(row) = state.db.get_unresolved(row_id).await? else {
        bot.send_message(msg.chat.id, "Запись не найдена или уже очищена")
            .await?;
        return Ok(());
    };

    let wg_public_key = Some(row.wg_public_key.as_str()).filter(|key| !key.is_empty());
    let handle = state
        .remover
        .remove_key_server(&row.name_key, row.key_id, row.server_id, wg_public_key);
    bot.send_message(
        msg.chat.id,
        format!("#{}: удаление {} запущено", row_id, row.name_key),
    )
    .await?;

    let chat_id = msg.chat.id;
    tokio::spawn(async move {
        let text = match handle.await {
            Ok(outcome) => render_outcome(row_id, outcome),
            Err(error) => {
                tracing::error!(error = %error, row_id, "Purge task failed");
                format!("#{}: задача удаления завершилась с ошибкой", row_id)
            }
        };
        if let Err(error) = bot.send_message(chat_id, text).await {
            tracing::warn!(error = %error, row_id, "Failed to report purge outcome");
        }
    });
    Ok(())
}

async fn cmd_forget(bot: Bot, msg: Message, state: BotState, arg: String) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return refuse_non_admin(&bot, &msg).await;
    }
    let Some(row_id) = parse_row_id(&arg) else {
        bot.send_message(msg.chat.id, "Использование: /forget <id>")
            .await?;
        return Ok(());
    };
    tracing::info!(row_id, "Admin command /forget");

    let Some(row) = state.db.get_unresolved(row_id).await? else {
        bot.send_message(msg.chat.id, "Запись не найдена или уже очищена")
            .await?;
        return Ok(());
    };
    state
        .db
        .clear_unresolved(&row.name_key, row.key_id, row.server_id)
        .await?;
    bot.send_message(
        msg.chat.id,
        format!(
            "Ключ {} (key {}, server {}) отмечен удалённым",
            row.name_key, row.key_id, row.server_id
        ),
    )
    .await?;
    Ok(())
}
