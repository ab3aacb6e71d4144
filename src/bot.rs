//! Админский Telegram-бот для журнала неудалённых ключей.

pub mod handlers;
