//! Обработчики админских команд.

#[path = "handlers/commands.rs"]
mod commands;
#[path = "handlers/format.rs"]
mod format;
#[path = "handlers/state.rs"]
mod state;

pub use state::BotState;

use teloxide::dispatching::DpHandlerDescription;
use teloxide::dptree;
use teloxide::prelude::*;

pub fn schema() -> dptree::Handler<
    'static,
    Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>,
    DpHandlerDescription,
> {
    dptree::entry().branch(Update::filter_message().branch(commands::handler()))
}
