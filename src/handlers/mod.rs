pub mod chat_completions;
pub mod messages;
pub mod monitor_api;
pub mod ws;
