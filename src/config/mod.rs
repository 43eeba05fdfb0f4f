pub mod schema;

pub use schema::{
    Config, ConversationConfig, DownloadsConfig, DriveConfig, ReliabilityConfig, TelegramConfig,
};
