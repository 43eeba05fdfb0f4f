pub mod telegram;
pub mod traits;

pub use telegram::TelegramPlatform;
pub use traits::{
    CallbackQuery, ChatPlatform, InboundMessage, InlineQuery, MessageRef, PlatformError, Update,
};
