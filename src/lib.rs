pub mod chat;
pub mod command;
pub mod constants;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod gemini;
pub mod model;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod web_server;

pub use error::{ChatError, GenerationError};
pub use model::{Chat, ImageAttachment, Message, Role};
pub use orchestrator::{Orchestrator, TurnInput, TurnOutcome, TurnStatus};
