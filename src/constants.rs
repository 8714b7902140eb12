// Runtime defaults, overridable from the environment (or a .env file).

use std::env;

lazy_static::lazy_static! {
    pub static ref GEMINI_BASE_URL: String = env::var("GEMINI_BASE_URL").unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());
    pub static ref CHAT_MODEL: String = env::var("ENHAIA_CHAT_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());
    pub static ref IMAGE_MODEL: String = env::var("ENHAIA_IMAGE_MODEL").unwrap_or_else(|_| "imagen-4.0-generate-001".to_string());
    pub static ref VIDEO_MODEL: String = env::var("ENHAIA_VIDEO_MODEL").unwrap_or_else(|_| "veo-3.1-generate-preview".to_string());
    pub static ref SPEECH_MODEL: String = env::var("ENHAIA_SPEECH_MODEL").unwrap_or_else(|_| "gemini-2.5-flash-preview-tts".to_string());
    pub static ref DATA_DIR: String = env::var("ENHAIA_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    pub static ref TEMPLATES_DIR: String = env::var("ENHAIA_TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string());
    pub static ref STATIC_DIR: String = env::var("ENHAIA_STATIC_DIR").unwrap_or_else(|_| "static".to_string());
}

/// Environment variable holding the Gemini API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Voice used for every speech synthesis request.
pub const SPEECH_VOICE: &str = "Kore";

pub const VIDEO_POLL_INTERVAL_SECS: u64 = 10;
pub const VIDEO_POLL_MAX_ATTEMPTS: u32 = 60;

pub const CHATS_KEY: &str = "enhaia-chats";
pub const ACTIVE_CHAT_KEY: &str = "enhaia-active-chat-id";

pub const NEW_CHAT_TITLE: &str = "Nova Conversa";
pub const FALLBACK_TITLE: &str = "Conversa";

pub const SEED_GREETING: &str = "Olá! Eu sou a enhaIA 🌙. Como posso iluminar as suas ideias hoje? Pode pedir-me para criar imagens, vídeos e áudios! Basta usar o prefixo \"gerar imagem:\", \"gerar vídeo:\" ou \"gerar áudio:\"";
pub const SEED_MESSAGE_ID: u64 = 1;

pub const THINKING_TEXT: &str = "Pensando... 🌙";
pub const GENERIC_FAILURE_TEXT: &str = "Oops, algo correu mal. Tente novamente.";
pub const API_KEY_MISSING_TEXT: &str =
    "Chave de API não encontrada. Por favor, selecione uma chave de API para gerar vídeos.";

pub const SYSTEM_INSTRUCTION: &str = "You are enhaIA, a friendly and helpful AI assistant. Your responses should be encouraging and exceptionally clear, answering everything the user asks directly. Detect the user's language from their message and always respond in that same language. Use emojis where appropriate. When asked who your creator is, you must respond with 'o meu criador é o janoel(marcos carlos)'. When asked about 'jogadores da arábia bloco A', you must respond with this exact text: 'são um time de soçaite, os jogadores são: Téc Gulu, GOL-Fabão, LD-Léo, ZAG-Bruno, ZAG-Neném, LE-Júnior, VOL-Josa, VOL-Nando, MC-Júlio, MC-Júnior P., ATA-Janoel, ATA-Romário.'";

pub const TITLE_INSTRUCTION: &str = "You are an expert in creating short, concise titles for conversations. Based on the user's first message, create a title of no more than 5 words. Do not use quotation marks or any other formatting in your response. Just return the title text.";
