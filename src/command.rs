//! Turns raw chat input into one of a closed set of commands.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

const VIDEO_PREFIX: &str = "gerar vídeo:";
const IMAGE_PREFIX: &str = "gerar imagem:";
const AUDIO_PREFIX: &str = "gerar áudio:";

const LOGO_SUBJECTS: [&str; 3] = ["f.c. arábia", "fc arábiao", "bloco a"];
const LOGO_WORDS: [&str; 3] = ["logo", "símbolo", "emblema"];

pub const LOGO_CAPTION: &str = "Aqui está o emblema oficial do F.C. Arábia, Bloco A!";

lazy_static::lazy_static! {
    /// The club emblem, served inline so the canned answer needs no network.
    pub static ref LOGO_DATA_URL: String = format!(
        "data:image/svg+xml;base64,{}",
        BASE64_STANDARD.encode(include_bytes!("../assets/fc-arabia-logo.svg"))
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Canned emblem answer, no remote call.
    Logo,
    GenerateVideo { prompt: String },
    GenerateImage { prompt: String },
    GenerateAudio { prompt: String },
    /// Plain conversation turn.
    Reply { prompt: String },
}

impl Command {
    /// First match wins; matching ignores case.
    pub fn parse(input: &str) -> Self {
        let lower = input.to_lowercase();

        if LOGO_SUBJECTS.iter().any(|s| lower.contains(s))
            && LOGO_WORDS.iter().any(|w| lower.contains(w))
        {
            return Command::Logo;
        }

        if let Some(prompt) = strip_prefix(input, &lower, VIDEO_PREFIX) {
            return Command::GenerateVideo { prompt };
        }
        if let Some(prompt) = strip_prefix(input, &lower, IMAGE_PREFIX) {
            return Command::GenerateImage { prompt };
        }
        if let Some(prompt) = strip_prefix(input, &lower, AUDIO_PREFIX) {
            return Command::GenerateAudio { prompt };
        }

        Command::Reply {
            prompt: input.to_string(),
        }
    }

    /// Text to overwrite the placeholder with while the command runs.
    pub fn progress_text(&self) -> Option<&'static str> {
        match self {
            Command::GenerateVideo { .. } => Some(
                "A criar o seu vídeo de alta qualidade... isto pode demorar alguns minutos! ✨",
            ),
            Command::GenerateImage { .. } => {
                Some("A criar a sua imagem realista... isto pode demorar um pouco! 🖼️")
            }
            Command::GenerateAudio { .. } => Some("A gerar o seu áudio... 🎙️"),
            Command::Logo | Command::Reply { .. } => None,
        }
    }
}

/// Image-generation mode sends everything as an image command.
pub fn image_request(text: &str) -> String {
    format!("{IMAGE_PREFIX} {text}")
}

// `lower` is `input` lowercased; the prompt is cut from the original so its
// casing survives.
fn strip_prefix(input: &str, lower: &str, prefix: &str) -> Option<String> {
    if !lower.starts_with(prefix) {
        return None;
    }
    let skip = prefix.chars().count();
    let rest = input
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| &input[idx..])
        .unwrap_or("");
    Some(rest.trim().to_string())
}
