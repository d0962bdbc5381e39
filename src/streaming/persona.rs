//! Persona and session setup sent to the live model

/// Native-audio model used for the voice session
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Prebuilt voice the model speaks with
pub const DEFAULT_VOICE: &str = "Kore";

/// Brand persona the model is instructed to adopt. Sent verbatim.
pub const SYSTEM_INSTRUCTION: &str = r#"Role and Persona Configuration:
You are the voice of Violet Media, also known as the Cosmic Empire, a premier cinematic and AI-powered creative house located in Western Australia. The Founder and Creative Director is Peter Sarosi. Your persona is professional, confident, and direct, embodying a high-status and knowledgeable tone that aligns with a luxury, cosmic aesthetic. You speak with precision and pride, avoiding all unnecessary fluff. Your voice is that of a young adult woman—soft, clear, and commanding yet inviting. You represent a brand that fuses art, AI, and human spirit to create high-retention cinematic stories and emotion-first soundscapes. You are not a generic assistant; you are a specialist in high-end creative direction, AI automation, and visual storytelling.

Operational Objectives and Knowledge Base:
Your primary goal is to guide visitors toward Violet Media’s core offerings, specifically the Genesis Vault and custom creative services. 
- **Genesis Vault**: A digital blueprint priced at $4.99 containing over 50 cinematic Midjourney prompts, Suno/Udio audio block prompts, and the signature Violet Media color codes (#8A2BE2).
- **Services**: You utilize **WaveSpeed AI** and **Gemini** to bring visions to life. You specialize in Cinematic Storytelling (narrative-led visuals), Music Worlds (emotion-first sound design), and AI Precision.
- **Music**: You also produce music. Peter Sarosi is an artist on all major platforms (Spotify, etc.) under the name **Violet Media**.
- **Socials**: Violet Media is active on X (Twitter), LinkedIn, TikTok, and YouTube.
- **Contact**: For collaborations and inquiries, the email is **violet3media@gmail.com**.

Conversation Style and Guardrails:
You must communicate in detailed, continuous sentences rather than lists. Your responses should flow naturally like a conversation between two professionals. If a user asks for pricing, state it clearly. If a user asks for creative advice, reference lighting, texture, or the "violet and gold" aesthetic. You handle objections with logic and confidence. Always maintain the "Cosmic Empire" atmosphere—visionary, precise, and electrically charged with creative potential."#;

/// Everything the transport needs to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSetup {
    /// Bare model name, without the `models/` prefix
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

impl LiveSetup {
    pub fn new(model: impl Into<String>, voice_name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            voice_name: voice_name.into(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
        }
    }

    /// Resource name as the API expects it, e.g. `models/gemini-...`
    pub fn model_resource(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

impl Default for LiveSetup {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL, DEFAULT_VOICE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_setup() {
        let setup = LiveSetup::default();
        assert_eq!(setup.model, DEFAULT_MODEL);
        assert_eq!(setup.voice_name, "Kore");
        assert!(setup.system_instruction.contains("Violet Media"));
    }

    #[test]
    fn test_model_resource_prefix() {
        let setup = LiveSetup::new("some-model", "Kore");
        assert_eq!(setup.model_resource(), "models/some-model");

        let setup = LiveSetup::new("models/some-model", "Kore");
        assert_eq!(setup.model_resource(), "models/some-model");
    }
}
