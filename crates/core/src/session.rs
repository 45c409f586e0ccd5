//! Live session configuration.
//!
//! `LiveConnectConfig` is the value handed to the external real-time session
//! API when a conversation opens. It serializes with the API's camelCase wire
//! names and cannot be modified once built.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::prompt::SystemInstruction;
use crate::tools::FunctionDeclaration;

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_VOICE: &str = "Aoede";

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveConnectConfig {
    model: String,
    response_modalities: Vec<Modality>,
    speech_config: SpeechConfig,
    tools: Vec<Tool>,
    system_instruction: SystemInstruction,
}

impl LiveConnectConfig {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn response_modalities(&self) -> &[Modality] {
        &self.response_modalities
    }

    pub fn voice_name(&self) -> &str {
        &self.speech_config.voice_config.prebuilt_voice_config.voice_name
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn system_instruction(&self) -> &SystemInstruction {
        &self.system_instruction
    }
}

/// Packages an instruction with the fixed model, voice and tool set.
#[derive(Clone, Debug)]
pub struct SessionFactory {
    model: String,
    voice: String,
    declarations: Arc<Vec<FunctionDeclaration>>,
}

impl SessionFactory {
    pub fn new(
        model: impl Into<String>,
        voice: impl Into<String>,
        declarations: Vec<FunctionDeclaration>,
    ) -> Self {
        Self {
            model: model.into(),
            voice: voice.into(),
            declarations: Arc::new(declarations),
        }
    }

    pub fn declarations(&self) -> &[FunctionDeclaration] {
        &self.declarations
    }

    pub fn build(&self, system_instruction: SystemInstruction) -> LiveConnectConfig {
        LiveConnectConfig {
            model: self.model.clone(),
            response_modalities: vec![Modality::Audio],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: self.voice.clone(),
                    },
                },
            },
            tools: vec![Tool {
                function_declarations: self.declarations.to_vec(),
            }],
            system_instruction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Part;
    use serde_json::json;

    fn factory() -> SessionFactory {
        SessionFactory::new(
            DEFAULT_LIVE_MODEL,
            DEFAULT_VOICE,
            vec![FunctionDeclaration {
                name: "set_user_name".into(),
                description: "Set the name.".into(),
                parameters: json!({ "type": "object" }),
            }],
        )
    }

    #[test]
    fn test_build_wire_format() {
        let config = factory().build(SystemInstruction {
            parts: vec![Part::text("BASE")],
        });
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({
                "model": "gemini-2.0-flash-exp",
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Aoede" } }
                },
                "tools": [{
                    "functionDeclarations": [{
                        "name": "set_user_name",
                        "description": "Set the name.",
                        "parameters": { "type": "object" }
                    }]
                }],
                "systemInstruction": { "parts": [{ "text": "BASE" }] }
            })
        );
    }

    #[test]
    fn test_accessors() {
        let config = factory().build(SystemInstruction { parts: vec![] });
        assert_eq!(config.model(), "gemini-2.0-flash-exp");
        assert_eq!(config.voice_name(), "Aoede");
        assert_eq!(config.response_modalities(), &[Modality::Audio]);
        assert_eq!(config.tools()[0].function_declarations.len(), 1);
        assert!(config.system_instruction().parts.is_empty());
    }
}
