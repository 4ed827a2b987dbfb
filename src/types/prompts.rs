//! MCP Prompt Types
//!
//! This module defines types related to prompts, including `Prompt` and
//! `PromptArgument`, which describe the templates a server can render for the
//! client. Rendering itself is done by the prompt handler.

use serde::{ Deserialize, Serialize };
use std::collections::HashMap;

/// An argument accepted by a prompt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromptArgument {
    /// Name of the argument
    pub name: String,
    /// Description of the argument
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument is required
    #[serde(default)]
    pub required: bool,
}

impl PromptArgument {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: false,
        }
    }
}

/// A prompt template advertised by a server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Prompt {
    /// Unique name of the prompt
    pub name: String,
    /// Description of the prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Arguments the prompt accepts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

impl Prompt {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_argument(mut self, argument: PromptArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Names of required arguments absent from `arguments`
    pub fn missing_arguments(&self, arguments: &HashMap<String, String>) -> Vec<String> {
        self.arguments
            .iter()
            .filter(|arg| arg.required && !arguments.contains_key(&arg.name))
            .map(|arg| arg.name.clone())
            .collect()
    }
}

/// Role of a message sender
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Content of a prompt message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptContent {
    /// Plain text
    Text {
        text: String,
    },
    /// Reference to a resource by URI
    Resource {
        uri: String,
    },
}

/// A rendered message of a prompt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: PromptContent,
}

impl PromptMessage {
    /// A user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: PromptContent::Text { text: text.into() },
        }
    }

    /// An assistant message with text content
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: PromptContent::Text { text: text.into() },
        }
    }
}

/// Parameters for `getPrompt`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetPromptParams {
    /// Name of the prompt
    pub name: String,
    /// Argument values
    #[serde(default, alias = "args")]
    pub arguments: HashMap<String, String>,
}

/// Result of `getPrompt`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetPromptResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// Result of `listPrompts`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ListPromptsResult {
    pub prompts: Vec<Prompt>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_arguments_are_reported() {
        let prompt = Prompt::new("greet")
            .with_argument(PromptArgument::required("name"))
            .with_argument(PromptArgument::optional("tone"));
        let mut args = HashMap::new();
        args.insert("tone".to_string(), "warm".to_string());
        assert_eq!(prompt.missing_arguments(&args), vec!["name".to_string()]);
    }

    #[test]
    fn message_content_is_tagged() {
        let msg = PromptMessage::user("hello");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "user", "content": {"type": "text", "text": "hello"}})
        );
    }
}
