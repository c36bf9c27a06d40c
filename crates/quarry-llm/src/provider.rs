use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

pub trait LlmProvider: Send + Sync {
    /// Send messages to the generative model and return the assistant response.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails to communicate or the response is invalid.
    fn chat(&self, messages: &[Message]) -> impl Future<Output = crate::error::Result<String>> + Send;

    /// Embed a single text into a fixed-length vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding service fails or is not configured.
    fn embed(&self, text: &str) -> impl Future<Output = crate::error::Result<Vec<f32>>> + Send;

    /// Embed a batch of texts, returning one vector per input in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding service fails, is not configured, or
    /// returns a different number of vectors than inputs.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = crate::error::Result<Vec<Vec<f32>>>> + Send;

    fn supports_embeddings(&self) -> bool;

    /// Identifier of the embedding model, used to scope cache keys.
    fn embedding_model(&self) -> &str;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn message_constructors() {
        let m = Message::system("rules");
        assert_eq!(m.role, Role::System);
        assert_eq!(m.content, "rules");
        let m = Message::user("hi");
        assert_eq!(m.role, Role::User);
    }
}
