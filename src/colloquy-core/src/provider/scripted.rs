//! Offline provider for dry runs and tests.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ChatRequest, Reply, ReplyGenerator};
use crate::error::ColloquyError;
use crate::persona::ProviderKind;

enum Script {
    /// Cycle through fixed lines.
    Lines(Vec<String>),
    /// "<persona> (scripted reply N)".
    Numbered,
    /// Every call fails with this message.
    Failing(String),
}

pub struct ScriptedProvider {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Lines(lines.into_iter().map(Into::into).collect()))
    }

    pub fn numbered() -> Self {
        Self::with_script(Script::Numbered)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_script(Script::Failing(message.into()))
    }

    /// Number of `generate` calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Scripted
    }

    async fn generate(&self, request: &ChatRequest) -> Result<Reply, ColloquyError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        match &self.script {
            Script::Lines(lines) if lines.is_empty() => Ok(Reply::text("")),
            Script::Lines(lines) => Ok(Reply::text(lines[n % lines.len()].clone())),
            Script::Numbered => Ok(Reply::text(format!(
                "{} (scripted reply {})",
                request.persona,
                n + 1
            ))),
            Script::Failing(message) => Err(ColloquyError::Provider(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            persona: "James".to_string(),
            model: "m".to_string(),
            system: String::new(),
            messages: Vec::new(),
            max_tokens: 10,
            temperature: None,
        }
    }

    #[tokio::test]
    async fn test_lines_cycle() {
        let provider = ScriptedProvider::lines(["one", "two"]);
        let req = request();
        assert_eq!(provider.generate(&req).await.unwrap().text, "one");
        assert_eq!(provider.generate(&req).await.unwrap().text, "two");
        assert_eq!(provider.generate(&req).await.unwrap().text, "one");
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_numbered_names_persona() {
        let provider = ScriptedProvider::numbered();
        let reply = provider.generate(&request()).await.unwrap();
        assert_eq!(reply.text, "James (scripted reply 1)");
    }

    #[tokio::test]
    async fn test_failing() {
        let provider = ScriptedProvider::failing("boom");
        assert!(matches!(
            provider.generate(&request()).await,
            Err(ColloquyError::Provider(m)) if m == "boom"
        ));
    }
}
