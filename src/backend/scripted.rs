//! In-process backend that replays a script. Used by tests and dry runs.

use super::{Backend, BackendRequest, BackendResponse, ResponseMetadata};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted reaction to a call.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(String),
    /// Returned as a failed response with this error text.
    Fail(String),
    /// Returned as `Err(..)` from `execute`.
    Error(String),
    /// Never answers within any sane timeout.
    Hang,
}

type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// Answers from a queue first, then from an optional responder, then fails.
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    responder: Option<Responder>,
    available: AtomicBool,
    models: Vec<String>,
    context_window: Option<usize>,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            available: AtomicBool::new(true),
            models: vec![format!("{}-default", name)],
            context_window: None,
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_script(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(replies);
        }
        self
    }

    pub fn with_responder(mut self, f: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = Some(tokens);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Highest number of overlapping `execute` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> Reply {
        let queued = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (queued, &self.responder) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(prompt),
            (None, None) => Reply::Error(format!("{}: script exhausted", self.name)),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self.next_reply(&request.prompt);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match reply {
            Reply::Ok(content) => {
                let tokens = (request.prompt.len() + content.len()).div_ceil(4) as u64;
                Ok(BackendResponse {
                    content,
                    success: true,
                    error: None,
                    metadata: ResponseMetadata {
                        model: self.models.first().cloned(),
                        tokens: Some(tokens),
                        duration_ms: self.delay.as_millis() as u64,
                    },
                })
            }
            Reply::Fail(message) => Ok(BackendResponse::failed(message)),
            Reply::Error(message) => bail!(message),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                bail!("{}: woke from hang", self.name)
            }
        }
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn list_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn context_window_tokens(&self) -> Option<usize> {
        self.context_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> BackendRequest {
        BackendRequest {
            prompt: prompt.to_string(),
            model: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_script_then_responder() {
        let backend = ScriptedBackend::new("alpha")
            .with_script([Reply::Fail("rate limit".into())])
            .with_responder(|p| Reply::Ok(format!("echo {}", p)));

        let first = backend.execute(&request("one")).await.unwrap();
        assert!(!first.success);
        let second = backend.execute(&request("two")).await.unwrap();
        assert_eq!(second.content, "echo two");
        assert_eq!(backend.prompts(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let backend = ScriptedBackend::new("alpha");
        assert!(backend.execute(&request("x")).await.is_err());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_flag() {
        assert!(!ScriptedBackend::new("a").unavailable().is_available().await);
        assert!(ScriptedBackend::new("b").is_available().await);
    }
}
