use std::thread;
use std::time::Duration;

use crate::control::CancelToken;
use crate::error::GatewayError;
use crate::llm::prompt::LlmPrompt;

/// Anything that turns a prompt into raw model text.
///
/// Implementations must not be assumed idempotent: a resend may cost money
/// or hit a rate limit, so callers bound their retries.
pub trait ModelGateway: Send + Sync {
    fn complete(&self, prompt: &LlmPrompt) -> Result<String, GatewayError>;
}

impl<G: ModelGateway + ?Sized> ModelGateway for &G {
    fn complete(&self, prompt: &LlmPrompt) -> Result<String, GatewayError> {
        (**self).complete(prompt)
    }
}

impl<G: ModelGateway + ?Sized> ModelGateway for Box<G> {
    fn complete(&self, prompt: &LlmPrompt) -> Result<String, GatewayError> {
        (**self).complete(prompt)
    }
}

/// Stands in when no provider could be configured. Every request is a
/// fatal error carrying the reason.
pub struct Unavailable(pub String);

impl ModelGateway for Unavailable {
    fn complete(&self, _prompt: &LlmPrompt) -> Result<String, GatewayError> {
        Err(GatewayError::Fatal(self.0.clone()))
    }
}

/// Resends the same request on transient failures, with linear backoff.
pub struct RetryingGateway<G> {
    inner: G,
    tries: u32,
    backoff: Duration,
    cancel: CancelToken,
}

impl<G: ModelGateway> RetryingGateway<G> {
    pub fn new(inner: G, tries: u32, backoff: Duration, cancel: CancelToken) -> Self {
        Self {
            inner,
            tries: tries.max(1),
            backoff,
            cancel,
        }
    }
}

impl<G: ModelGateway> ModelGateway for RetryingGateway<G> {
    fn complete(&self, prompt: &LlmPrompt) -> Result<String, GatewayError> {
        let mut last_err = None;

        for attempt in 1..=self.tries {
            if self.cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            match self.inner.complete(prompt) {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, tries = self.tries, error = %e, "model request failed, retrying");
                    last_err = Some(e);
                    if attempt < self.tries {
                        thread::sleep(self.backoff * attempt);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::Transient("unknown model error".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<Result<String, GatewayError>>>, Mutex<u32>);

    impl Scripted {
        fn new(mut replies: Vec<Result<String, GatewayError>>) -> Self {
            replies.reverse();
            Self(Mutex::new(replies), Mutex::new(0))
        }

        fn calls(&self) -> u32 {
            *self.1.lock().unwrap()
        }
    }

    impl ModelGateway for Scripted {
        fn complete(&self, _prompt: &LlmPrompt) -> Result<String, GatewayError> {
            *self.1.lock().unwrap() += 1;
            self.0
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(GatewayError::Transient("script exhausted".into())))
        }
    }

    fn prompt() -> LlmPrompt {
        LlmPrompt {
            system: "s".into(),
            user: "u".into(),
        }
    }

    #[test]
    fn transient_errors_are_retried_then_succeed() {
        let inner = Scripted::new(vec![
            Err(GatewayError::Transient("429".into())),
            Ok("done".into()),
        ]);
        let gw = RetryingGateway::new(&inner, 3, Duration::ZERO, CancelToken::new());

        assert_eq!(gw.complete(&prompt()).unwrap(), "done");
        assert_eq!(inner.calls(), 2);
    }

    #[test]
    fn transient_retries_are_bounded() {
        let inner = Scripted::new(vec![]);
        let gw = RetryingGateway::new(&inner, 3, Duration::ZERO, CancelToken::new());

        assert!(gw.complete(&prompt()).unwrap_err().is_transient());
        assert_eq!(inner.calls(), 3);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let inner = Scripted::new(vec![Err(GatewayError::Fatal("401".into()))]);
        let gw = RetryingGateway::new(&inner, 3, Duration::ZERO, CancelToken::new());

        assert_eq!(
            gw.complete(&prompt()).unwrap_err(),
            GatewayError::Fatal("401".into())
        );
        assert_eq!(inner.calls(), 1);
    }

    #[test]
    fn cancellation_stops_before_sending() {
        let inner = Scripted::new(vec![Ok("x".into())]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let gw = RetryingGateway::new(&inner, 3, Duration::ZERO, cancel);

        assert_eq!(gw.complete(&prompt()).unwrap_err(), GatewayError::Cancelled);
        assert_eq!(inner.calls(), 0);
    }
}
