//! Resilience wrapper for reasoning backends
//!
//! Every call is bounded by a timeout and a fixed retry budget. Sustained
//! failures trip a circuit breaker so callers fail fast instead of queueing
//! behind a dead backend. A semaphore caps in-flight calls.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::{LlmClient, LlmResponse, Message};
use crate::config::ReasoningConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial call is outstanding
    trial_started: Option<Instant>,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call may go through. An open breaker moves to half-open
    /// once the cooldown has elapsed and lets one trial call pass; other
    /// callers fail fast until its outcome is recorded. A trial call that never
    /// reports back is replaced after another cooldown.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let stale = inner
                    .trial_started
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if stale {
                    inner.trial_started = Some(Instant::now());
                }
                stale
            }
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    tracing::info!("reasoning circuit half-open, trying backend");
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("reasoning circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.trial_started = None;
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            tracing::warn!(
                failures = inner.consecutive_failures,
                "reasoning circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Poisoning cannot leave the breaker half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decorator applying timeout, retry, circuit-breaking and a concurrency cap
pub struct GuardedLlmClient {
    inner: Box<dyn LlmClient>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
    breaker: CircuitBreaker,
    permits: Semaphore,
}

impl GuardedLlmClient {
    pub fn new(inner: Box<dyn LlmClient>, limits: &ReasoningConfig) -> Self {
        Self {
            inner,
            timeout: limits.timeout(),
            max_retries: limits.max_retries,
            backoff: limits.retry_backoff(),
            breaker: CircuitBreaker::new(
                limits.circuit_failure_threshold,
                limits.circuit_cooldown(),
            ),
            permits: Semaphore::new(limits.max_concurrent_calls.max(1)),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn attempt(
        &self,
        messages: &[Message],
        system_prompt: Option<&str>,
    ) -> Result<LlmResponse> {
        match tokio::time::timeout(
            self.timeout,
            self.inner.send_message_with_system(messages, system_prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "reasoning call timed out after {:?}",
                self.timeout
            )),
        }
    }
}

#[async_trait]
impl LlmClient for GuardedLlmClient {
    async fn send_message_with_system(
        &self,
        messages: &[Message],
        system_prompt: Option<&str>,
    ) -> Result<LlmResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| anyhow!("reasoning client is shutting down"))?;

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if !self.breaker.allow() {
                return Err(anyhow!("reasoning circuit is open; failing fast"));
            }

            if attempt > 0 {
                let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(attempt, ?delay, "retrying reasoning call");
                tokio::time::sleep(delay).await;
            }

            match self.attempt(messages, system_prompt).await {
                Ok(response) => {
                    self.breaker.record_success();
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reasoning call failed");
                    self.breaker.record_failure();
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("reasoning call failed")))
    }
}
