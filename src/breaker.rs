//! Per-upstream failure isolation.
//!
//! One breaker per logical upstream key (source id or base URL). The mutex is
//! held for state decisions only, never while the wrapped call runs.

use crate::config::CircuitBreakerSettings;
use crate::errors::{ErrorKind, ToolgateError, ToolgateResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionReason {
    FailureThresholdReached,
    RecoveryTimeoutElapsed,
    TestCallSucceeded,
    TestCallFailed,
    ManualReset,
}

/// Typed transition event delivered to observers.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitEvent {
    pub circuit_id: String,
    pub circuit_type: String,
    pub source_id: String,
    pub reason: TransitionReason,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Observer hook for breaker transitions. Observer errors are logged and
/// swallowed; events are never dropped because an observer failed.
pub trait CircuitObserver: Send + Sync {
    fn on_transition(&self, event: &CircuitEvent) -> anyhow::Result<()>;
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_call_count: u32,
}

pub struct CircuitBreaker {
    key: String,
    circuit_type: String,
    source_id: String,
    settings: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
    observers: Arc<Vec<Arc<dyn CircuitObserver>>>,
}

enum Admission {
    Normal,
    HalfOpenProbe,
}

impl CircuitBreaker {
    fn new(
        key: String,
        circuit_type: String,
        source_id: String,
        settings: CircuitBreakerSettings,
        observers: Arc<Vec<Arc<dyn CircuitObserver>>>,
    ) -> Self {
        Self {
            key,
            circuit_type,
            source_id,
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                half_open_call_count: 0,
            }),
            observers,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// OPEN before the recovery timeout rejects with `CIRCUIT_OPEN` without
    /// invoking the callee. Only retryable failures count toward the
    /// threshold; a 4xx that the caller classified as non-retryable passes
    /// through without touching breaker state.
    pub async fn call<T, F, Fut>(&self, op: F) -> ToolgateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ToolgateResult<T>>,
    {
        let admission = self.admit().await?;
        let result = op().await;
        match &result {
            Ok(_) => self.record_success(&admission).await,
            Err(err) if err.is_retryable() => self.record_failure(&admission).await,
            Err(_) => self.release(&admission).await,
        }
        result
    }

    async fn admit(&self) -> ToolgateResult<Admission> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed < Duration::from_secs(self.settings.recovery_timeout_secs) {
                    let remaining =
                        Duration::from_secs(self.settings.recovery_timeout_secs) - elapsed;
                    return Err(ToolgateError::new(
                        ErrorKind::CircuitOpen,
                        format!(
                            "circuit '{}' is open; retry in {}s",
                            self.key,
                            remaining.as_secs().max(1)
                        ),
                    )
                    .with_detail("circuit_id", self.key.clone().into()));
                }
                let failure_count = inner.failure_count;
                inner.state = CircuitState::HalfOpen;
                inner.half_open_call_count = 1;
                drop(inner);
                self.emit(TransitionReason::RecoveryTimeoutElapsed, CircuitState::HalfOpen, failure_count);
                Ok(Admission::HalfOpenProbe)
            }
            CircuitState::HalfOpen => {
                if inner.half_open_call_count >= self.settings.half_open_max_calls {
                    return Err(ToolgateError::new(
                        ErrorKind::CircuitTesting,
                        format!("circuit '{}' is testing recovery; retry shortly", self.key),
                    )
                    .with_detail("circuit_id", self.key.clone().into()));
                }
                inner.half_open_call_count += 1;
                Ok(Admission::HalfOpenProbe)
            }
        }
    }

    async fn record_success(&self, admission: &Admission) {
        let mut inner = self.inner.lock().await;
        inner.failure_count = 0;
        if let Admission::HalfOpenProbe = admission {
            inner.half_open_call_count = inner.half_open_call_count.saturating_sub(1);
        }
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.half_open_call_count = 0;
            drop(inner);
            info!("circuit '{}' closed after successful test call", self.key);
            self.emit(TransitionReason::TestCallSucceeded, CircuitState::Closed, 0);
        }
    }

    async fn record_failure(&self, admission: &Admission) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        if let Admission::HalfOpenProbe = admission {
            inner.half_open_call_count = inner.half_open_call_count.saturating_sub(1);
        }
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.settings.failure_threshold {
                    let failure_count = inner.failure_count;
                    inner.state = CircuitState::Open;
                    drop(inner);
                    warn!(
                        "circuit '{}' opened after {} consecutive failures",
                        self.key, failure_count
                    );
                    self.emit(
                        TransitionReason::FailureThresholdReached,
                        CircuitState::Open,
                        failure_count,
                    );
                }
            }
            CircuitState::HalfOpen => {
                let failure_count = inner.failure_count;
                inner.state = CircuitState::Open;
                inner.half_open_call_count = 0;
                drop(inner);
                warn!("circuit '{}' test call failed; reopening", self.key);
                self.emit(TransitionReason::TestCallFailed, CircuitState::Open, failure_count);
            }
            CircuitState::Open => {}
        }
    }

    /// Release a half-open slot without recording success or failure (used
    /// when a probe returned a non-retryable error that says nothing about
    /// upstream health).
    async fn release(&self, admission: &Admission) {
        if let Admission::HalfOpenProbe = admission {
            let mut inner = self.inner.lock().await;
            inner.half_open_call_count = inner.half_open_call_count.saturating_sub(1);
        }
    }

    /// Explicit reset to CLOSED. Emits MANUAL_RESET even when already closed.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_call_count = 0;
        inner.last_failure_time = None;
        drop(inner);
        info!("circuit '{}' manually reset", self.key);
        self.emit(TransitionReason::ManualReset, CircuitState::Closed, 0);
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    fn emit(&self, reason: TransitionReason, state: CircuitState, failure_count: u32) {
        let event = CircuitEvent {
            circuit_id: self.key.clone(),
            circuit_type: self.circuit_type.clone(),
            source_id: self.source_id.clone(),
            reason,
            state,
            failure_count,
        };
        for observer in self.observers.iter() {
            if let Err(e) = observer.on_transition(&event) {
                warn!("circuit observer failed for '{}': {}", self.key, e);
            }
        }
    }
}

/// Hands out breakers by key and supports admin resets.
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    observers: Arc<Vec<Arc<dyn CircuitObserver>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Arc<Self> {
        Self::with_observers(settings, Vec::new())
    }

    pub fn with_observers(
        settings: CircuitBreakerSettings,
        observers: Vec<Arc<dyn CircuitObserver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
            observers: Arc::new(observers),
        })
    }

    pub async fn get_or_create(
        &self,
        key: &str,
        circuit_type: &str,
        source_id: &str,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    key.to_string(),
                    circuit_type.to_string(),
                    source_id.to_string(),
                    self.settings.clone(),
                    self.observers.clone(),
                ))
            })
            .clone()
    }

    /// Reset one breaker by key; `None` when the key was never used.
    pub async fn reset(&self, key: &str) -> Option<()> {
        let breaker = self.breakers.lock().await.get(key).cloned()?;
        breaker.reset().await;
        Some(())
    }

    pub async fn reset_all(&self) -> usize {
        let breakers: Vec<_> = self.breakers.lock().await.values().cloned().collect();
        let count = breakers.len();
        for breaker in breakers {
            breaker.reset().await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        events: StdMutex<Vec<CircuitEvent>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
            })
        }

        fn reasons(&self) -> Vec<TransitionReason> {
            self.events.lock().unwrap().iter().map(|e| e.reason).collect()
        }
    }

    impl CircuitObserver for RecordingObserver {
        fn on_transition(&self, event: &CircuitEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingObserver;

    impl CircuitObserver for FailingObserver {
        fn on_transition(&self, _event: &CircuitEvent) -> anyhow::Result<()> {
            anyhow::bail!("observer exploded")
        }
    }

    fn settings(threshold: u32, recovery_secs: u64) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
            half_open_max_calls: 3,
        }
    }

    fn upstream_err() -> ToolgateError {
        ToolgateError::new(ErrorKind::UpstreamTimeout, "upstream timed out")
    }

    async fn registry_with(
        observer: Arc<RecordingObserver>,
        threshold: u32,
        recovery_secs: u64,
    ) -> (Arc<CircuitBreakerRegistry>, Arc<CircuitBreaker>) {
        let registry =
            CircuitBreakerRegistry::with_observers(settings(threshold, recovery_secs), vec![observer]);
        let breaker = registry.get_or_create("orders", "tool_call", "orders").await;
        (registry, breaker)
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_invoking() {
        let observer = RecordingObserver::new();
        let (_registry, breaker) = registry_with(observer.clone(), 3, 60).await;

        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>(upstream_err()) }).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        let mut invoked = false;
        let result = breaker
            .call(|| {
                invoked = true;
                async { Ok::<_, ToolgateError>(()) }
            })
            .await;
        assert!(!invoked);
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert!(err.is_retryable());
        assert_eq!(
            observer.reasons(),
            vec![TransitionReason::FailureThresholdReached]
        );
    }

    #[tokio::test]
    async fn recovers_through_half_open_on_success() {
        let observer = RecordingObserver::new();
        let (_registry, breaker) = registry_with(observer.clone(), 1, 0).await;

        let _ = breaker.call(|| async { Err::<(), _>(upstream_err()) }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Recovery timeout (0s) elapsed: the next call is admitted as a probe.
        let result = breaker.call(|| async { Ok::<_, ToolgateError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(
            observer.reasons(),
            vec![
                TransitionReason::FailureThresholdReached,
                TransitionReason::RecoveryTimeoutElapsed,
                TransitionReason::TestCallSucceeded,
            ]
        );
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let observer = RecordingObserver::new();
        let (_registry, breaker) = registry_with(observer.clone(), 1, 0).await;

        let _ = breaker.call(|| async { Err::<(), _>(upstream_err()) }).await;
        let _ = breaker.call(|| async { Err::<(), _>(upstream_err()) }).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(observer.reasons().contains(&TransitionReason::TestCallFailed));
    }

    #[tokio::test]
    async fn non_retryable_errors_do_not_trip() {
        let observer = RecordingObserver::new();
        let (_registry, breaker) = registry_with(observer.clone(), 2, 60).await;

        for _ in 0..5 {
            let _ = breaker
                .call(|| async {
                    Err::<(), _>(ToolgateError::validation("bad arguments", vec![]))
                })
                .await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(observer.reasons().is_empty());
    }

    #[tokio::test]
    async fn reset_on_closed_still_emits_manual_reset() {
        let observer = RecordingObserver::new();
        let (registry, breaker) = registry_with(observer.clone(), 3, 60).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        registry.reset("orders").await.unwrap();
        assert_eq!(observer.reasons(), vec![TransitionReason::ManualReset]);
    }

    #[tokio::test]
    async fn reset_unknown_key_is_none() {
        let registry = CircuitBreakerRegistry::new(settings(3, 60));
        assert!(registry.reset("never-used").await.is_none());
    }

    #[tokio::test]
    async fn observer_failure_is_swallowed() {
        let registry = CircuitBreakerRegistry::with_observers(
            settings(1, 60),
            vec![Arc::new(FailingObserver)],
        );
        let breaker = registry.get_or_create("orders", "tool_call", "orders").await;
        // Transition triggers the failing observer; the call itself still
        // returns the underlying error, not the observer's.
        let err = breaker
            .call(|| async { Err::<(), _>(upstream_err()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamTimeout);
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_concurrency_cap_rejects_with_circuit_testing() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings {
            failure_threshold: 1,
            recovery_timeout_secs: 0,
            half_open_max_calls: 1,
        });
        let breaker = registry.get_or_create("orders", "tool_call", "orders").await;
        let _ = breaker.call(|| async { Err::<(), _>(upstream_err()) }).await;

        // First probe holds the only half-open slot while a second call arrives.
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = gate_rx.await;
                        Ok::<_, ToolgateError>(())
                    })
                    .await
            })
        };
        // Give the probe time to be admitted.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = breaker
            .call(|| async { Ok::<_, ToolgateError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitTesting);
        assert!(err.is_retryable());

        let _ = gate_tx.send(());
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }
}
