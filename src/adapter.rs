//! Engine-to-adapter interface and the retry/rotation state machine that
//! sits in front of it.
//!
//! The adapter trait takes the credential to use as an explicit argument
//! on every call: no sub-client "current index" is mutated by concurrent
//! workers, because there is no mutable index at all — the caller always
//! says which credential to use.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::credential_pool::CredentialPool;
use crate::error::{AdapterError, AdapterErrorKind, EngineError};
use crate::types::{CredentialId, EngineValue, Operation};

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    async fn invoke(
        &self,
        credential: CredentialId,
        operation: &Operation,
    ) -> Result<EngineValue, AdapterError>;
}

/// Runs the two-axis retry/rotation state machine for a single request,
/// starting from `initial_credential`: same-credential retries on
/// transient/null-response errors, cross-credential rotation on quota
/// errors, immediate failure on fatal errors.
///
/// `initial_credential`'s first invocation is assumed already counted by
/// the caller (the dispatcher calls `record_use` once before spawning the
/// worker); every invocation after that — same-credential retries and
/// post-rotation first attempts alike — records a fresh use here, one
/// call per actual invocation.
pub async fn run_with_retry(
    adapter: &dyn UpstreamAdapter,
    pool: &CredentialPool,
    clock: &dyn Clock,
    config: &EngineConfig,
    initial_credential: CredentialId,
    operation: &Operation,
) -> Result<EngineValue, EngineError> {
    let mut credential = initial_credential;
    let mut last_error: Option<AdapterError> = None;
    let mut first_call = true;

    for rotation in 0..=config.max_rotations {
        for attempt in 0..=1u32 {
            if !first_call {
                pool.record_use(credential, clock.now());
            }
            first_call = false;

            match adapter.invoke(credential, operation).await {
                Ok(value) => {
                    info!(
                        target: "adapter_retry",
                        credential, rotation, attempt, "invocation succeeded"
                    );
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        target: "adapter_retry",
                        credential, rotation, attempt, kind = ?err.kind, detail = %err.detail,
                        "invocation failed"
                    );
                    match err.kind {
                        AdapterErrorKind::Fatal => {
                            return Err(EngineError::UpstreamFatal(err.detail));
                        }
                        AdapterErrorKind::Quota => {
                            last_error = Some(err);
                            break; // fall through to rotation immediately
                        }
                        AdapterErrorKind::NullResponse | AdapterErrorKind::Transient => {
                            last_error = Some(err);
                            if attempt < 1 {
                                clock.sleep(config.retry_backoff).await;
                                continue;
                            }
                            // exhausted same-credential retry, fall through to rotation
                            break;
                        }
                    }
                }
            }
        }

        if rotation < config.max_rotations {
            // Keep waiting for an eligible credential within this rotation
            // tier; a transient "none eligible right now" must not itself
            // consume a rotation slot.
            loop {
                match next_credential(pool, clock).await {
                    Ok(Some(next)) => {
                        credential = next;
                        break;
                    }
                    Ok(None) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    // Classify by the kind of the *last* error observed, matching spec's
    // "record FAILED with the last error (kind QUOTA_EXHAUSTED or
    // TRANSIENT_EXHAUSTED)".
    match last_error {
        Some(AdapterError { kind: AdapterErrorKind::Quota, detail }) => {
            Err(EngineError::QuotaExhausted(detail))
        }
        Some(AdapterError { detail, .. }) => Err(EngineError::TransientExhausted(detail)),
        None => Err(EngineError::Internal(
            "retry loop exited with no recorded error".into(),
        )),
    }
}

/// Finds the next eligible credential for a rotation. If none is
/// immediately eligible, waits briefly and returns `Ok(None)` so the
/// caller retries the same rotation tier rather than burning a rotation
/// slot on a transient unavailability. If every credential is unusable,
/// fails fast with `ALL_CREDENTIALS_DOWN`.
async fn next_credential(
    pool: &CredentialPool,
    clock: &dyn Clock,
) -> Result<Option<CredentialId>, EngineError> {
    if pool.all_unusable() {
        return Err(EngineError::AllCredentialsDown);
    }
    match pool.acquire(clock.now()) {
        Some(id) => Ok(Some(id)),
        None => {
            clock.sleep(std::time::Duration::from_millis(200)).await;
            Ok(None)
        }
    }
}

pub mod mock {
    //! A scripted adapter for tests: each credential has its own queue of
    //! outcomes to return, consumed in order. Exhausting the queue repeats
    //! the last outcome, matching how a flaky real upstream would not
    //! magically stop erroring once you stop scripting it.

    use std::collections::{HashMap, VecDeque};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Outcome {
        Ok(EngineValue),
        Err(AdapterError),
    }

    #[derive(Default)]
    pub struct ScriptedAdapter {
        scripts: Mutex<HashMap<CredentialId, VecDeque<Outcome>>>,
        pub calls: Mutex<Vec<CredentialId>>,
    }

    impl ScriptedAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, credential: CredentialId, outcomes: Vec<Outcome>) {
            self.scripts
                .lock()
                .insert(credential, outcomes.into_iter().collect());
        }
    }

    #[async_trait]
    impl UpstreamAdapter for ScriptedAdapter {
        async fn invoke(
            &self,
            credential: CredentialId,
            _operation: &Operation,
        ) -> Result<EngineValue, AdapterError> {
            self.calls.lock().push(credential);
            let mut scripts = self.scripts.lock();
            let queue = scripts.entry(credential).or_insert_with(VecDeque::new);
            let outcome = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap_or(Outcome::Ok(EngineValue::Null))
            };
            match outcome {
                Outcome::Ok(v) => Ok(v),
                Outcome::Err(e) => Err(e),
            }
        }
    }

    pub fn always_ok(value: EngineValue) -> Vec<Outcome> {
        vec![Outcome::Ok(value)]
    }
}

pub type SharedAdapter = Arc<dyn UpstreamAdapter>;

#[cfg(test)]
mod tests {
    use super::mock::{always_ok, Outcome, ScriptedAdapter};
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::AdapterErrorKind;
    use serde_json::json;

    fn op() -> Operation {
        Operation::Generate {
            model: "gemini-pro".into(),
            args: json!({}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quota_error_rotates_to_next_credential() {
        let pool = CredentialPool::new(2, 15);
        let clock = SystemClock;
        let config = EngineConfig::default();
        let adapter = ScriptedAdapter::new();
        adapter.script(
            0,
            vec![Outcome::Err(AdapterError::new(AdapterErrorKind::Quota, "exhausted"))],
        );
        adapter.script(1, always_ok(json!("ok")));

        // Simulates the dispatcher's step-7 record_use for the initial
        // credential, done once before the worker (and hence run_with_retry)
        // is even spawned.
        pool.record_use(0, clock.now());

        let result = run_with_retry(&adapter, &pool, &clock, &config, 0, &op()).await;
        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(adapter.calls.lock().as_slice(), &[0, 1]);

        let snap = pool.snapshot(clock.now());
        assert_eq!(snap[0].requests_last_minute, 1, "one use on the quota-errored credential");
        assert_eq!(snap[1].requests_last_minute, 1, "one use on the credential that served the request");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_retries_same_credential() {
        let pool = CredentialPool::new(1, 15);
        let clock = SystemClock;
        let config = EngineConfig::default();
        let adapter = ScriptedAdapter::new();
        adapter.script(
            0,
            vec![
                Outcome::Err(AdapterError::new(AdapterErrorKind::Transient, "503")),
                Outcome::Ok(json!("ok")),
            ],
        );

        pool.record_use(0, clock.now());
        let start = clock.now();
        let result = run_with_retry(&adapter, &pool, &clock, &config, 0, &op()).await;
        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(adapter.calls.lock().as_slice(), &[0, 0]);
        assert!(clock.now().duration_since(start) >= config.retry_backoff);

        let snap = pool.snapshot(clock.now());
        assert_eq!(
            snap[0].requests_last_minute, 2,
            "record_use is called once per invocation: the dispatcher's initial use plus the retry"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn all_quota_exhausted_fails_after_max_rotations() {
        let pool = CredentialPool::new(2, 15);
        let clock = SystemClock;
        let mut config = EngineConfig::default();
        config.max_rotations = 2;
        let adapter = ScriptedAdapter::new();
        for id in 0..2 {
            adapter.script(
                id,
                vec![Outcome::Err(AdapterError::new(AdapterErrorKind::Quota, "quota"))],
            );
        }

        pool.record_use(0, clock.now());
        let result = run_with_retry(&adapter, &pool, &clock, &config, 0, &op()).await;
        assert!(matches!(result, Err(EngineError::QuotaExhausted(_))));
        assert!(adapter.calls.lock().len() <= config.max_rotations as usize + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_fails_without_retry_or_rotation() {
        let pool = CredentialPool::new(2, 15);
        let clock = SystemClock;
        let config = EngineConfig::default();
        let adapter = ScriptedAdapter::new();
        adapter.script(
            0,
            vec![Outcome::Err(AdapterError::new(AdapterErrorKind::Fatal, "bad request"))],
        );

        let result = run_with_retry(&adapter, &pool, &clock, &config, 0, &op()).await;
        assert!(matches!(result, Err(EngineError::UpstreamFatal(_))));
        assert_eq!(adapter.calls.lock().len(), 1);
    }
}
