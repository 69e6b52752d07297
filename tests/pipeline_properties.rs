//! End-to-end properties of the session store and the orchestration loop.
//!
//! Store properties run against both backing stores; engine properties use
//! scripted agents and an in-process backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;
use stagehand::agent::{
    Decision, Digest, DigestRequest, Digester, DigesterChain, Plan, PlanRequest, Planner,
    PlannerChain, WorkUnit,
};
use stagehand::artifacts::ArtifactRegistry;
use stagehand::backend::{ExecutionBackend, ExecutionRequest, ExecutionResult, ExecutionStatus};
use stagehand::blob::{BlobStore, MemoryBlobStore};
use stagehand::engine::{
    EngineConfig, GeneratorStage, OrchestrationEngine, ProcessorStage, SubmitterStage, Termination,
    keys,
};
use stagehand::errors::{BackendError, StoreError};
use stagehand::session::{SessionStore, SessionStoreConfig};
use stagehand::store::{MemoryStore, SqliteStore, StateStore};
use stagehand_common::{ArtifactStatus, NewEvent, SessionKey, StateDelta, StateMap};

fn memory() -> Arc<dyn StateStore> {
    Arc::new(MemoryStore::new())
}

fn sqlite() -> Arc<dyn StateStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

fn key(session: &str) -> SessionKey {
    SessionKey::new("app", "alice", session)
}

// =============================================================================
// Session store properties
// =============================================================================

mod store_properties {
    use super::*;

    async fn duplicate_event_applies_once(store: Arc<dyn StateStore>) {
        let sessions = SessionStore::new(store);
        let k = key("s1");
        sessions.create(&k, StateMap::new()).await.unwrap();

        let event = NewEvent::new(k.clone(), "processor")
            .with_event_id("e1")
            .with_delta(StateDelta::new().set("counter", 1));
        let first = sessions.append_event(&k, event.clone()).await.unwrap();
        let second = sessions.append_event(&k, event).await.unwrap();

        assert_eq!(first.version, second.version);
        assert_eq!(sessions.events(&k).await.unwrap().len(), 1);
    }

    async fn temp_keys_never_persist(store: Arc<dyn StateStore>) {
        let sessions = SessionStore::new(store);
        let k = key("s1");
        sessions.create(&k, StateMap::new()).await.unwrap();

        let delta = StateDelta::new()
            .set("temp:stage", "delegated")
            .set("summary", "kept");
        sessions
            .append_event(&k, NewEvent::new(k.clone(), "generator").with_delta(delta))
            .await
            .unwrap();

        let record = sessions.get(&k).await.unwrap();
        assert_eq!(record.get_str("summary"), Some("kept"));
        assert!(record.state.keys().all(|key| !key.starts_with("temp:")));
        let events = sessions.events(&k).await.unwrap();
        assert!(events[0].state_delta.get("temp:stage").is_none());
    }

    async fn user_and_app_keys_are_shared(store: Arc<dyn StateStore>) {
        let sessions = SessionStore::new(store);
        let s1 = key("s1");
        let s2 = key("s2");
        let other_user = SessionKey::new("app", "bob", "s3");
        for k in [&s1, &s2, &other_user] {
            sessions.create(k, StateMap::new()).await.unwrap();
        }

        let delta = StateDelta::new().set("user:theme", "dark").set("app:model", "m1");
        sessions
            .append_event(&s1, NewEvent::new(s1.clone(), "user").with_delta(delta))
            .await
            .unwrap();

        let sibling = sessions.get(&s2).await.unwrap();
        assert_eq!(sibling.get_str("user:theme"), Some("dark"));
        assert_eq!(sibling.get_str("app:model"), Some("m1"));

        let stranger = sessions.get(&other_user).await.unwrap();
        assert_eq!(stranger.get_str("user:theme"), None);
        assert_eq!(stranger.get_str("app:model"), Some("m1"));
    }

    async fn concurrent_appends_all_land(store: Arc<dyn StateStore>) {
        let sessions = SessionStore::with_config(
            store,
            SessionStoreConfig {
                max_attempts: 50,
                backoff: Duration::from_millis(1),
            },
        );
        let k = key("s1");
        sessions.create(&k, StateMap::new()).await.unwrap();

        let tasks = (0..6).map(|i| {
            let sessions = sessions.clone();
            let k = k.clone();
            tokio::spawn(async move {
                let event = NewEvent::new(k.clone(), "writer")
                    .with_event_id(format!("e{i}"))
                    .with_delta(StateDelta::new().set(format!("field_{i}"), i));
                sessions.append_event(&k, event).await
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let record = sessions.get(&k).await.unwrap();
        assert_eq!(record.version, 7);
        for i in 0..6 {
            assert_eq!(record.get(&format!("field_{i}")), Some(&json!(i)));
        }
        let sequences: Vec<u64> = sessions
            .events(&k)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, (1..=6).collect::<Vec<_>>());
    }

    async fn deleted_session_is_not_found(store: Arc<dyn StateStore>) {
        let sessions = SessionStore::new(store);
        let k = key("s1");
        sessions.create(&k, StateMap::new()).await.unwrap();
        sessions.delete(&k).await.unwrap();

        assert!(sessions.get(&k).await.unwrap_err().is_not_found());
        let err = sessions
            .append_event(&k, NewEvent::new(k.clone(), "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_event_applies_once_in_memory() {
        duplicate_event_applies_once(memory()).await;
    }

    #[tokio::test]
    async fn duplicate_event_applies_once_in_sqlite() {
        duplicate_event_applies_once(sqlite()).await;
    }

    #[tokio::test]
    async fn temp_keys_never_persist_in_memory() {
        temp_keys_never_persist(memory()).await;
    }

    #[tokio::test]
    async fn temp_keys_never_persist_in_sqlite() {
        temp_keys_never_persist(sqlite()).await;
    }

    #[tokio::test]
    async fn user_and_app_keys_are_shared_in_memory() {
        user_and_app_keys_are_shared(memory()).await;
    }

    #[tokio::test]
    async fn user_and_app_keys_are_shared_in_sqlite() {
        user_and_app_keys_are_shared(sqlite()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_all_land_in_memory() {
        concurrent_appends_all_land(memory()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_all_land_in_sqlite() {
        concurrent_appends_all_land(sqlite()).await;
    }

    #[tokio::test]
    async fn deleted_session_is_not_found_in_memory() {
        deleted_session_is_not_found(memory()).await;
    }

    #[tokio::test]
    async fn deleted_session_is_not_found_in_sqlite() {
        deleted_session_is_not_found(sqlite()).await;
    }
}

// =============================================================================
// Orchestration loop
// =============================================================================

/// Hands out one work unit per call, or exits from `exit_at` on.
struct ScriptedPlanner {
    calls: AtomicU32,
    exit_at: Option<u32>,
}

impl ScriptedPlanner {
    fn working() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            exit_at: None,
        })
    }

    fn exiting_at(call: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            exit_at: Some(call),
        })
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.exit_at.is_some_and(|at| call >= at) {
            return Ok(Plan::Exit {
                reason: "goal reached".into(),
            });
        }
        Ok(Plan::Work(WorkUnit {
            kind: "shell".into(),
            instruction: format!("step {} after {:?}", request.iteration, request.summary),
            code: format!("echo step-{call}"),
            params: json!({}),
        }))
    }
}

/// Records every artifact it is asked to digest.
struct RecordingDigester {
    seen: Mutex<Vec<String>>,
    fail: bool,
    decision: Decision,
}

impl RecordingDigester {
    fn new(decision: Decision) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail: false,
            decision,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail: true,
            decision: Decision::Continue,
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Digester for RecordingDigester {
    async fn digest(&self, request: &DigestRequest) -> Result<Digest> {
        if self.fail {
            bail!("model unavailable");
        }
        self.seen.lock().unwrap().push(request.artifact_id.clone());
        Ok(Digest {
            summary: format!("saw {}", request.stdout.trim()),
            decision: self.decision,
            reason: Some("scripted".into()),
        })
    }
}

/// Echoes the work unit back as stdout, or fails submission outright.
struct EchoBackend {
    blobs: Arc<MemoryBlobStore>,
    broken: bool,
}

#[async_trait]
impl ExecutionBackend for EchoBackend {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        _timeout: Duration,
    ) -> Result<ExecutionResult, BackendError> {
        if self.broken {
            return Err(BackendError::SubmitFailed {
                run_id: request.run_id.clone(),
                message: "queue rejected the job".into(),
            });
        }
        let code = self
            .blobs
            .get(&request.work_ref)
            .await
            .map_err(BackendError::Blob)?
            .unwrap_or_default();
        let stdout_ref = self.blobs.put(&code).await.map_err(BackendError::Blob)?;
        let stderr_ref = self.blobs.put(b"").await.map_err(BackendError::Blob)?;
        Ok(ExecutionResult {
            status: ExecutionStatus::Succeeded,
            exit_code: Some(0),
            stdout_ref,
            stderr_ref,
            preview_stdout: String::from_utf8_lossy(&code).into_owned(),
            preview_stderr: String::new(),
            backend_run_id: format!("echo:{}", request.run_id),
        })
    }
}

struct Harness {
    sessions: SessionStore,
    artifacts: ArtifactRegistry,
    blobs: Arc<MemoryBlobStore>,
}

impl Harness {
    async fn new(store: Arc<dyn StateStore>) -> Self {
        let sessions = SessionStore::new(store.clone());
        sessions.create(&key("run"), StateMap::new()).await.unwrap();
        Self {
            sessions,
            artifacts: ArtifactRegistry::new(store),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    fn engine(
        &self,
        planner: Arc<dyn Planner>,
        digester: Arc<dyn Digester>,
        broken_backend: bool,
        max_iterations: u32,
    ) -> OrchestrationEngine {
        let blobs: Arc<dyn BlobStore> = self.blobs.clone();
        let backend = Arc::new(EchoBackend {
            blobs: self.blobs.clone(),
            broken: broken_backend,
        });
        OrchestrationEngine::new(
            self.sessions.clone(),
            self.artifacts.clone(),
            GeneratorStage::new(
                PlannerChain::new(vec![planner], 1),
                self.artifacts.clone(),
                blobs.clone(),
            ),
            SubmitterStage::new(backend, self.artifacts.clone(), Duration::from_secs(5)),
            ProcessorStage::new(DigesterChain::new(vec![digester], 1), blobs),
            EngineConfig { max_iterations },
        )
    }

    async fn statuses(&self) -> Vec<ArtifactStatus> {
        self.artifacts
            .list_for_session(&key("run").to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.status)
            .collect()
    }
}

mod engine_runs {
    use super::*;

    #[tokio::test]
    async fn reaching_max_iterations_is_success() {
        let h = Harness::new(memory()).await;
        let digester = RecordingDigester::new(Decision::Continue);
        let outcome = h
            .engine(ScriptedPlanner::working(), digester.clone(), false, 2)
            .run(&key("run"))
            .await;

        assert_eq!(outcome.termination, Termination::Success);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(digester.seen().len(), 2);
        assert_eq!(
            h.statuses().await,
            vec![ArtifactStatus::Consumed, ArtifactStatus::Consumed]
        );

        let record = h.sessions.get(&key("run")).await.unwrap();
        assert_eq!(record.get(keys::ITERATIONS_COMPLETED), Some(&json!(2)));
        assert_eq!(record.get_str(keys::SUMMARY), Some("saw echo step-2"));
        assert!(record.state.keys().all(|k| !k.starts_with("temp:")));
        // One event per stage per iteration.
        assert_eq!(h.sessions.events(&key("run")).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn planner_exit_is_exit_requested() {
        let h = Harness::new(memory()).await;
        let outcome = h
            .engine(
                ScriptedPlanner::exiting_at(2),
                RecordingDigester::new(Decision::Continue),
                false,
                5,
            )
            .run(&key("run"))
            .await;

        assert_eq!(
            outcome.termination,
            Termination::ExitRequested {
                reason: "goal reached".into()
            }
        );
        assert_eq!(outcome.iterations, 2);
        assert_eq!(h.statuses().await, vec![ArtifactStatus::Consumed]);
    }

    #[tokio::test]
    async fn processor_exit_stops_after_commit() {
        let h = Harness::new(sqlite()).await;
        let outcome = h
            .engine(
                ScriptedPlanner::working(),
                RecordingDigester::new(Decision::Exit),
                false,
                5,
            )
            .run(&key("run"))
            .await;

        assert_eq!(outcome.termination.as_str(), "exit_requested");
        assert_eq!(outcome.iterations, 1);
        let record = h.sessions.get(&key("run")).await.unwrap();
        assert_eq!(record.get(keys::ITERATIONS_COMPLETED), Some(&json!(1)));
        assert_eq!(h.statuses().await, vec![ArtifactStatus::Consumed]);
    }

    #[tokio::test]
    async fn escalation_is_fatal() {
        let h = Harness::new(memory()).await;
        let outcome = h
            .engine(
                ScriptedPlanner::working(),
                RecordingDigester::new(Decision::Escalate),
                false,
                5,
            )
            .run(&key("run"))
            .await;

        match outcome.termination {
            Termination::FatalError { message } => assert!(message.starts_with("escalated")),
            other => panic!("Expected FatalError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backend_error_fails_run_and_artifact() {
        let h = Harness::new(sqlite()).await;
        let outcome = h
            .engine(
                ScriptedPlanner::working(),
                RecordingDigester::new(Decision::Continue),
                true,
                3,
            )
            .run(&key("run"))
            .await;

        let Termination::FatalError { message } = &outcome.termination else {
            panic!("Expected FatalError, got {:?}", outcome.termination);
        };
        assert!(!message.is_empty());
        assert!(message.contains("queue rejected the job"));
        assert_eq!(outcome.iterations, 1);

        let artifacts = h
            .artifacts
            .list_for_session(&key("run").to_string())
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].status, ArtifactStatus::Failed);
        assert!(artifacts[0].error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn stale_artifact_is_not_reprocessed_after_crash() {
        let h = Harness::new(sqlite()).await;

        // First run executes A, then dies in the processor.
        let crashed = h
            .engine(ScriptedPlanner::working(), RecordingDigester::failing(), false, 3)
            .run(&key("run"))
            .await;
        assert!(crashed.termination.is_fatal());
        let first = h
            .artifacts
            .list_for_session(&key("run").to_string())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        let stale_id = first[0].artifact_id.clone();
        assert_eq!(first[0].status, ArtifactStatus::Completed);

        // A fresh run generates B and must digest only B.
        let digester = RecordingDigester::new(Decision::Continue);
        let resumed = h
            .engine(ScriptedPlanner::working(), digester.clone(), false, 1)
            .run(&key("run"))
            .await;
        assert_eq!(resumed.termination, Termination::Success);

        let seen = digester.seen();
        assert_eq!(seen.len(), 1);
        assert_ne!(seen[0], stale_id);
        assert_eq!(h.artifacts.get(&stale_id).await.unwrap().status, ArtifactStatus::Completed);
        assert_eq!(h.artifacts.get(&seen[0]).await.unwrap().status, ArtifactStatus::Consumed);

        let record = h.sessions.get(&key("run")).await.unwrap();
        assert_eq!(record.get_str(keys::LAST_ARTIFACT_ID), Some(seen[0].as_str()));
    }

    #[tokio::test]
    async fn missing_session_is_fatal() {
        let h = Harness::new(memory()).await;
        let outcome = h
            .engine(
                ScriptedPlanner::working(),
                RecordingDigester::new(Decision::Continue),
                false,
                2,
            )
            .run(&key("nope"))
            .await;

        assert!(outcome.termination.is_fatal());
        assert!(h.statuses().await.is_empty());
    }
}
