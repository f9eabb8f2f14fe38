mod common;

use chrono::Utc;
use tempfile::tempdir;

use common::{
    build, next_notification, next_review, test_config, wait_for_status, wait_until,
    ScriptedExecutor,
};
use idp_orchestrator::infrastructure::apply_transition;
use idp_orchestrator::models::{RequestRecord, TraceOutcome};
use idp_orchestrator::{
    Config, PermitStore, RecoveryReport, RequestStatus, ReviewOutcome, Stage, StateStore,
};

fn completed_stages(record: &RequestRecord) -> Vec<Stage> {
    record
        .trace
        .iter()
        .filter(|entry| entry.outcome.completes_stage())
        .map(|entry| entry.stage)
        .collect()
}

#[tokio::test]
async fn test_restart_mid_pipeline_matches_uninterrupted_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    // 第一次运行停在 Extract
    let first = build(
        test_config(),
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::hanging_at(Stage::Extract),
    );
    first.app.start().unwrap();
    first
        .app
        .submit(Some("doc-1".into()), "a.pdf".into())
        .unwrap();
    wait_until(&first.app, "doc-1", |r| {
        r.status == RequestStatus::Running && r.current_stage == Some(Stage::Extract)
    })
    .await;
    first.app.shutdown().await;

    // 从同一个快照重启
    let mut second = build(
        test_config(),
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::new(),
    );
    let report = second.app.start().unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            relaunched: 1,
            replayed: 0,
            suspended: 0,
        }
    );
    let resumed = wait_for_status(&second.app, "doc-1", RequestStatus::Succeeded).await;
    assert_eq!(second.executor.calls_for("doc-1", Stage::Ingest), 0);
    assert_eq!(second.executor.calls_for("doc-1", Stage::Extract), 1);
    next_notification(&mut second.notifications).await;
    assert_eq!(second.app.stats().unwrap().permits.available_permits, 2);
    second.app.shutdown().await;

    // 对照：不中断的运行
    let baseline = build(test_config(), StateStore::in_memory(), ScriptedExecutor::new());
    baseline.app.start().unwrap();
    baseline
        .app
        .submit(Some("doc-1".into()), "a.pdf".into())
        .unwrap();
    let expected = wait_for_status(&baseline.app, "doc-1", RequestStatus::Succeeded).await;
    baseline.app.shutdown().await;

    assert_eq!(resumed.document_ref, expected.document_ref);
    assert_eq!(completed_stages(&resumed), completed_stages(&expected));
    assert_eq!(resumed.failure, expected.failure);
}

#[tokio::test]
async fn test_queued_request_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    // 未启动后台任务，只入队
    let first = build(
        test_config(),
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::new(),
    );
    first
        .app
        .submit(Some("doc-1".into()), "a.pdf".into())
        .unwrap();
    drop(first);

    let second = build(
        test_config(),
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::new(),
    );
    assert_eq!(second.app.list(Some(RequestStatus::Queued)).len(), 1);
    second.app.start().unwrap();
    wait_for_status(&second.app, "doc-1", RequestStatus::Succeeded).await;
    assert_eq!(second.app.stats().unwrap().queued_messages, 0);
    second.app.shutdown().await;
}

#[tokio::test]
async fn test_suspended_request_can_resume_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    let executor = ScriptedExecutor::new();
    executor.low_confidence("doc-1");
    let first = build(test_config(), StateStore::open(&path).unwrap(), executor);
    first.app.start().unwrap();
    first
        .app
        .submit(Some("doc-1".into()), "a.pdf".into())
        .unwrap();
    let suspended = wait_for_status(&first.app, "doc-1", RequestStatus::Suspended).await;
    first.app.shutdown().await;

    let mut second = build(
        test_config(),
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::new(),
    );
    let report = second.app.start().unwrap();
    assert_eq!(report.suspended, 1);
    assert_eq!(report.relaunched, 0);
    assert_eq!(second.app.stats().unwrap().permits.available_permits, 1);

    // 重启后重新投递审核通知
    let handle = suspended.resumption_handle.unwrap();
    assert_eq!(next_review(&mut second.reviews).await.resumption_handle, handle);
    assert!(second
        .app
        .resume(&handle, ReviewOutcome::Approved, None)
        .unwrap());
    let record = wait_for_status(&second.app, "doc-1", RequestStatus::Succeeded).await;
    assert!(record
        .trace
        .iter()
        .any(|entry| entry.stage == Stage::Review && entry.outcome == TraceOutcome::Approved));
    assert_eq!(second.executor.calls_for("doc-1", Stage::Assess), 0);
    second.app.shutdown().await;
}

#[tokio::test]
async fn test_terminal_request_with_held_permit_is_replayed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = Config {
        max_permits: 3,
        ..test_config()
    };

    // 模拟"终态已写入，但许可释放前崩溃"
    {
        let store = StateStore::open(&path).unwrap();
        store.ensure_initialized(&config.counter_id, 3).unwrap();
        store
            .transact(|tx| {
                tx.insert_request(RequestRecord::new("doc-1", "a.pdf", Utc::now()));
                Ok(())
            })
            .unwrap();
        store.acquire(&config.counter_id, "doc-1").unwrap();
        store
            .update_request("doc-1", |r| {
                let now = Utc::now();
                apply_transition(r, RequestStatus::Admitted, now)?;
                apply_transition(r, RequestStatus::Running, now)?;
                apply_transition(r, RequestStatus::Succeeded, now)
            })
            .unwrap();
        assert_eq!(store.counter(&config.counter_id).unwrap().available_permits, 2);
    }

    let mut t = build(
        config.clone(),
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::new(),
    );
    let report = t.app.start().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.relaunched, 0);

    let notification = next_notification(&mut t.notifications).await;
    assert_eq!(notification.request_id, "doc-1");
    assert_eq!(notification.final_status, RequestStatus::Succeeded);
    assert!(!t.app.get("doc-1").unwrap().permit_held);
    assert_eq!(t.app.stats().unwrap().permits.available_permits, 3);
    assert!(t.app.completion("doc-1").is_some());
    t.app.shutdown().await;

    // 收尾已完成，再次重启不再补发
    let again = build(
        config,
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::new(),
    );
    let report = again.app.start().unwrap();
    assert_eq!(report.replayed, 0);
    again.app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_with_admitted_and_queued_requests_drives_each_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = Config {
        admission_workers: 4,
        max_permits: 4,
        ..test_config()
    };

    // 上次运行：两个请求已准入但尚未驱动，另有一批仍在排队
    {
        let store = StateStore::open(&path).unwrap();
        store.ensure_initialized(&config.counter_id, 4).unwrap();
        store
            .transact(|tx| {
                for id in ["admitted-1", "admitted-2"] {
                    let now = Utc::now();
                    let mut record = RequestRecord::new(id, "a.pdf", now);
                    apply_transition(&mut record, RequestStatus::Admitted, now)?;
                    tx.insert_request(record);
                }
                Ok(())
            })
            .unwrap();
        store.acquire(&config.counter_id, "admitted-1").unwrap();
        store.acquire(&config.counter_id, "admitted-2").unwrap();
    }
    let queued: Vec<String> = (0..10).map(|i| format!("queued-{}", i)).collect();
    {
        let t = build(
            config.clone(),
            StateStore::open(&path).unwrap(),
            ScriptedExecutor::new(),
        );
        for id in &queued {
            t.app.submit(Some(id.clone()), "b.pdf".into()).unwrap();
        }
    }

    let t = build(
        config,
        StateStore::open(&path).unwrap(),
        ScriptedExecutor::with_delay(std::time::Duration::from_millis(1)),
    );
    let report = t.app.start().unwrap();
    assert_eq!(report.relaunched, 2);

    let all: Vec<String> = ["admitted-1", "admitted-2"]
        .iter()
        .map(|s| s.to_string())
        .chain(queued.iter().cloned())
        .collect();
    common::wait_all_settled(&t.app, &all).await;
    for id in &all {
        assert_eq!(t.app.get(id).unwrap().status, RequestStatus::Succeeded);
        assert_eq!(t.executor.calls_for(id, Stage::Ingest), 1, "{}", id);
    }
    assert_eq!(t.app.stats().unwrap().permits.available_permits, 4);
    t.app.shutdown().await;
}
