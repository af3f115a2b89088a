//! End-to-end scheduler tests with mock stage workers.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use dtr::{Dtr, DtrStatus, ErrorKind, ErrorLocation, PlainEndpoint};
use staging_engine::test_utils::{CollectingSink, EchoWorker, ScriptedFailure, init_tracing};
use staging_engine::{Scheduler, ShareType, StageWorkers, TransferSharesConf};

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn plain_dtr(job: &str, owner: &str, name: &str) -> Dtr {
    Dtr::new(
        Box::new(PlainEndpoint::new(url(&format!(
            "gsiftp://se.example.org/data/{name}"
        )))),
        Box::new(PlainEndpoint::new(url(&format!(
            "gsiftp://dest.example.org/data/{name}"
        )))),
        job,
        owner,
    )
}

fn stageable_dtr(job: &str, owner: &str, name: &str) -> Dtr {
    Dtr::new(
        Box::new(PlainEndpoint::new(url(&format!("srm://tape.example.org/{name}"))).stageable()),
        Box::new(PlainEndpoint::new(url(&format!(
            "gsiftp://dest.example.org/data/{name}"
        )))),
        job,
        owner,
    )
}

struct Harness {
    scheduler: Scheduler,
    pre: Arc<EchoWorker>,
    delivery: Arc<EchoWorker>,
    sink: Arc<CollectingSink>,
}

fn harness(configure: impl FnOnce(&Scheduler, staging_engine::SchedulerFeed) -> (Arc<EchoWorker>, Arc<EchoWorker>)) -> Harness {
    init_tracing();
    let scheduler = Scheduler::new();
    let feed = scheduler.feed();
    let (pre, delivery) = configure(&scheduler, feed.clone());
    let post = Arc::new(EchoWorker::new(feed));
    let sink = Arc::new(CollectingSink::new());
    scheduler.set_stage_workers(StageWorkers {
        pre_processor: pre.clone(),
        post_processor: post,
        delivery: delivery.clone(),
        generator: sink.clone(),
    });
    Harness {
        scheduler,
        pre,
        delivery,
        sink,
    }
}

fn simple_harness() -> Harness {
    harness(|_, feed| {
        (
            Arc::new(EchoWorker::new(feed.clone())),
            Arc::new(EchoWorker::new(feed)),
        )
    })
}

#[tokio::test]
async fn plain_request_completes_with_the_expected_trail() {
    let h = simple_harness();
    assert!(h.scheduler.start());

    h.scheduler.receive(plain_dtr("job1", "alice", "f1"));
    assert!(h.sink.wait_for(1, Duration::from_secs(5)).await);
    h.scheduler.stop().await;

    let finished = h.sink.drain();
    assert_eq!(finished.len(), 1);
    let dtr = &finished[0];
    assert_eq!(dtr.status(), DtrStatus::Done);
    assert_eq!(
        dtr.status_trail(),
        &[
            DtrStatus::New,
            DtrStatus::CacheChecked,
            DtrStatus::Resolved,
            DtrStatus::QueryReplica,
            DtrStatus::QueryingReplica,
            DtrStatus::ReplicaQueried,
            DtrStatus::PreCleaned,
            DtrStatus::StagedPrepared,
            DtrStatus::Transfer,
            DtrStatus::Transferring,
            DtrStatus::Transferred,
            DtrStatus::RequestReleased,
            DtrStatus::ReplicaRegistered,
            DtrStatus::CacheProcessed,
            DtrStatus::Done,
        ]
    );
}

#[tokio::test]
async fn requests_received_before_start_run_once_started() {
    let h = simple_harness();
    h.scheduler.receive(plain_dtr("job1", "alice", "early"));

    assert!(h.scheduler.start());
    assert!(h.sink.wait_for(1, Duration::from_secs(5)).await);
    h.scheduler.stop().await;

    let finished = h.sink.drain();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status(), DtrStatus::Done);
}

#[tokio::test]
async fn every_received_request_is_returned_exactly_once() {
    let h = simple_harness();
    assert!(h.scheduler.start());

    let mut ids = Vec::new();
    for i in 0..20 {
        let dtr = plain_dtr(&format!("job{i}"), "alice", &format!("f{i}"));
        ids.push(dtr.id().to_owned());
        h.scheduler.receive(dtr);
    }
    assert!(h.sink.wait_for(20, Duration::from_secs(10)).await);
    h.scheduler.stop().await;

    let mut finished: Vec<String> = h.sink.drain().iter().map(|d| d.id().to_owned()).collect();
    finished.sort();
    ids.sort();
    assert_eq!(finished, ids);
}

#[tokio::test]
async fn cancellation_during_staging_ends_cancelled_not_error() {
    let h = harness(|_, feed| {
        (
            // slow pre-processor keeps the request in active staging states
            Arc::new(EchoWorker::new(feed.clone()).with_delay(Duration::from_millis(300))),
            Arc::new(EchoWorker::new(feed)),
        )
    });
    assert!(h.scheduler.start());

    h.scheduler.receive(stageable_dtr("job1", "alice", "f1"));
    // let the request get into the pre-processing pipeline, then cancel
    tokio::time::sleep(Duration::from_millis(450)).await;
    h.scheduler.cancel_dtrs("job1");

    assert!(h.sink.wait_for(1, Duration::from_secs(10)).await);
    h.scheduler.stop().await;

    let finished = h.sink.drain();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status(), DtrStatus::Cancelled);
    assert!(!finished[0].status_trail().contains(&DtrStatus::Error));
}

#[tokio::test]
async fn starved_share_rides_an_emergency_slot() {
    let h = harness(|scheduler, feed| {
        scheduler.set_slots(20, 20, 1, 1);
        let mut conf = TransferSharesConf::new(ShareType::User);
        conf.set_reference_share("alice", 60);
        conf.set_reference_share("bob", 40);
        scheduler.set_transfer_shares_conf(conf);
        (
            Arc::new(EchoWorker::new(feed.clone())),
            Arc::new(EchoWorker::new(feed).with_delay(Duration::from_millis(300))),
        )
    });
    assert!(h.scheduler.start());

    h.scheduler.receive(plain_dtr("job-a", "alice", "a1"));
    h.scheduler.receive(plain_dtr("job-a", "alice", "a2"));
    h.scheduler.receive(plain_dtr("job-b", "bob", "b1"));

    assert!(h.sink.wait_for(3, Duration::from_secs(10)).await);
    h.scheduler.stop().await;

    let finished = h.sink.drain();
    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|d| d.status() == DtrStatus::Done));
    // one hard delivery slot plus bob's emergency grant ran concurrently
    assert_eq!(h.delivery.peak_concurrency(), 2);
}

#[tokio::test]
async fn one_share_never_exceeds_the_hard_slot_limit() {
    let h = harness(|scheduler, feed| {
        scheduler.set_slots(20, 20, 2, 2);
        (
            Arc::new(EchoWorker::new(feed.clone())),
            Arc::new(EchoWorker::new(feed).with_delay(Duration::from_millis(150))),
        )
    });
    assert!(h.scheduler.start());

    for i in 0..6 {
        h.scheduler.receive(plain_dtr("job1", "alice", &format!("f{i}")));
    }
    assert!(h.sink.wait_for(6, Duration::from_secs(10)).await);
    h.scheduler.stop().await;

    assert_eq!(h.sink.drain().len(), 6);
    // a single share gets no emergency slots beyond the stage limit
    assert!(h.delivery.peak_concurrency() <= 2);
}

#[tokio::test]
async fn source_failures_exhaust_retries_into_error() {
    let h = harness(|_, feed| {
        (
            Arc::new(EchoWorker::new(feed.clone()).fail_on(
                DtrStatus::QueryingReplica,
                ScriptedFailure {
                    kind: ErrorKind::Permanent,
                    location: ErrorLocation::Source,
                    message: "source file does not exist".into(),
                    times: 0,
                },
            )),
            Arc::new(EchoWorker::new(feed)),
        )
    });
    assert!(h.scheduler.start());

    h.scheduler.receive(plain_dtr("job1", "alice", "missing"));
    assert!(h.sink.wait_for(1, Duration::from_secs(5)).await);
    h.scheduler.stop().await;

    let finished = h.sink.drain();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status(), DtrStatus::Error);
    let err = finished[0].error().expect("terminal error kept on the DTR");
    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.location, ErrorLocation::Source);
}

#[tokio::test]
async fn stop_drains_all_inflight_requests() {
    let h = harness(|_, feed| {
        (
            Arc::new(EchoWorker::new(feed.clone())),
            Arc::new(EchoWorker::new(feed).with_delay(Duration::from_millis(150))),
        )
    });
    assert!(h.scheduler.start());

    for i in 0..5 {
        h.scheduler.receive(plain_dtr(&format!("job{i}"), "alice", &format!("f{i}")));
    }
    assert!(h.scheduler.stop().await);

    // stop blocks until every request reached a final state
    let finished = h.sink.drain();
    assert_eq!(finished.len(), 5);
    assert!(finished
        .iter()
        .all(|d| matches!(d.status(), DtrStatus::Done | DtrStatus::Cancelled)));
    let _ = &h.pre;
}

#[tokio::test]
async fn state_dump_is_written_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("dtr-state.log");
    let h = simple_harness();
    h.scheduler.set_dump_location(&dump);
    assert!(h.scheduler.start());

    h.scheduler.receive(plain_dtr("job1", "alice", "f1"));
    assert!(h.sink.wait_for(1, Duration::from_secs(5)).await);
    h.scheduler.stop().await;

    assert!(dump.exists());
}
