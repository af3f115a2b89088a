//! Admission control.
//!
//! Once per loop pass every queued state is revised: the queue is sorted
//! by priority, cancelled requests are routed to cleanup, long-waiting
//! requests are aged, a fresh share accounting is built from queue and
//! active snapshots, and the head of the queue is started until the
//! stage's slots (plus emergency allowance) are spent.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::RngExt;
use rand::rngs::StdRng;
use tracing::info;
use url::Url;

use dtr::{Dtr, DtrStatus, Stage, UrlMap};

use crate::registry::DtrList;
use crate::scheduler::transitions::{self, TransitionCtx};
use crate::shares::{TransferShares, TransferSharesConf};
use crate::worker::StageWorkers;

/// Priority aging: +1 priority with a fresh timeout of this length.
const AGING_REFRESH: Duration = Duration::from_secs(300);

pub(crate) struct QueueCtx<'a> {
    pub registry: &'a DtrList,
    pub workers: &'a StageWorkers,
    pub shares_conf: &'a TransferSharesConf,
    pub url_map: &'a UrlMap,
    pub preferred_pattern: &'a str,
    pub pre_slots: usize,
    pub post_slots: usize,
    pub delivery_slots: usize,
    pub emergency_slots: usize,
    pub delivery_services: &'a [Url],
    pub rng: &'a mut StdRng,
}

pub(crate) fn revise_queues(ctx: &mut QueueCtx<'_>) {
    for state in DtrStatus::TO_PROCESS_STATES {
        revise_state(ctx, state);
    }
}

fn revise_state(ctx: &mut QueueCtx<'_>, state: DtrStatus) {
    let Some(active_state) = state.active_counterpart() else {
        return;
    };
    let Some(stage) = state.next_stage() else {
        return;
    };

    let mut queued = ctx.registry.summaries_with_status(state);
    let active = ctx.registry.summaries_with_status(active_state);
    if queued.is_empty() && active.is_empty() {
        return;
    }

    // stable sort keeps arrival order within a priority
    queued.sort_by(|a, b| b.priority.cmp(&a.priority));
    let highest_priority = queued.first().map(|s| s.priority).unwrap_or(0);

    let tctx = TransitionCtx {
        registry: ctx.registry,
        url_map: ctx.url_map,
        preferred_pattern: ctx.preferred_pattern,
        delivery_slots: ctx.delivery_slots,
    };

    let mut shares = TransferShares::new(ctx.shares_conf.clone());
    let now = Instant::now();

    // Pass over the queue: divert cancelled requests, age the starved.
    // Post-processor queues keep their cancelled requests; there the
    // cancel flag only means extra cleanup, not a broken workflow.
    let mut kept = Vec::with_capacity(queued.len());
    for summary in queued {
        if summary.cancel_requested
            && matches!(stage, Stage::PreProcessor | Stage::Delivery)
        {
            if let Some(dtr) = ctx.registry.take(&summary.id) {
                transitions::dispatch(dtr, &tctx, ctx.workers.generator.as_ref());
            }
            continue;
        }
        // Requests stuck behind higher priorities creep up by one point
        // per refresh period. A queue of aged low-priority requests must
        // never outrank genuinely high-priority arrivals, hence the cap
        // at the current queue maximum.
        if summary.timeout <= now && summary.priority < highest_priority {
            ctx.registry
                .boost_priority(&summary.id, summary.priority + 1, AGING_REFRESH);
        }
        shares.increase_transfer_share(&summary.share);
        kept.push(summary);
    }

    // Active requests consume their share's slots. A cancelled active
    // transfer is aborted in delivery right away and stops counting.
    let mut counted_active = Vec::with_capacity(active.len());
    for summary in active {
        if active_state == DtrStatus::Transferring && summary.cancel_requested {
            info!(dtr = %summary.id, "cancelling active transfer");
            ctx.workers.delivery.cancel_dtr(&summary.id);
            continue;
        }
        shares.increase_transfer_share(&summary.share);
        counted_active.push(summary);
    }

    if kept.is_empty() {
        return;
    }

    let slot_limit = match stage {
        Stage::PreProcessor => ctx.pre_slots,
        Stage::Delivery => ctx.delivery_slots,
        Stage::PostProcessor => ctx.post_slots,
    };
    shares.calculate_shares(slot_limit);

    let mut running = counted_active.len();
    let mut active_shares: HashSet<String> = HashSet::new();
    for summary in &counted_active {
        shares.decrease_number_of_slots(&summary.share);
        active_shares.insert(summary.share.clone());
    }
    let total_shares = shares.active_shares().len();

    for summary in kept {
        // Nothing left to grant once the limit is reached and every
        // share with demand already holds a slot.
        if running >= slot_limit && total_shares == active_shares.len() {
            break;
        }
        let mut can_start = shares.can_start(&summary.share);
        // Beyond the limit only emergency grants remain, one per share
        // that has nothing active in this stage yet.
        if running >= slot_limit && active_shares.contains(&summary.share) {
            can_start = false;
        }
        if can_start {
            let Some(mut request) = ctx.registry.take(&summary.id) else {
                continue;
            };
            if stage == Stage::Delivery && !ctx.delivery_services.is_empty() {
                select_delivery_endpoint(&mut request, ctx.delivery_services, ctx.rng);
            }
            shares.decrease_number_of_slots(&summary.share);
            start_request(ctx, request, state, active_state, stage);
            running += 1;
            active_shares.insert(summary.share);
        }
        // Hard limit with all emergency slots used.
        if running == slot_limit + ctx.emergency_slots {
            break;
        }
    }
}

fn start_request(
    ctx: &QueueCtx<'_>,
    mut request: Dtr,
    state: DtrStatus,
    active_state: DtrStatus,
    stage: Stage,
) {
    if state == DtrStatus::CheckCache {
        ctx.registry.caching_started(&request);
    }
    request.set_status(active_state);
    ctx.registry.note_away(&request);
    match stage {
        Stage::PreProcessor => ctx.workers.pre_processor.push(request),
        Stage::Delivery => ctx.workers.delivery.push(request),
        Stage::PostProcessor => ctx.workers.post_processor.push(request),
    }
}

/// Pick the delivery service for a transfer: stick with the previous one
/// normally, but a retry with several services configured gets a
/// different one. The search is bounded in case every configured service
/// is the same URL.
fn select_delivery_endpoint(request: &mut Dtr, services: &[Url], rng: &mut StdRng) {
    let previous = request.delivery_endpoint().clone();
    let endpoint = if request.tries_left() < request.initial_tries() && services.len() > 1 {
        let mut endpoint = previous.clone();
        let mut attempts = 0;
        while endpoint == previous && attempts < services.len() * 10 {
            endpoint = services[rng.random_range(0..services.len())].clone();
            attempts += 1;
        }
        endpoint
    } else {
        services[rng.random_range(0..services.len())].clone()
    };
    request.set_delivery_endpoint(endpoint);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shares::ShareType;
    use crate::test_utils::{CollectingSink, RecordingDelivery, RecordingWorker};
    use crate::worker::StageWorkers;
    use dtr::{PlainEndpoint, local_delivery};
    use rand::SeedableRng;
    use std::sync::Arc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn transfer_dtr(owner: &str, priority: u32) -> Dtr {
        let mut dtr = Dtr::new(
            Box::new(PlainEndpoint::new(url(&format!(
                "gsiftp://se.example.org/{owner}/{priority}"
            )))),
            Box::new(PlainEndpoint::new(url(&format!(
                "gsiftp://b.example.org/{owner}/{priority}"
            )))),
            format!("job-{owner}"),
            owner,
        )
        .with_priority(priority);
        dtr.set_transfer_share(owner);
        dtr.set_status(DtrStatus::Transfer);
        dtr
    }

    struct Fixture {
        registry: Arc<DtrList>,
        workers: StageWorkers,
        delivery: Arc<RecordingDelivery>,
        sink: Arc<CollectingSink>,
        services: Vec<Url>,
        rng: StdRng,
    }

    impl Fixture {
        fn new() -> Self {
            let delivery = Arc::new(RecordingDelivery::new());
            let sink = Arc::new(CollectingSink::new());
            let workers = StageWorkers {
                pre_processor: Arc::new(RecordingWorker::new()),
                post_processor: Arc::new(RecordingWorker::new()),
                delivery: delivery.clone(),
                generator: sink.clone(),
            };
            Self {
                registry: Arc::new(DtrList::new()),
                workers,
                delivery,
                sink,
                services: vec![local_delivery()],
                rng: StdRng::seed_from_u64(7),
            }
        }

        fn revise(&mut self, conf: &TransferSharesConf, delivery_slots: usize, emergency: usize) {
            let map = UrlMap::new();
            let mut ctx = QueueCtx {
                registry: &self.registry,
                workers: &self.workers,
                shares_conf: conf,
                url_map: &map,
                preferred_pattern: "",
                pre_slots: 20,
                post_slots: 20,
                delivery_slots,
                emergency_slots: emergency,
                delivery_services: &self.services,
                rng: &mut self.rng,
            };
            revise_queues(&mut ctx);
        }
    }

    #[test]
    fn starved_share_gets_an_emergency_slot() {
        let mut fixture = Fixture::new();
        let conf = TransferSharesConf::new(ShareType::User);
        fixture.registry.add(transfer_dtr("alice", 80));
        fixture.registry.add(transfer_dtr("alice", 80));
        fixture.registry.add(transfer_dtr("bob", 50));

        fixture.revise(&conf, 1, 2);

        let transferring = fixture.registry.summaries_with_status(DtrStatus::Transferring);
        let shares: HashSet<&str> = transferring.iter().map(|s| s.share.as_str()).collect();
        // one hard slot went to alice, bob got an emergency grant
        assert_eq!(transferring.len(), 2);
        assert_eq!(shares, HashSet::from(["alice", "bob"]));
        assert_eq!(fixture.delivery.started(), 2);
    }

    #[test]
    fn slot_bound_is_never_exceeded() {
        let mut fixture = Fixture::new();
        let conf = TransferSharesConf::new(ShareType::User);
        for i in 0..10 {
            fixture.registry.add(transfer_dtr("alice", 40 + i));
        }
        fixture.revise(&conf, 2, 1);
        assert_eq!(
            fixture.registry.summaries_with_status(DtrStatus::Transferring).len(),
            2
        );
        // a second pass with everything already active starts nothing new
        fixture.revise(&conf, 2, 1);
        assert_eq!(
            fixture.registry.summaries_with_status(DtrStatus::Transferring).len(),
            2
        );
    }

    #[test]
    fn many_starved_shares_stop_at_the_hard_limit() {
        let mut fixture = Fixture::new();
        let conf = TransferSharesConf::new(ShareType::User);
        for i in 0..6 {
            fixture.registry.add(transfer_dtr(&format!("share{i}"), 50));
        }
        fixture.revise(&conf, 2, 2);
        // 2 hard slots + 2 emergency grants
        assert_eq!(
            fixture.registry.summaries_with_status(DtrStatus::Transferring).len(),
            4
        );
    }

    #[test]
    fn higher_priority_requests_start_first() {
        let mut fixture = Fixture::new();
        let conf = TransferSharesConf::new(ShareType::User);
        let low = transfer_dtr("alice", 20);
        let low_id = low.id().to_owned();
        let high = transfer_dtr("alice", 90);
        let high_id = high.id().to_owned();
        fixture.registry.add(low);
        fixture.registry.add(high);

        fixture.revise(&conf, 1, 0);

        let transferring = fixture.registry.summaries_with_status(DtrStatus::Transferring);
        assert_eq!(transferring.len(), 1);
        assert_eq!(transferring[0].id, high_id);
        assert_eq!(
            fixture.registry.summaries_with_status(DtrStatus::Transfer)[0].id,
            low_id
        );
    }

    #[test]
    fn cancelled_queued_transfer_is_diverted_to_cleanup() {
        let mut fixture = Fixture::new();
        let conf = TransferSharesConf::new(ShareType::User);
        let request = transfer_dtr("alice", 50);
        let id = request.id().to_owned();
        fixture.registry.add(request);
        fixture.registry.cancel_job("job-alice");

        fixture.revise(&conf, 5, 2);

        // never handed to delivery; went through the cancellation overlay
        assert_eq!(fixture.delivery.started(), 0);
        assert!(fixture.registry.take(&id).is_none());
        let returned = fixture.sink.drain();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].status(), DtrStatus::Cancelled);
    }

    #[test]
    fn cancelled_active_transfer_is_cancelled_in_delivery() {
        let mut fixture = Fixture::new();
        let conf = TransferSharesConf::new(ShareType::User);
        let mut request = transfer_dtr("alice", 50);
        request.set_status(DtrStatus::Transferring);
        let id = request.id().to_owned();
        fixture.registry.add(request);
        let away = fixture.registry.take(&id).unwrap();
        fixture.registry.note_away(&away);
        drop(away);
        fixture.registry.cancel_job("job-alice");

        fixture.revise(&conf, 5, 2);
        assert_eq!(fixture.delivery.cancelled(), vec![id]);
    }

    #[test]
    fn retry_picks_a_different_delivery_service() {
        let services = vec![
            url("https://delivery1.example.org/"),
            url("https://delivery2.example.org/"),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut request = transfer_dtr("alice", 50).with_tries(3);
        request.set_delivery_endpoint(services[0].clone());
        request.decrease_tries_left();

        select_delivery_endpoint(&mut request, &services, &mut rng);
        assert_eq!(request.delivery_endpoint(), &services[1]);
    }

    #[test]
    fn aging_boosts_timed_out_requests_below_the_maximum() {
        let mut fixture = Fixture::new();
        let conf = TransferSharesConf::new(ShareType::User);

        // the sole slot is already occupied by an active transfer
        let active = transfer_dtr("alice", 50);
        let active_id = active.id().to_owned();
        fixture.registry.add(active);
        let mut held = fixture.registry.take(&active_id).unwrap();
        held.set_status(DtrStatus::Transferring);
        fixture.registry.note_away(&held);
        drop(held);

        let mut stale = transfer_dtr("alice", 20);
        stale.set_timeout(Duration::from_secs(0));
        let stale_id = stale.id().to_owned();
        let mut top = transfer_dtr("alice", 90);
        top.set_timeout(Duration::from_secs(0));
        let top_id = top.id().to_owned();
        fixture.registry.add(stale);
        fixture.registry.add(top);

        fixture.revise(&conf, 1, 0);

        let queue = fixture.registry.summaries_with_status(DtrStatus::Transfer);
        let stale_now = queue.iter().find(|s| s.id == stale_id).unwrap();
        let top_now = queue.iter().find(|s| s.id == top_id).unwrap();
        assert_eq!(stale_now.priority, 21);
        // the queue maximum never ages, even when timed out
        assert_eq!(top_now.priority, 90);
    }
}
