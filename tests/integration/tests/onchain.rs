//! Channel operations that go through the ledger chain.
//!
//! Tests:
//! 1. A stale unilateral settle is disputed with the newer state
//! 2. Cooperative withdraws, blocking and as monitored jobs
//! 3. A channel follows a ledger migration
//! 4. Low channels are refilled in one batched deposit

use osp_core::{Address, ChannelStatus, PayState, TokenInfo, WithdrawJobStatus};
use osp_integration_tests::{connect, eventually, eventually_async, fast_config, TestNet, DEPOSIT};
use osp_node::SendRequest;
use osp_settlement::{LedgerChain, RefillConfig};
use osp_store::Store;
use std::time::Duration;

// ============================================================================
// Dispute
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_settle_is_disputed() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    let first = b
        .node
        .send_payment(SendRequest::new(a.address(), TokenInfo::native(), 10))
        .await
        .expect("pay should be sent");
    eventually("first pay committed", || b.pay_state(&first) == Some(PayState::CosignedPaid)).await;
    let stale = {
        let handle = b.node.registry().get(&cid).expect("channel handle");
        let ledger = handle.lock().await;
        ledger.outgoing().signed.clone()
    };
    assert_eq!(stale.state.seq_num, 1);

    let second = b
        .node
        .send_payment(SendRequest::new(a.address(), TokenInfo::native(), 20))
        .await
        .expect("pay should be sent");
    eventually("second pay committed", || b.pay_state(&second) == Some(PayState::CosignedPaid)).await;

    // B tries to close on the state that paid A less.
    net.chain
        .intend_settle(b.address(), cid, vec![stale])
        .await
        .expect("settle submitted");

    let chain = net.chain.clone();
    let payer = b.address();
    eventually_async("dispute lands the newer state", || {
        let chain = chain.clone();
        async move {
            chain
                .channel_info(cid)
                .await
                .ok()
                .flatten()
                .and_then(|info| info.intended_seq_from(&payer))
                == Some(2)
        }
    })
    .await;
    eventually("both sides see the channel settling", || {
        [&a, &b].iter().all(|n| n.summary(&cid).status == ChannelStatus::Settling)
    })
    .await;

    net.chain.mine_blocks(net.chain.config().dispute_window + 1);
    a.node.confirm_settle(cid).await.expect("settle confirmed");
    eventually("channel closed on both sides", || {
        [&a, &b].iter().all(|n| n.summary(&cid).status == ChannelStatus::Closed)
    })
    .await;
}

// ============================================================================
// Withdraw
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cooperative_withdraw_blocking_and_as_job() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    let receipt = b
        .node
        .cooperative_withdraw(cid, 500)
        .await
        .expect("withdraw should succeed");
    assert!(receipt.success);
    assert_eq!(b.summary(&cid).free_local, DEPOSIT - 500);
    eventually("peer sees the withdraw", || a.summary(&cid).free_remote == DEPOSIT - 500).await;

    let job_id = a
        .node
        .cooperative_withdraw_nonblocking(cid, 1_000)
        .await
        .expect("job should start");
    let mut job = a.node.monitor_withdraw_job(&job_id).await.expect("job is known");
    for _ in 0..250 {
        if job.status.is_final() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        job = a.node.monitor_withdraw_job(&job_id).await.expect("job is known");
    }
    assert_eq!(job.status, WithdrawJobStatus::Succeeded);
    assert!(job.tx.is_some());
    assert!(job.error.is_none());
    eventually("withdrawn balance gone", || a.summary(&cid).free_local == DEPOSIT - 1_000).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_withdraw_errors() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    assert!(a.node.cooperative_withdraw(cid, DEPOSIT + 1).await.is_err());
    assert!(a.node.monitor_withdraw_job(&uuid::Uuid::now_v7()).await.is_err());
    assert_eq!(a.summary(&cid).free_local, DEPOSIT);
}

// ============================================================================
// Migration
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channel_follows_ledger_migration() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;
    let target = Address([0x2e; 20]);

    let deadline = net.chain.head() + 100;
    net.chain
        .announce_migration(cid, target, deadline)
        .expect("migration announced");
    eventually("both sides track the migration", || {
        [&a, &b]
            .iter()
            .all(|n| n.store.get_migration(&cid).is_ok_and(|m| m.is_some()))
    })
    .await;

    // A pay that could outlive the old ledger is refused.
    let late = SendRequest::new(b.address(), TokenInfo::native(), 1).resolve_timeout(200);
    assert!(a.node.send_payment(late).await.is_err());

    a.node.migrate_channel(cid).await.expect("migration replayed");
    eventually("both sides repointed", || {
        [&a, &b].iter().all(|n| n.summary(&cid).ledger == target)
    })
    .await;
    eventually("migration records cleared", || {
        [&a, &b]
            .iter()
            .all(|n| n.store.get_migration(&cid).is_ok_and(|m| m.is_none()))
    })
    .await;

    let pay_id = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 1).resolve_timeout(200))
        .await
        .expect("pay should be sent");
    eventually("pay on the new ledger", || a.pay_state(&pay_id) == Some(PayState::CosignedPaid)).await;
}

// ============================================================================
// Refill
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_low_channels_refilled_in_one_batch() {
    let net = TestNet::new();
    let mut hub_config = fast_config(1);
    hub_config.refill = RefillConfig {
        enabled: true,
        threshold: DEPOSIT - 10,
        amount: 1_000,
        max_wait_ms: 60_000,
        min_batch: 2,
        max_batch: 8,
    };
    let hub = net.spawn(1, hub_config);
    let b = net.spawn(2, fast_config(1));
    let c = net.spawn(3, fast_config(1));
    let hb = connect(&hub, &b, DEPOSIT).await;
    let hc = connect(&hub, &c, DEPOSIT).await;

    let to_b = hub
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 100))
        .await
        .expect("pay should be sent");
    eventually("pay to b committed", || hub.pay_state(&to_b) == Some(PayState::CosignedPaid)).await;

    // One low channel is short of a batch.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.summary(&hb).free_local, DEPOSIT - 100);

    let to_c = hub
        .node
        .send_payment(SendRequest::new(c.address(), TokenInfo::native(), 100))
        .await
        .expect("pay should be sent");
    eventually("pay to c committed", || hub.pay_state(&to_c) == Some(PayState::CosignedPaid)).await;

    eventually("both channels refilled", || {
        [hb, hc]
            .iter()
            .all(|cid| hub.summary(cid).free_local == DEPOSIT - 100 + 1_000)
    })
    .await;
    eventually("peers see the deposit", || {
        b.summary(&hb).free_remote == DEPOSIT + 900 && c.summary(&hc).free_remote == DEPOSIT + 900
    })
    .await;
}
