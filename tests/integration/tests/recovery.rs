//! Crash recovery and peer sync.
//!
//! Tests:
//! 1. A pay the peer countersigned just before the payer crashed is
//!    committed by the sync after restart
//! 2. A proposal the peer never received is re-sent after restart
//! 3. A peer that was offline catches up when it returns

use osp_core::{PayState, TokenInfo};
use osp_integration_tests::{connect, eventually, fast_config, TestNet, DEPOSIT};
use osp_node::SendRequest;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_commits_pay_countersigned_before_crash() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    // B countersigns, but the answer never reaches A.
    net.hub.drop_next_reply(b.address());
    let pay_id = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 1))
        .await
        .expect("pay is recorded even when unanswered");
    assert_eq!(a.pay_state(&pay_id), Some(PayState::OnesigPending));
    assert_eq!(b.summary(&cid).seq_in, 1);

    let a = net.restart(a).await;

    eventually("pay committed after restart", || {
        a.pay_state(&pay_id) == Some(PayState::CosignedPaid)
    })
    .await;
    let ours = a.summary(&cid);
    assert_eq!(ours.seq_out, 1);
    assert_eq!(ours.free_local, DEPOSIT - 1);

    // Pays sent after recovery continue from the committed seq.
    let next = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 2))
        .await
        .expect("pay should be sent");
    eventually("second pay committed", || a.pay_state(&next) == Some(PayState::CosignedPaid)).await;
    assert_eq!(a.summary(&cid).seq_out, 2);
    eventually("payee saw both pays", || b.summary(&cid).free_local == DEPOSIT + 3).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resends_proposal_the_peer_never_saw() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    net.hub.drop_next_request(b.address());
    let pay_id = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 5))
        .await
        .expect("pay is recorded even when undelivered");
    assert_eq!(a.pay_state(&pay_id), Some(PayState::OnesigPending));
    assert!(b.record(&pay_id).is_none());

    let a = net.restart(a).await;

    eventually("pay committed after resend", || {
        a.pay_state(&pay_id) == Some(PayState::CosignedPaid)
    })
    .await;
    assert!(b.record(&pay_id).is_some());
    assert_eq!(b.summary(&cid).free_local, DEPOSIT + 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_offline_peer_catches_up_on_return() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    let pay_id = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 3))
        .await
        .expect("pay should be sent");
    eventually("payer leg paid", || a.pay_state(&pay_id) == Some(PayState::CosignedPaid)).await;

    net.hub.set_online(b.address(), false);
    assert!(!a.node.get_peer_status(&b.address()).online);
    assert!(a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 1))
        .await
        .is_err());

    net.hub.set_online(b.address(), true);
    eventually("payee leg paid after reconnect", || {
        b.incoming_state(&pay_id) == Some(PayState::CosignedPaid)
    })
    .await;
    let view = a.node.get_peer_status(&b.address());
    assert!(view.online);
    assert_eq!(view.channels.len(), 1);
    assert_eq!(view.channels[0].channel_id, cid);
}
