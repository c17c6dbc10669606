//! Payments between two directly connected nodes.
//!
//! Tests:
//! 1. A direct pay moves balances on both sides and both legs end paid
//! 2. A contract-conditioned pay waits for the payee to confirm
//! 3. A rejected pay is canceled on both legs and cannot be decided again
//! 4. Pay history pages through every pay a node took part in

use osp_core::{CancelReason, Condition, PayState, TokenInfo, TransferLogic};
use osp_integration_tests::{connect, eventually, fast_config, TestNet, DEPOSIT};
use osp_node::SendRequest;
use osp_store::{HistoryOrder, HistoryQuery};

fn contract(arg: u8) -> Condition {
    Condition::DeployedContract {
        address: osp_core::Address([0xc0; 20]),
        args: vec![arg],
    }
}

// ============================================================================
// Direct pay
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_pay_of_one_unit() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    let pay_id = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 1))
        .await
        .expect("pay should be sent");

    eventually("payer leg paid", || a.pay_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    let ours = a.summary(&cid);
    assert_eq!(ours.free_local, DEPOSIT - 1);
    assert_eq!(ours.free_remote, DEPOSIT + 1);
    assert_eq!(ours.seq_out, 1);
    assert!(a.record(&pay_id).expect("record").direct);

    let theirs = b.summary(&cid);
    assert_eq!(theirs.free_local, DEPOSIT + 1);
    assert_eq!(theirs.free_remote, DEPOSIT - 1);
    assert_eq!(theirs.seq_in, 1);

    // The payee learns on its own that the payer committed the state.
    eventually("payee leg paid", || b.incoming_state(&pay_id) == Some(PayState::CosignedPaid)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pay_above_free_balance_is_refused() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    let result = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), DEPOSIT + 1))
        .await;
    assert!(result.is_err());
    assert_eq!(a.summary(&cid).seq_out, 0);
}

// ============================================================================
// Confirm / reject
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_confirmed_pay_settles() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    let condition = contract(1);
    net.chain.set_condition_outcome(condition.clone(), true);
    let pay_id = a
        .node
        .send_payment_with_conditions(b.address(), TokenInfo::native(), 500, vec![condition], TransferLogic::default())
        .await
        .expect("pay should be sent");

    eventually("pay locked", || a.pay_state(&pay_id) == Some(PayState::CosignedPending)).await;
    assert_eq!(a.summary(&cid).locked_local, 500);

    b.node.confirm_pay(pay_id).await.expect("confirm should succeed");

    eventually("payer leg paid", || a.pay_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    eventually("payee leg paid", || b.incoming_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    let ours = a.summary(&cid);
    assert_eq!(ours.locked_local, 0);
    assert_eq!(ours.free_local, DEPOSIT - 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_pay_is_canceled() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    let cid = connect(&a, &b, DEPOSIT).await;

    let pay_id = a
        .node
        .send_payment_with_conditions(b.address(), TokenInfo::native(), 700, vec![contract(2)], TransferLogic::default())
        .await
        .expect("pay should be sent");
    eventually("pay locked", || a.pay_state(&pay_id) == Some(PayState::CosignedPending)).await;

    b.node.reject_pay(pay_id).await.expect("reject should succeed");

    eventually("payer leg canceled", || a.pay_state(&pay_id) == Some(PayState::CosignedCanceled)).await;
    eventually("payee leg canceled", || b.incoming_state(&pay_id) == Some(PayState::CosignedCanceled)).await;
    assert_eq!(
        b.record(&pay_id).expect("record").cancel_reason,
        Some(CancelReason::Rejected)
    );
    assert_eq!(a.summary(&cid).free_local, DEPOSIT);

    // Decided once, decided for good.
    assert!(b.node.confirm_pay(pay_id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_the_payee_decides() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    connect(&a, &b, DEPOSIT).await;

    let pay_id = a
        .node
        .send_payment_with_conditions(b.address(), TokenInfo::native(), 10, vec![contract(3)], TransferLogic::default())
        .await
        .expect("pay should be sent");
    assert!(a.node.confirm_pay(pay_id).await.is_err());
    assert!(a.node.reject_pay(pay_id).await.is_err());
}

// ============================================================================
// History
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pay_history_pages() {
    let net = TestNet::new();
    let a = net.spawn(1, fast_config(1));
    let b = net.spawn(2, fast_config(1));
    connect(&a, &b, DEPOSIT).await;

    let mut sent = Vec::new();
    for amount in 1..=3 {
        let pay_id = a
            .node
            .send_payment(SendRequest::new(b.address(), TokenInfo::native(), amount))
            .await
            .expect("pay should be sent");
        sent.push(pay_id);
    }
    eventually("all pays committed", || {
        sent.iter().all(|id| a.pay_state(id) == Some(PayState::CosignedPaid))
    })
    .await;

    let first = a
        .node
        .get_pay_history(&HistoryQuery {
            cursor: None,
            order: HistoryOrder::OldestFirst,
            limit: 2,
        })
        .expect("history");
    assert_eq!(first.pays.len(), 2);
    let cursor = first.next_cursor.expect("a second page");
    let second = a
        .node
        .get_pay_history(&HistoryQuery {
            cursor: Some(cursor),
            order: HistoryOrder::OldestFirst,
            limit: 2,
        })
        .expect("history");
    assert_eq!(second.pays.len(), 1);

    let mut seen: Vec<_> = first.pays.iter().chain(&second.pays).map(|r| r.pay_id).collect();
    seen.sort();
    sent.sort();
    assert_eq!(seen, sent);

    let payee_side = b.node.get_pay_history(&HistoryQuery::default()).expect("history");
    assert_eq!(payee_side.pays.len(), 3);
}
