//! Pays that cross intermediate nodes.
//!
//! Tests:
//! 1. A two-hop pay resolves through its hash lock
//! 2. A dead hop is routed around; the pay stuck behind it is refunded
//!    payee first once the hop returns
//! 3. A pay nobody resolves is canceled hop by hop once its deadline passes
//! 4. A pay crosses into another sub-network through a bridge

use osp_core::{Address, Condition, PayState, RelayDirection, TokenInfo, TransferLogic};
use osp_integration_tests::{connect, eventually, fast_config, net_route, route, seed_address, TestNet, DEPOSIT};
use osp_node::SendRequest;
use osp_store::Store;
use std::time::Duration;

const A: u8 = 1;
const B: u8 = 2;
const C: u8 = 3;
const D: u8 = 4;
const E: u8 = 5;

// ============================================================================
// Relayed pays
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_hop_pay_resolves() {
    let net = TestNet::new();
    let mut a_config = fast_config(1);
    a_config.routing.routes.push(route(seed_address(C), seed_address(B)));
    let mut c_config = fast_config(1);
    c_config.routing.default_route = Some(seed_address(B));

    let a = net.spawn(A, a_config);
    let b = net.spawn(B, fast_config(1));
    let c = net.spawn(C, c_config);
    let ab = connect(&a, &b, DEPOSIT).await;
    let bc = connect(&b, &c, DEPOSIT).await;

    let pay_id = a
        .node
        .send_payment(SendRequest::new(c.address(), TokenInfo::native(), 1_000))
        .await
        .expect("pay should be sent");
    let record = a.record(&pay_id).expect("record");
    assert!(!record.direct);
    assert_eq!(record.pay.hash_locks().count(), 1);

    eventually("payer leg paid", || a.pay_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    eventually("payee leg paid", || c.incoming_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    eventually("relay done", || b.record(&pay_id).is_some_and(|r| r.is_final())).await;

    assert_eq!(a.summary(&ab).free_local, DEPOSIT - 1_000);
    assert_eq!(b.summary(&ab).free_local, DEPOSIT + 1_000);
    assert_eq!(b.summary(&bc).free_local, DEPOSIT - 1_000);
    assert_eq!(c.summary(&bc).free_local, DEPOSIT + 1_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_hop_is_routed_around() {
    // A - B - C - D, with B - E - D as the alternate path.
    let net = TestNet::new();
    let (a_addr, b_addr, c_addr, d_addr, e_addr) = (
        seed_address(A),
        seed_address(B),
        seed_address(C),
        seed_address(D),
        seed_address(E),
    );
    let mut a_config = fast_config(1);
    a_config.routing.routes.push(route(d_addr, b_addr));
    let mut b_config = fast_config(1);
    b_config.routing.routes.push(route(d_addr, c_addr));
    b_config.routing.routes.push(route(d_addr, e_addr));
    let mut c_config = fast_config(1);
    c_config.routing.routes.push(route(a_addr, b_addr));
    let mut d_config = fast_config(1);
    d_config.routing.routes.push(route(a_addr, c_addr));
    d_config.routing.routes.push(route(a_addr, e_addr));
    let mut e_config = fast_config(1);
    e_config.routing.routes.push(route(a_addr, b_addr));

    let a = net.spawn(A, a_config);
    let b = net.spawn(B, b_config);
    let c = net.spawn(C, c_config);
    let d = net.spawn(D, d_config);
    let e = net.spawn(E, e_config);
    let ab = connect(&a, &b, DEPOSIT).await;
    // The larger channel makes C the preferred hop while it is alive.
    connect(&b, &c, DEPOSIT * 2).await;
    connect(&c, &d, DEPOSIT).await;
    connect(&b, &e, DEPOSIT).await;
    connect(&e, &d, DEPOSIT).await;

    // A pay that waits at D for a decision, locked through C.
    let stuck = a
        .node
        .send_payment(
            SendRequest::new(d_addr, TokenInfo::native(), 100)
                .conditions(vec![Condition::DeployedContract {
                    address: Address([0xc2; 20]),
                    args: vec![1],
                }])
                .resolve_timeout(5),
        )
        .await
        .expect("pay should be sent");
    eventually("pay locked through C", || {
        a.pay_state(&stuck) == Some(PayState::CosignedPending) && d.record(&stuck).is_some()
    })
    .await;
    assert_eq!(b.record(&stuck).and_then(|r| r.outgoing).map(|l| l.peer), Some(c_addr));

    net.hub.set_online(c_addr, false);

    let pay_id = a
        .node
        .send_payment(SendRequest::new(d_addr, TokenInfo::native(), 250))
        .await
        .expect("pay should be sent");
    eventually("payer leg paid", || a.pay_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    eventually("payee leg paid", || d.incoming_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    assert_eq!(b.record(&pay_id).and_then(|r| r.outgoing).map(|l| l.peer), Some(e_addr));
    assert!(e.record(&pay_id).is_some());
    assert!(c.record(&pay_id).is_none());

    // Past the deadline B still holds its incoming leg: its outgoing leg
    // sits with C, which is gone.
    let deadline = a.record(&stuck).expect("record").pay.resolve_deadline;
    net.chain.mine_blocks(deadline + 1 - net.chain.head());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.pay_state(&stuck), Some(PayState::CosignedPending));
    let relay = b.record(&stuck).expect("record");
    assert!(relay.incoming.as_ref().is_some_and(|l| !l.state.is_final()));
    assert!(relay.outgoing.as_ref().is_some_and(|l| !l.state.is_final()));

    // Once C is back the cancel runs from the payee end toward the payer,
    // and B never frees its payer before its payee.
    net.hub.set_online(c_addr, true);
    eventually("stuck pay refunded", || {
        let relay = b.record(&stuck).expect("record");
        let in_done = relay.incoming.as_ref().is_some_and(|l| l.state.is_final());
        let out_done = relay.outgoing.as_ref().is_some_and(|l| l.state.is_final());
        assert!(!in_done || out_done, "relay settled its incoming leg first");
        a.pay_state(&stuck) == Some(PayState::CosignedCanceled)
    })
    .await;
    let relay = b.record(&stuck).expect("record");
    assert_eq!(relay.incoming.map(|l| l.state), Some(PayState::CosignedCanceled));
    assert_eq!(relay.outgoing.map(|l| l.state), Some(PayState::CosignedCanceled));
    eventually("payee leg canceled", || d.incoming_state(&stuck) == Some(PayState::CosignedCanceled)).await;

    let ours = a.summary(&ab);
    assert_eq!(ours.locked_local, 0);
    assert_eq!(ours.free_local, DEPOSIT - 250);
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unresolved_pay_is_canceled_after_deadline() {
    let net = TestNet::new();
    let mut a_config = fast_config(1);
    a_config.routing.routes.push(route(seed_address(C), seed_address(B)));

    let a = net.spawn(A, a_config);
    let b = net.spawn(B, fast_config(1));
    let c = net.spawn(C, fast_config(1));
    let ab = connect(&a, &b, DEPOSIT).await;
    let bc = connect(&b, &c, DEPOSIT).await;

    // The contract never resolves true and the payee never decides.
    let condition = Condition::DeployedContract {
        address: Address([0xc1; 20]),
        args: vec![9],
    };
    let head = net.chain.head();
    let pay_id = a
        .node
        .send_payment(
            SendRequest::new(c.address(), TokenInfo::native(), 300)
                .conditions(vec![condition])
                .logic(TransferLogic::default())
                .resolve_timeout(3),
        )
        .await
        .expect("pay should be sent");
    assert_eq!(a.record(&pay_id).expect("record").pay.resolve_deadline, head + 3);

    eventually("pay locked end to end", || {
        a.pay_state(&pay_id) == Some(PayState::CosignedPending) && c.record(&pay_id).is_some()
    })
    .await;
    assert_eq!(a.summary(&ab).locked_local, 300);

    // Nothing happens while the deadline is still ahead.
    net.chain.mine_blocks(3);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.pay_state(&pay_id), Some(PayState::CosignedPending));

    net.chain.mine_blocks(1);
    eventually("payer leg canceled", || a.pay_state(&pay_id) == Some(PayState::CosignedCanceled)).await;
    eventually("relay legs canceled", || b.record(&pay_id).is_some_and(|r| r.is_final())).await;
    eventually("payee leg canceled", || c.incoming_state(&pay_id) == Some(PayState::CosignedCanceled)).await;

    let ours = a.summary(&ab);
    assert_eq!(ours.locked_local, 0);
    assert_eq!(ours.free_local, DEPOSIT);
    eventually("relay unlocked", || b.summary(&bc).locked_local == 0).await;
    assert_eq!(b.summary(&bc).free_local, DEPOSIT);
}

// ============================================================================
// Cross-net
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pay_crosses_into_another_net() {
    let net = TestNet::new();
    let (b_addr, c_addr) = (seed_address(B), seed_address(C));
    let mut a_config = fast_config(1);
    a_config.routing.net_routes.push(net_route(2, b_addr));
    let mut b_config = fast_config(1);
    b_config.routing.net_routes.push(net_route(2, c_addr));
    let mut c_config = fast_config(2);
    c_config.routing.net_routes.push(net_route(1, b_addr));

    let a = net.spawn(A, a_config);
    let b = net.spawn(B, b_config);
    let c = net.spawn(C, c_config);
    connect(&a, &b, DEPOSIT).await;
    connect(&b, &c, DEPOSIT).await;

    let pay_id = a
        .node
        .send_payment(SendRequest::new(c.address(), TokenInfo::native(), 42).dest_net(2))
        .await
        .expect("pay should be sent");
    let pay = a.record(&pay_id).expect("record").pay;
    assert_eq!((pay.src_net, pay.dest_net), (1, 2));

    eventually("payer leg paid", || a.pay_state(&pay_id) == Some(PayState::CosignedPaid)).await;
    eventually("payee leg paid", || c.incoming_state(&pay_id) == Some(PayState::CosignedPaid)).await;

    let egress = b
        .node
        .registry()
        .store()
        .get_cross_net(&pay_id)
        .expect("store read")
        .expect("bridge keeps a relay record");
    assert_eq!(egress.direction, RelayDirection::Egress);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pay_to_unbridged_net_is_refused() {
    let net = TestNet::new();
    let a = net.spawn(A, fast_config(1));
    let b = net.spawn(B, fast_config(1));
    connect(&a, &b, DEPOSIT).await;

    let result = a
        .node
        .send_payment(SendRequest::new(b.address(), TokenInfo::native(), 1).dest_net(7))
        .await;
    assert!(result.is_err());
}
