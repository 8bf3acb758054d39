//! Peer RPC over real HTTP: axum server in front of a node actor, reqwest
//! client on the other side

use consensus::join::join_existing_ledger;
use consensus::server::{router, ServerState};
use consensus::{spawn_node, AuthenticationRequest, HttpPeerClient, Metrics, NetworkConfig, PeerClient, RoundEngine};
use ledger_core::{Account, Ed25519Provider, LedgerParameters, LedgerSnapshot, NodeIdentity, ValidatorNode};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn identity(seed: u8) -> NodeIdentity {
    NodeIdentity::ed25519_from_seed([seed; 32])
}

fn genesis(validator: &NodeIdentity, candidate: &NodeIdentity) -> LedgerSnapshot {
    let mut params = LedgerParameters::default();
    params.frame_processing_time_ms = 300;
    params.validator_stake_requirement = dec!(10);
    let accounts = vec![
        Account::new(validator.public_key().clone(), "", dec!(100), validator.public_key().clone()),
        Account::new(candidate.public_key().clone(), "", dec!(5), candidate.public_key().clone()),
    ];
    let nodes = vec![ValidatorNode::announce(validator, "http://127.0.0.1:1").unwrap()];
    LedgerSnapshot::genesis(&Ed25519Provider, accounts, nodes, params).unwrap()
}

#[tokio::test]
async fn test_peer_routes_round_trip() {
    let (validator, candidate) = (identity(1), identity(4));
    let g = genesis(&validator, &candidate);

    let client = Arc::new(HttpPeerClient::new(Duration::from_secs(2)).unwrap());
    let metrics = Metrics::new().unwrap();
    let mut engine = RoundEngine::new(validator.clone(), "http://127.0.0.1:1", metrics.clone(), 10);
    engine.create_ledger(g.clone()).unwrap();
    let published = engine.published();
    let (handle, task) = spawn_node(engine, client.clone(), NetworkConfig::default(), 16);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let state = ServerState {
        handle: handle.clone(),
        published,
        public_key: validator.public_key().clone(),
        metrics,
    };
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    assert_eq!(&client.who_am_i(&addr).await.unwrap(), validator.public_key());
    // a block may finalize between calls; the challenge then moves once
    let before = client.request_challenge(&addr).await.unwrap();
    let direct = handle.challenge().await.unwrap();
    let after = client.request_challenge(&addr).await.unwrap();
    assert_eq!(direct.len(), 64);
    assert!(direct == before || direct == after);

    // the actor publishes within one frame
    let mut envelope = None;
    for _ in 0..50 {
        envelope = client.current_envelope(&addr).await.unwrap();
        if envelope.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let envelope = envelope.expect("no envelope published");
    assert!(envelope.verify_signature(&Ed25519Provider));
    assert_eq!(envelope.publisher(), Some(validator.public_key().as_str()));

    // stake 5 does not exceed the requirement of 10
    let challenge = client.request_challenge(&addr).await.unwrap();
    let request = AuthenticationRequest::sign(&candidate, &challenge, "http://127.0.0.1:2").unwrap();
    assert!(!client.authenticate(&addr, &request).await.unwrap());
    assert!(!join_existing_ledger(client.as_ref(), &candidate, &addr, "http://127.0.0.1:2")
        .await
        .unwrap());

    // genesis is not newer than the node's ledger
    assert!(client.push_snapshot(&addr, &g).await.is_err());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    server.abort();
}
