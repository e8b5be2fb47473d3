//! Remote ICE candidates survive any interleaving with the remote description

use async_trait::async_trait;
use chatrtc_core::config::{AudioConstraints, VideoConstraints};
use chatrtc_core::testing::{wait_until, FakePeerFactory, FakePeerScript};
use chatrtc_core::{
    CallId, ConnectionState, FacingMode, IceCandidate, MediaAcquisitionManager, Notifier,
    PeerConnectionManager, PeerError, PeerObserver, Role, SessionDescription, SyntheticDevices,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Quiet;

#[async_trait]
impl PeerObserver for Quiet {
    async fn on_local_candidate(&self, _candidate: IceCandidate) {}
}

fn candidate(i: usize) -> IceCandidate {
    IceCandidate::new(format!("candidate:{i} 1 udp 2122260223 192.168.1.{i} 9 typ host"))
}

/// Responder manager with a connection built from synthetic media
async fn responder(factory: Arc<FakePeerFactory>) -> PeerConnectionManager {
    let notifier = Notifier::new(64);
    let media = MediaAcquisitionManager::new(
        Arc::new(SyntheticDevices::new()),
        AudioConstraints::default(),
        VideoConstraints::default(),
        notifier.clone(),
    );
    let stream = media.acquire(FacingMode::Front).await.unwrap();
    let manager = PeerConnectionManager::new(
        CallId::from_wire("call_ice"),
        Role::Responder,
        factory,
        Vec::new(),
        notifier,
    );
    manager.initialize(&stream, Arc::new(Quiet)).await.unwrap();
    manager
}

/// Feed `total` candidates, `early` of them before the offer
async fn interleave(total: usize, early: usize) -> Vec<String> {
    let factory = Arc::new(FakePeerFactory::with_script(FakePeerScript {
        local_candidates: 0,
        ..FakePeerScript::default()
    }));
    let manager = responder(Arc::clone(&factory)).await;

    for i in 0..early {
        manager.add_remote_ice_candidate(candidate(i)).await.unwrap();
    }
    assert_eq!(manager.negotiation_state().pending_remote_candidates, early);

    manager
        .apply_remote_offer(SessionDescription::offer("v=0 remote"))
        .await
        .unwrap();
    for i in early..total {
        manager.add_remote_ice_candidate(candidate(i)).await.unwrap();
    }
    assert_eq!(manager.negotiation_state().pending_remote_candidates, 0);

    factory
        .last()
        .unwrap()
        .applied_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn candidates_applied_in_arrival_order(total in 0usize..12, split in 0usize..12) {
        let early = split.min(total);
        let applied = tokio_test::block_on(interleave(total, early));
        let expected: Vec<String> = (0..total).map(|i| candidate(i).candidate).collect();
        prop_assert_eq!(applied, expected);
    }
}

#[tokio::test]
async fn candidates_before_initialize_are_kept() {
    let factory = Arc::new(FakePeerFactory::new());
    let notifier = Notifier::new(64);
    let manager = PeerConnectionManager::new(
        CallId::from_wire("call_early"),
        Role::Responder,
        factory.clone(),
        Vec::new(),
        notifier.clone(),
    );
    for i in 0..3 {
        manager.add_remote_ice_candidate(candidate(i)).await.unwrap();
    }
    assert!(!manager.is_initialized());
    assert_eq!(manager.negotiation_state().pending_remote_candidates, 3);

    let media = MediaAcquisitionManager::new(
        Arc::new(SyntheticDevices::new()),
        AudioConstraints::default(),
        VideoConstraints::default(),
        notifier,
    );
    let stream = media.acquire(FacingMode::Front).await.unwrap();
    manager.initialize(&stream, Arc::new(Quiet)).await.unwrap();
    manager
        .apply_remote_offer(SessionDescription::offer("v=0 remote"))
        .await
        .unwrap();

    let peer = factory.last().unwrap();
    assert_eq!(peer.applied_candidates().len(), 3);
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.connection_state() == ConnectionState::Connected
        })
        .await
    );
}

#[tokio::test]
async fn candidates_after_teardown_are_refused() {
    let factory = Arc::new(FakePeerFactory::new());
    let manager = responder(Arc::clone(&factory)).await;
    manager.add_remote_ice_candidate(candidate(0)).await.unwrap();

    manager.teardown().await;
    manager.teardown().await;

    assert_eq!(
        manager.add_remote_ice_candidate(candidate(1)).await,
        Err(PeerError::Closed)
    );
    assert_eq!(manager.negotiation_state().pending_remote_candidates, 0);
    assert_eq!(factory.last().unwrap().close_calls(), 1);
}
