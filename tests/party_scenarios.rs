//! End-to-end party scenarios over the file-based control plane, with the
//! tunnel manager stubbed out as the single external seam.

mod common;

use std::net::Ipv4Addr;
use std::time::Duration;

use common::{fast_config, seed_relays, EchoRelay, TestPeer};
use lanrage::connection::ConnectionState;
use lanrage::control::ControlPlane;
use lanrage::model::{ConnectionStrategy, NatType};

fn scenario_dir() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    (dir, path)
}

/// S1: two compatible peers connect directly, host at .1, guest at .2.
#[tokio::test]
async fn two_peer_direct() {
    let (_guard, dir) = scenario_dir();

    let host = TestPeer::start(&dir, "host", NatType::Open, 1, fast_config()).await;
    let guest = TestPeer::start(&dir, "guest", NatType::FullCone, 2, fast_config()).await;

    let party = host.party.create_party("alpha").await.unwrap();
    let joined = guest.party.join_party(&party.party_id).await.unwrap();

    assert_eq!(
        joined.peers["host"].virtual_ip,
        Some(Ipv4Addr::new(10, 66, 0, 1))
    );
    assert_eq!(
        joined.peers["guest"].virtual_ip,
        Some(Ipv4Addr::new(10, 66, 0, 2))
    );

    // Guest side: direct and active within five seconds.
    guest
        .wait_for_record("host", Duration::from_secs(5), |r| {
            r.strategy == ConnectionStrategy::Direct && r.state == ConnectionState::Active
        })
        .await;

    // Host side mirrors via the signal path.
    host.wait_for_record("guest", Duration::from_secs(5), |r| {
        r.strategy == ConnectionStrategy::Direct && r.state == ConnectionState::Active
    })
    .await;

    let guest_record = guest.connections.record("host").await.unwrap();
    assert_eq!(guest_record.virtual_ip, Ipv4Addr::new(10, 66, 0, 1));
    let host_record = host.connections.record("guest").await.unwrap();
    assert_eq!(host_record.virtual_ip, Ipv4Addr::new(10, 66, 0, 2));

    // The installed WireGuard peers carry each other's keys.
    assert!(guest.tunnel.peers.lock().await.contains_key("host-pubkey"));
    assert!(host.tunnel.peers.lock().await.contains_key("guest-pubkey"));
}

/// S2: symmetric NATs on both sides fall back to the same relay.
#[tokio::test]
async fn symmetric_pair_falls_back_to_relay() {
    let (_guard, dir) = scenario_dir();
    let relay = EchoRelay::start().await;
    seed_relays(&dir, &[("relay-a", relay.addr)]).await;

    let host = TestPeer::start(&dir, "host", NatType::Symmetric, 1, fast_config()).await;
    let guest = TestPeer::start(&dir, "guest", NatType::Symmetric, 2, fast_config()).await;

    let party = host.party.create_party("beta").await.unwrap();
    guest.party.join_party(&party.party_id).await.unwrap();

    guest
        .wait_for_record("host", Duration::from_secs(5), |r| {
            r.strategy == ConnectionStrategy::Relay
                && r.endpoint == relay.addr
                && r.state == ConnectionState::Active
        })
        .await;

    host.wait_for_record("guest", Duration::from_secs(5), |r| {
        r.strategy == ConnectionStrategy::Relay
            && r.endpoint == relay.addr
            && r.state == ConnectionState::Active
    })
    .await;
}

/// S3: a degraded relay is replaced by a faster one, once per cooldown.
#[tokio::test]
async fn relay_switch_on_degradation() {
    let (_guard, dir) = scenario_dir();
    let relay_a = EchoRelay::start().await;
    let relay_b = EchoRelay::start().await;
    // B starts slower so A is the first pick.
    relay_b.set_delay(Duration::from_millis(60)).await;
    seed_relays(&dir, &[("relay-a", relay_a.addr), ("relay-b", relay_b.addr)]).await;

    let host = TestPeer::start(&dir, "host", NatType::Symmetric, 1, fast_config()).await;
    let guest = TestPeer::start(&dir, "guest", NatType::Symmetric, 2, fast_config()).await;

    let party = host.party.create_party("gamma").await.unwrap();
    guest.party.join_party(&party.party_id).await.unwrap();

    guest
        .wait_for_record("host", Duration::from_secs(5), |r| {
            r.strategy == ConnectionStrategy::Relay
                && r.endpoint == relay_a.addr
                && r.state == ConnectionState::Active
        })
        .await;

    // Relay A degrades: probes now favor B, and the measured latency on
    // the tunnel crosses the switch threshold.
    relay_a.set_delay(Duration::from_millis(300)).await;
    relay_b.set_delay(Duration::ZERO).await;
    let host_vip = guest.connections.record("host").await.unwrap().virtual_ip;
    guest.tunnel.set_latency(host_vip, Some(320.0)).await;

    guest
        .wait_for_record("host", Duration::from_secs(5), |r| {
            r.endpoint == relay_b.addr
        })
        .await;

    // Recovery on the new relay.
    guest.tunnel.set_latency(host_vip, Some(40.0)).await;
    guest
        .wait_for_record("host", Duration::from_secs(5), |r| {
            r.state == ConnectionState::Active && r.last_latency_ms == Some(40.0)
        })
        .await;

    // Degrade again: the 60 s cooldown forbids a second switch.
    relay_b.set_delay(Duration::from_millis(300)).await;
    guest.tunnel.set_latency(host_vip, Some(320.0)).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    let record = guest.connections.record("host").await.unwrap();
    assert_eq!(
        record.endpoint, relay_b.addr,
        "no second switch inside the cooldown"
    );
}

/// S4: the host leaving deletes the party; the guest notices via its
/// heartbeat and tears its connections down.
#[tokio::test]
async fn host_leave_deletes_party() {
    let (_guard, dir) = scenario_dir();

    let host = TestPeer::start(&dir, "host", NatType::Open, 1, fast_config()).await;
    let guest = TestPeer::start(&dir, "guest", NatType::Open, 2, fast_config()).await;

    let party = host.party.create_party("delta").await.unwrap();
    let party_id = party.party_id.clone();
    guest.party.join_party(&party_id).await.unwrap();

    guest
        .wait_for_record("host", Duration::from_secs(5), |r| {
            r.state == ConnectionState::Active
        })
        .await;

    host.party.leave_party().await.unwrap();
    assert!(guest
        .control
        .get_party(&party_id)
        .await
        .unwrap()
        .is_none());

    // Heartbeat every 200 ms answers PartyNotFound and closes everything.
    let start = tokio::time::Instant::now();
    loop {
        if guest.connections.record("host").await.is_none() {
            break;
        }
        if start.elapsed() > Duration::from_secs(5) {
            panic!("guest connections survived party deletion");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The guest is no longer in a party.
    assert!(guest.party.status().await.is_err());
}

/// Boundary 13: punch-compatible cone NATs succeed directly over loopback;
/// a silent far side falls back to the relay.
#[tokio::test]
async fn cone_pair_punches_or_falls_back() {
    let (_guard, dir) = scenario_dir();
    let relay = EchoRelay::start().await;
    seed_relays(&dir, &[("relay-a", relay.addr)]).await;

    let host = TestPeer::start(
        &dir,
        "host",
        NatType::PortRestrictedCone,
        1,
        fast_config(),
    )
    .await;
    let guest = TestPeer::start(
        &dir,
        "guest",
        NatType::PortRestrictedCone,
        2,
        fast_config(),
    )
    .await;

    let party = host.party.create_party("epsilon").await.unwrap();
    guest.party.join_party(&party.party_id).await.unwrap();

    // Both sides run the punch protocol over loopback; it must open.
    guest
        .wait_for_record("host", Duration::from_secs(10), |r| {
            r.strategy == ConnectionStrategy::Direct && r.state == ConnectionState::Active
        })
        .await;
}

/// S6: a peer whose heartbeats stop is swept from the party.
#[tokio::test]
async fn stale_peer_cleanup() {
    let (_guard, dir) = scenario_dir();

    let host = TestPeer::start(&dir, "host", NatType::Open, 1, fast_config()).await;
    let guest = TestPeer::start(&dir, "guest", NatType::Open, 2, fast_config()).await;

    let party = host.party.create_party("zeta").await.unwrap();
    let party_id = party.party_id.clone();
    guest.party.join_party(&party_id).await.unwrap();
    guest.stop(); // heartbeats cease

    // Age the guest's last_seen beyond the stale window directly in the
    // shared state file, then trigger a mutation to run the sweep. The
    // host's background heartbeat can race the file edit, so age-and-sweep
    // retries until it lands.
    let state_path = dir.join("control_state.json");
    let mut swept = false;
    for _ in 0..10 {
        let text = tokio::fs::read_to_string(&state_path).await.unwrap();
        let mut state: lanrage::control::state::ControlState =
            serde_json::from_str(&text).unwrap();
        if let Some(peer) = state
            .parties
            .get_mut(&party_id)
            .and_then(|p| p.peers.get_mut("guest"))
        {
            peer.last_seen = peer.last_seen.saturating_sub(1_000);
            tokio::fs::write(&state_path, serde_json::to_string_pretty(&state).unwrap())
                .await
                .unwrap();
        }

        host.control.heartbeat(&party_id, "host").await.unwrap();
        let fresh = host.control.get_party(&party_id).await.unwrap().unwrap();
        if !fresh.peers.contains_key("guest") {
            swept = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(swept, "stale guest was never swept");

    let fresh = host.control.get_party(&party_id).await.unwrap().unwrap();
    assert!(!fresh.peers.contains_key("guest"));
    assert!(fresh.peers.contains_key("host"));
}
