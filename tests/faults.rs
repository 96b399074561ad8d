// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
mod shared;

use shared::{await_members, await_view_change, endpoint, init_logger, member};
use skein::cluster::proto::EdgeStatus;
use skein::simulation::Network;
use skein::Handle;
use std::time::Duration;
use tokio::time;

const CONVERGE: Duration = Duration::from_secs(30);

/// Bring up a cluster of `n` members on consecutive ports starting at
/// `base`.
async fn bootstrap(net: &std::sync::Arc<Network>, base: u16, n: u16) -> Vec<Handle> {
    let seed = member().start(endpoint(base), net.clone()).unwrap();
    net.register(seed.clone());

    let mut handles = vec![seed];

    for i in 1..n {
        let joiner = member()
            .join(endpoint(base + i), endpoint(base), net.clone())
            .await
            .unwrap();
        net.register(joiner.clone());
        handles.push(joiner);

        for handle in &handles {
            await_members(handle, i as usize + 1, CONVERGE).await;
        }
    }

    handles
}

/// One node dies in a six-node cluster: every survivor converges on a
/// five-member configuration, and the event stream carries a view change
/// with a DOWN status for the victim.
#[tokio::test(flavor = "multi_thread")]
async fn one_node_failure_in_a_six_node_cluster() {
    init_logger();
    let net = Network::new();

    let handles = bootstrap(&net, 1600, 6).await;
    let victim = endpoint(1603);

    // let the new monitors collect some heartbeat history first.
    time::sleep(Duration::from_millis(600)).await;

    let mut events = handles[0].subscribe();

    let (dead, survivors): (Vec<_>, Vec<_>) =
        handles.into_iter().partition(|h| *h.local() == victim);

    net.kill(&victim);
    dead[0].shutdown().await.unwrap();

    let vc = await_view_change(&mut events, 5, CONVERGE).await;
    assert!(!vc.members.contains(&victim));
    assert!(vc
        .status_changes
        .iter()
        .any(|c| c.endpoint == victim && c.status == EdgeStatus::Down));

    for handle in &survivors {
        let members = await_members(handle, 5, CONVERGE).await;
        assert!(!members.contains(&victim));
    }

    let expected = survivors[0].configuration().await.unwrap();
    for handle in &survivors[1..] {
        let config = handle.configuration().await.unwrap();
        assert_eq!(config.configuration_id, expected.configuration_id);
    }
}

/// A member leaves gracefully: its departure notice turns into DOWN alerts
/// and the survivors agree on the shrunken configuration without waiting
/// for fault detection to time out.
#[tokio::test(flavor = "multi_thread")]
async fn graceful_leave_shrinks_the_cluster() {
    init_logger();
    let net = Network::new();

    let handles = bootstrap(&net, 1700, 6).await;
    let leaver_endpoint = endpoint(1702);

    let mut events = handles[0].subscribe();

    let (leaving, survivors): (Vec<_>, Vec<_>) = (handles.into_iter())
        .partition(|h| *h.local() == leaver_endpoint);

    leaving[0].leave().await.unwrap();

    let vc = await_view_change(&mut events, 5, CONVERGE).await;
    assert!(vc
        .status_changes
        .iter()
        .any(|c| c.endpoint == leaver_endpoint && c.status == EdgeStatus::Down));

    for handle in &survivors {
        let members = await_members(handle, 5, CONVERGE).await;
        assert!(!members.contains(&leaver_endpoint));
    }

    // the leaver is free to go once the survivors have moved on.
    net.kill(&leaver_endpoint);
    leaving[0].shutdown().await.unwrap();

    // a leave does not retire the endpoint forever: it can rejoin under a
    // fresh id.
    let rejoined = member()
        .join(leaver_endpoint.clone(), endpoint(1700), net.clone())
        .await
        .unwrap();
    net.register(rejoined.clone());

    await_members(&rejoined, 6, CONVERGE).await;
    for handle in &survivors {
        await_members(handle, 6, CONVERGE).await;
    }
}
