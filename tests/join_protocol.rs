// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
mod shared;

use shared::{await_members, endpoint, init_logger, member};
use skein::simulation::Network;
use std::time::Duration;
use tokio::task::JoinSet;

const CONVERGE: Duration = Duration::from_secs(30);

/// A single seed admits one joiner; both converge on the same two-member
/// configuration.
#[tokio::test(flavor = "multi_thread")]
async fn single_seed_and_one_joiner() {
    init_logger();
    let net = Network::new();

    let seed = member().start(endpoint(1234), net.clone()).unwrap();
    net.register(seed.clone());

    let joiner = member()
        .join(endpoint(1235), endpoint(1234), net.clone())
        .await
        .unwrap();
    net.register(joiner.clone());

    let a = await_members(&seed, 2, CONVERGE).await;
    let b = await_members(&joiner, 2, CONVERGE).await;

    // identical membership, in identical ring-0 order.
    assert_eq!(a, b);
    assert!(a.contains(&endpoint(1234)));
    assert!(a.contains(&endpoint(1235)));

    let ca = seed.configuration().await.unwrap();
    let cb = joiner.configuration().await.unwrap();
    assert_eq!(ca.configuration_id, cb.configuration_id);
    assert_eq!(ca.endpoints, cb.endpoints);
}

/// Ten sequential joiners; after each join, every member agrees on the
/// grown configuration.
#[tokio::test(flavor = "multi_thread")]
async fn ten_sequential_joiners() {
    init_logger();
    let net = Network::new();

    let seed = member().start(endpoint(1300), net.clone()).unwrap();
    net.register(seed.clone());

    let mut handles = vec![seed];

    for i in 1..=10u16 {
        let joiner = member()
            .join(endpoint(1300 + i), endpoint(1300), net.clone())
            .await
            .unwrap();
        net.register(joiner.clone());
        handles.push(joiner);

        for handle in &handles {
            await_members(handle, i as usize + 1, CONVERGE).await;
        }

        let expected = handles[0].configuration().await.unwrap();
        for handle in &handles[1..] {
            let config = handle.configuration().await.unwrap();
            assert_eq!(config.configuration_id, expected.configuration_id);
            assert_eq!(config.endpoints, expected.endpoints);
        }
    }
}

/// Fifty concurrent joiners against a single seed. Once the system
/// quiesces, all fifty-one members agree, and every member holds every
/// other member's metadata.
#[tokio::test(flavor = "multi_thread")]
async fn fifty_concurrent_joiners() {
    init_logger();
    let net = Network::new();

    let seed = member()
        .add_metadata([("port".to_owned(), b"1400".to_vec())])
        .start(endpoint(1400), net.clone())
        .unwrap();
    net.register(seed.clone());

    let mut joins = JoinSet::new();
    for i in 1..=50u16 {
        let net = net.clone();

        joins.spawn(async move {
            let joiner = member()
                .join_attempts(100)
                .add_metadata([("port".to_owned(), format!("{}", 1400 + i).into_bytes())])
                .join(endpoint(1400 + i), endpoint(1400), net.clone())
                .await
                .expect("join");

            net.register(joiner.clone());
            joiner
        });
    }

    let mut handles = vec![seed];
    while let Some(joined) = joins.join_next().await {
        handles.push(joined.unwrap());
    }
    assert_eq!(handles.len(), 51);

    let deadline = Duration::from_secs(120);
    for handle in &handles {
        await_members(handle, 51, deadline).await;
    }

    let expected = handles[0].configuration().await.unwrap();
    for handle in &handles {
        let config = handle.configuration().await.unwrap();
        assert_eq!(config.configuration_id, expected.configuration_id);
        assert_eq!(config.endpoints, expected.endpoints);

        let metadata = handle.cluster_metadata().await.unwrap();
        assert_eq!(metadata.len(), 51);
    }
}

/// A joiner that reuses an id is told to pick a fresh one, and still gets
/// in.
#[tokio::test(flavor = "multi_thread")]
async fn join_is_rejected_while_endpoint_is_occupied() {
    init_logger();
    let net = Network::new();

    let seed = member().start(endpoint(1500), net.clone()).unwrap();
    net.register(seed.clone());

    let joiner = member()
        .join(endpoint(1501), endpoint(1500), net.clone())
        .await
        .unwrap();
    net.register(joiner.clone());
    await_members(&seed, 2, CONVERGE).await;

    // the same endpoint under a new incarnation is occupied until the old
    // one is ejected; the join must exhaust its attempts.
    let occupied = member()
        .join_attempts(2)
        .join_delay(Duration::from_millis(50))
        .join(endpoint(1501), endpoint(1500), net.clone())
        .await;

    assert!(occupied.is_err());
}
