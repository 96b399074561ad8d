// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Shared code referred to by multiple test modules.
#![allow(dead_code)]

use skein::cluster::cut::{ClusterEvent, ViewChange};
use skein::{Cluster, Endpoint, Handle};
use std::time::Duration;
use tokio::{sync::broadcast, time};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn endpoint(port: u16) -> Endpoint {
    Endpoint::new(vec![127, 0, 0, 1], port as i32)
}

/// A member configured for fast convergence in tests.
pub fn member() -> Cluster {
    Cluster::low_latency()
}

/// Poll `handle` until its member list has `n` entries.
pub async fn await_members(handle: &Handle, n: usize, deadline: Duration) -> Vec<Endpoint> {
    let started = time::Instant::now();

    loop {
        let members = handle.member_list().await.expect("member_list");
        if members.len() == n {
            return members;
        }

        if started.elapsed() > deadline {
            panic!(
                "{} saw {} member(s), expected {}",
                handle.local(),
                members.len(),
                n
            );
        }

        time::sleep(Duration::from_millis(25)).await;
    }
}

/// Read events until a view change with `n` members arrives.
pub async fn await_view_change(
    events: &mut broadcast::Receiver<ClusterEvent>,
    n: usize,
    deadline: Duration,
) -> ViewChange {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::ViewChange(vc)) if vc.members.len() == n => return vc,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    panic!("event stream lagged by {}", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };

    match time::timeout(deadline, wait).await {
        Ok(vc) => vc,
        Err(_) => panic!("no view change with {} member(s) within {:?}", n, deadline),
    }
}
