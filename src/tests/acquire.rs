/* This file is part of Meridian (https://meridian.network)
 *
 * Copyright (C) 2020-2024 Meridian developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    crypto::content_hash,
    ledger::Ledger,
    sync::LEDGER_ACQUIRE_MAX_TIMEOUTS,
    tests::harness::{force_close_with_tx, TestEngine, TestNet, GENESIS_TIME},
    tx::TxEngine,
};

#[test]
fn acquire_ledger_from_peer() {
    let net = TestNet::new(2);

    // The remote node holds a closed ledger with content in both maps
    let body = b"ledger payload".to_vec();
    let tx_id = content_hash(&body);
    let remote = force_close_with_tx(&net.nodes[1], &body, GENESIS_TIME + 10);

    let local = &net.nodes[0];
    let now_ms = local.env.clock.monotonic_ms();
    let acquire = local.env.acquires.find_create(remote.hash(), now_ms);

    // The whole request/reply conversation settles without timers
    net.pump();

    assert!(acquire.is_complete());
    assert!(acquire.have_base() && acquire.have_tx_set() && acquire.have_state());
    let assembled = acquire.ledger().unwrap();
    assert_eq!(assembled.hash(), remote.hash());
    assert!(assembled.tx_map().has_item(&tx_id));
    assert!(!assembled.is_acquiring());

    // Callbacks registered after completion still fire, inline
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_ = fired.clone();
    acquire.add_on_complete(Box::new(move |job| {
        assert!(job.is_complete());
        fired_.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // A second acquisition of the same hash now completes locally: the
    // sync filters wrote every node through to the object store
    local.env.acquires.drop_ledger(&remote.hash());
    let second = local.env.acquires.find_create(remote.hash(), now_ms);
    assert!(second.is_complete(), "local fetch should satisfy the job without the network");
}

#[test]
fn find_create_deduplicates() {
    let net = TestNet::new(2);
    let remote = force_close_with_tx(&net.nodes[1], b"dedup", GENESIS_TIME + 10);

    let local = &net.nodes[0];
    let first = local.env.acquires.find_create(remote.hash(), 0);
    let again = local.env.acquires.find_create(remote.hash(), 0);
    assert!(Arc::ptr_eq(&first, &again));

    local.env.acquires.drop_ledger(&remote.hash());
    assert!(local.env.acquires.find(&remote.hash()).is_none());
}

#[test]
fn stuck_peers_fail_the_acquisition() {
    let net = TestNet::new(2);
    let local = &net.nodes[0];

    // A ledger nobody will serve: built here, never installed anywhere
    let genesis = local.env.ledgers.closed_ledger();
    let mut unseen = Ledger::child_open(&genesis, 15, GENESIS_TIME + 5);
    let body = b"unreachable".to_vec();
    let tx_id = content_hash(&body);
    TestEngine.apply(&mut unseen, &tx_id, &body, false);
    let _ = unseen.add_tx(tx_id, body);
    unseen.set_accepted(GENESIS_TIME + 5, 30, true);

    let acquire = local.env.acquires.find_create(unseen.hash(), 0);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_ = fired.clone();
    acquire.add_on_complete(Box::new(move |job| {
        assert!(job.is_failed());
        fired_.fetch_add(1, Ordering::SeqCst);
    }));

    // One peer answers with the base only, then goes quiet
    assert!(acquire.take_base(&unseen.header_bytes()));
    assert!(acquire.have_base());
    assert!(!acquire.is_complete());

    // The base counted as progress, absorbing the first fire. After that,
    // each fire with no progress increments the timeout count exactly
    // once, and the job fails past the cap.
    let mut now_ms = 0;
    for expected in 0..=LEDGER_ACQUIRE_MAX_TIMEOUTS {
        now_ms += 750;
        acquire.tick(now_ms);
        assert_eq!(acquire.timeouts(), expected);
        assert!(!acquire.is_failed());
    }
    now_ms += 750;
    acquire.tick(now_ms);
    assert_eq!(acquire.timeouts(), LEDGER_ACQUIRE_MAX_TIMEOUTS + 1);
    assert!(acquire.is_failed());
    assert!(!acquire.is_complete());
    assert_eq!(fired.load(Ordering::SeqCst), 1, "failure fires callbacks exactly once");

    // Further timer fires stay no-ops
    now_ms += 750;
    acquire.tick(now_ms);
    assert_eq!(acquire.timeouts(), LEDGER_ACQUIRE_MAX_TIMEOUTS + 1);
}
