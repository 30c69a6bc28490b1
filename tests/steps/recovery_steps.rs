//! Steps for incident detection, recovery and retry behaviour.

use cucumber::{given, then, when};
use relink::{ConnectionId, RecoveryState};

use crate::world::RecoveryWorld;

#[given(expr = "a monitor with error threshold {int} and {int} recovery attempts")]
fn monitor_with_limits(world: &mut RecoveryWorld, threshold: u32, attempts: u32) {
    world.configure(threshold, attempts);
}

#[given(expr = "reconnects keep failing")]
fn reconnects_fail(world: &mut RecoveryWorld) { world.fail_reconnects(16); }

#[given(expr = "{int} messages are pending for connection {int}")]
fn messages_pending(world: &mut RecoveryWorld, count: usize, connection: u64) {
    world.queue_messages(ConnectionId::new(connection), count);
}

#[given(expr = "the sender rejects {string}")]
fn sender_rejects(world: &mut RecoveryWorld, id: String) { world.reject(&id); }

#[when(expr = "{int} session errors are reported for connection {int}")]
async fn report_errors(world: &mut RecoveryWorld, count: u32, connection: u64) {
    world.report_errors(ConnectionId::new(connection), count).await;
}

#[when(expr = "recovery is requested for connection {int}")]
async fn request_recovery(world: &mut RecoveryWorld, connection: u64) {
    world.recover(ConnectionId::new(connection)).await;
}

#[when(expr = "the sweep runs {int} minutes later")]
fn sweep_later(world: &mut RecoveryWorld, minutes: u64) { world.sweep_after(minutes); }

#[then(expr = "connection {int} was reconnected {int} time(s)")]
fn reconnected(world: &mut RecoveryWorld, connection: u64, times: usize) {
    assert_eq!(world.reconnects(ConnectionId::new(connection)), times);
}

#[then(expr = "connection {int} is healthy")]
fn healthy(world: &mut RecoveryWorld, connection: u64) {
    let state = world.state(ConnectionId::new(connection)).map(|(state, _)| state);
    assert_eq!(state, Some(RecoveryState::Healthy));
}

#[then(expr = "connection {int} is exhausted after {int} attempts")]
fn exhausted(world: &mut RecoveryWorld, connection: u64, attempts: u32) {
    assert_eq!(
        world.state(ConnectionId::new(connection)),
        Some((RecoveryState::Exhausted, attempts))
    );
}

#[then(expr = "the operator was notified {int} time(s) about connection {int}")]
fn notified(world: &mut RecoveryWorld, times: usize, connection: u64) {
    assert_eq!(world.notifications(ConnectionId::new(connection)), times);
}

#[then(expr = "messages were resent in order {string}")]
fn resent_in_order(world: &mut RecoveryWorld, order: String) {
    let expected: Vec<String> = order.split(',').map(str::to_owned).collect();
    assert_eq!(world.attempted(), expected);
}

#[then(expr = "{int} message(s) remain(s) pending")]
fn remaining(world: &mut RecoveryWorld, count: usize) { assert_eq!(world.pending(), count); }

#[then(expr = "{int} stale message(s) was/were removed")]
fn swept(world: &mut RecoveryWorld, count: usize) { assert_eq!(world.swept_messages(), count); }
