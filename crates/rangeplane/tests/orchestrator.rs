//! End-to-end orchestrator scenarios against the mock backend.
//!
//! The orchestrator is the most critical part of the controller: when it
//! misbehaves, storage nodes end up in combinations of state they cannot
//! recover from. So these tests are deliberately verbose. The four primitive
//! operations (place, move, split, join) each get a short variant (tick to
//! stable, check the outcome) and a stepwise variant (assert the exact
//! commands and state after every tick), plus failure-injection variants for
//! each command that can go wrong.

mod common;

use common::{world, World};
use rangeplane::error::Error;
use rangeplane::range::{Action, RemoteState};

// ---- Place ----

#[tokio::test]
async fn place() {
    let w: World = world().range(1, "", "", &[]).node("aaa", &[]).build();

    // First tick: a placement is created on the only node, and the prepare
    // command is sent and succeeds. The roster learns the remote state, but
    // the keyspace doesn't consume it until the next tick.
    w.tick().await;
    assert_eq!(w.commands(), "Prepare(R1, aaa)");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Pending}");
    assert_eq!(w.ros_str(), "{aaa [1:Inactive]}");

    // Second: the keyspace adopts the remote state. No traffic.
    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Inactive}");
    assert_eq!(w.ros_str(), "{aaa [1:Inactive]}");

    // Third: activation.
    w.tick().await;
    assert_eq!(w.commands(), "Activate(R1, aaa)");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Inactive}");
    assert_eq!(w.ros_str(), "{aaa [1:Active]}");

    // Fourth: adopted. Steady state.
    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Active}");

    w.require_stable().await;
}

#[tokio::test]
async fn place_short() {
    let w = world().range(1, "", "", &[]).node("aaa", &[]).build();
    w.tick_until_stable().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Active}");
    assert_eq!(w.ros_str(), "{aaa [1:Active]}");
}

#[tokio::test]
async fn place_slow_node() {
    let w = world()
        .range(1, "", "", &[])
        .node("aaa", &[])
        .strict()
        .build();

    let prepare = w.backend.inject("aaa", 1, Action::Prepare);
    prepare.respond(RemoteState::Preparing);

    // The node reports Preparing; we keep re-sending the idempotent command.
    w.tick().await;
    assert_eq!(w.commands(), "Prepare(R1, aaa)");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Pending}");
    assert_eq!(w.ros_str(), "{aaa [1:Preparing]}");

    w.tick().await;
    assert_eq!(w.commands(), "Prepare(R1, aaa)");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Pending}");

    // Preparation finishes remotely; the retry observes it.
    prepare.respond(RemoteState::Inactive);
    w.tick().await;
    assert_eq!(w.commands(), "Prepare(R1, aaa)");
    assert_eq!(w.ros_str(), "{aaa [1:Inactive]}");

    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Inactive}");

    // Same dance for a slow activation.
    let activate = w.backend.inject("aaa", 1, Action::Activate);
    activate.respond(RemoteState::Activating);

    w.tick().await;
    assert_eq!(w.commands(), "Activate(R1, aaa)");
    assert_eq!(w.ros_str(), "{aaa [1:Activating]}");

    activate.respond(RemoteState::Active);
    w.tick().await;
    assert_eq!(w.commands(), "Activate(R1, aaa)");
    assert_eq!(w.ros_str(), "{aaa [1:Active]}");

    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Active}");

    w.require_stable().await;
}

#[tokio::test]
async fn place_failure_prepare_picks_another_node() {
    let w = world()
        .range(1, "", "", &[])
        .node("aaa", &[])
        .node("bbb", &[])
        .build();

    w.backend.inject("aaa", 1, Action::Prepare).fail();

    w.tick_until_stable().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=bbb:Active}");
    assert_eq!(w.ros_str(), "{aaa []} {bbb [1:Active]}");
}

#[tokio::test]
async fn place_failure_activate_picks_another_node() {
    let w = world()
        .range(1, "", "", &[])
        .node("aaa", &[])
        .node("bbb", &[])
        .build();

    // Prepare succeeds on aaa, but it never manages to serve.
    w.backend.inject("aaa", 1, Action::Activate).fail();

    w.tick_until_stable().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=bbb:Active}");
    assert_eq!(w.ros_str(), "{aaa []} {bbb [1:Active]}");
}

// ---- Move ----

#[tokio::test]
async fn move_range() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .build();
    w.require_stable().await;

    let rx = w.move_op(1, "bbb");

    // A replacement placement appears and prepares on the destination.
    w.tick().await;
    assert_eq!(w.commands(), "Prepare(R1, bbb)");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Active p0=aaa:Active p1=bbb:Pending:replacing(aaa)}"
    );
    assert_eq!(w.ros_str(), "{aaa [1:Active]} {bbb [1:Inactive]}");

    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Active p0=aaa:Active p1=bbb:Inactive:replacing(aaa)}"
    );

    // The source steps down only once the replacement is prepared.
    w.tick().await;
    assert_eq!(w.commands(), "Deactivate(R1, aaa)");
    assert_eq!(w.ros_str(), "{aaa [1:Inactive]} {bbb [1:Inactive]}");

    // The replacement takes over as soon as the source is observed down.
    w.tick().await;
    assert_eq!(w.commands(), "Activate(R1, bbb)");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Active p0=aaa:Inactive p1=bbb:Inactive:replacing(aaa)}"
    );
    assert_eq!(w.ros_str(), "{aaa [1:Inactive]} {bbb [1:Active]}");

    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Active p0=aaa:Inactive p1=bbb:Active:replacing(aaa)}"
    );

    // The replaced copy is discarded.
    w.tick().await;
    assert_eq!(w.commands(), "Drop(R1, aaa)");
    assert_eq!(w.ros_str(), "{aaa []} {bbb [1:Active]}");

    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Active p0=aaa:Dropped p1=bbb:Active:replacing(aaa)}"
    );

    // Destroyed, then the stale annotation is cleaned up.
    w.tick().await;
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Active p0=bbb:Active:replacing(aaa)}"
    );
    w.tick().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=bbb:Active}");

    w.require_stable().await;
    assert!(matches!(rx.await, Ok(Ok(()))));
}

#[tokio::test]
async fn move_short() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .build();

    let rx = w.move_op(1, "bbb");
    w.tick_until_stable().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=bbb:Active}");
    assert_eq!(w.ros_str(), "{aaa []} {bbb [1:Active]}");
    assert!(matches!(rx.await, Ok(Ok(()))));
}

#[tokio::test]
async fn move_failure_prepare_keeps_source() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .build();

    w.backend.inject("bbb", 1, Action::Prepare).fail();
    let rx = w.move_op(1, "bbb");

    // Three attempts at preparing the destination, all failing.
    for _ in 0..3 {
        w.tick().await;
        assert_eq!(w.commands(), "Prepare(R1, bbb)");
        assert_eq!(
            w.ks_str(),
            "{1 [-inf, +inf) Active p0=aaa:Active p1=bbb:Pending:replacing(aaa)}"
        );
    }

    // The failures are on the record for the operator to see.
    {
        let cat = w.ks.lock();
        assert!(matches!(
            cat.placement(1, 1).unwrap().last_error,
            Some(Error::RpcFailed {
                action: Action::Prepare,
                ..
            })
        ));
    }

    // Budget exhausted: the replacement is abandoned and destroyed. The
    // source never stopped serving.
    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Active p0=aaa:Active p1=bbb:GiveUp:replacing(aaa)}"
    );

    w.tick().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Active}");

    w.require_stable().await;
    // The handle died with the placement; the operator sees a closed channel.
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn move_failure_activate_reverts_to_source() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .build();

    w.backend.inject("bbb", 1, Action::Activate).fail();
    let _rx = w.move_op(1, "bbb");

    w.tick_until_stable().await;
    // The move failed; the source serves again and the destination copy is
    // gone.
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=aaa:Active}");
    assert_eq!(w.ros_str(), "{aaa [1:Active]} {bbb []}");
}

#[tokio::test]
async fn move_failure_drop_retries_until_operator_unsticks() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .build();

    w.backend.inject("aaa", 1, Action::Drop).fail();
    let _rx = w.move_op(1, "bbb");

    // Run the move up to the point where the old copy should be discarded.
    w.tick_until(|ks, ros| {
        ks == "{1 [-inf, +inf) Active p0=aaa:Inactive p1=bbb:Active:replacing(aaa)}"
            && ros == "{aaa [1:Inactive]} {bbb [1:Active]}"
    })
    .await;

    // Dropping data is never abandoned; the command repeats indefinitely.
    for _ in 0..5 {
        w.tick().await;
        assert_eq!(w.commands(), "Drop(R1, aaa)");
        assert_eq!(
            w.ks_str(),
            "{1 [-inf, +inf) Active p0=aaa:Inactive p1=bbb:Active:replacing(aaa)}"
        );
    }

    // Pretend an operator fixed the node.
    w.backend.inject("aaa", 1, Action::Drop).succeed();
    w.tick_until_stable().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=bbb:Active}");
    assert_eq!(w.ros_str(), "{aaa []} {bbb [1:Active]}");
}

#[tokio::test]
async fn move_unknown_range_is_rejected() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .build();

    let rx = w.move_op(99, "aaa");
    w.tick().await;
    assert!(matches!(rx.await, Ok(Err(Error::NotFound(_)))));
}

// ---- Split ----

#[tokio::test]
async fn split() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .build();
    w.require_stable().await;

    let rx = w.split_op(1, "ccc");

    // The split lands in the catalog immediately; the children get pending
    // placements but are not ticked until the next pass.
    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Subsuming p0=aaa:Active} \
         {2 [-inf, ccc) Active p0=aaa:Pending} \
         {3 [ccc, +inf) Active p0=aaa:Pending}"
    );
    assert_eq!(w.ops_str(), "{Split 1 -> 2,3}");

    w.tick().await;
    assert_eq!(w.commands(), "Prepare(R2, aaa), Prepare(R3, aaa)");
    assert_eq!(w.ros_str(), "{aaa [1:Active 2:Inactive 3:Inactive]}");

    w.tick().await;
    assert_eq!(w.commands(), "");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Subsuming p0=aaa:Active} \
         {2 [-inf, ccc) Active p0=aaa:Inactive} \
         {3 [ccc, +inf) Active p0=aaa:Inactive}"
    );

    // Both children prepared: the parent steps down.
    w.tick().await;
    assert_eq!(w.commands(), "Deactivate(R1, aaa)");
    assert_eq!(w.ros_str(), "{aaa [1:Inactive 2:Inactive 3:Inactive]}");

    // Parent observed down: both children take over.
    w.tick().await;
    assert_eq!(w.commands(), "Activate(R2, aaa), Activate(R3, aaa)");
    assert_eq!(w.ros_str(), "{aaa [1:Inactive 2:Active 3:Active]}");

    w.tick().await;
    assert_eq!(w.commands(), "");

    // Children serving: the parent's copy is discarded.
    w.tick().await;
    assert_eq!(w.commands(), "Drop(R1, aaa)");
    assert_eq!(w.ros_str(), "{aaa [2:Active 3:Active]}");

    w.tick_until_stable().await;
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Obsolete} \
         {2 [-inf, ccc) Active p0=aaa:Active} \
         {3 [ccc, +inf) Active p0=aaa:Active}"
    );
    assert_eq!(w.ops_str(), "");
    assert!(matches!(rx.await, Ok(Ok(()))));
}

#[tokio::test]
async fn split_failure_prepare_picks_another_node() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .node("ccc", &[])
        .build();

    // Both children land on bbb (least loaded); preparing the left child
    // there always fails.
    w.backend.inject("bbb", 2, Action::Prepare).fail();
    let rx = w.split_op(1, "mmm");

    w.tick_until_stable().await;
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Obsolete} \
         {2 [-inf, mmm) Active p0=ccc:Active} \
         {3 [mmm, +inf) Active p0=bbb:Active}"
    );
    assert_eq!(w.ros_str(), "{aaa []} {bbb [3:Active]} {ccc [2:Active]}");
    assert!(matches!(rx.await, Ok(Ok(()))));
}

#[tokio::test]
async fn split_failure_activate_inverts_and_replaces() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .node("ccc", &[])
        .build();

    // Both children prepare on bbb; the left child can never activate there.
    w.backend.inject("bbb", 2, Action::Activate).fail();
    let rx = w.split_op(1, "mmm");

    // The failure inverts the operation: the serving child steps down and
    // the parent is reactivated so the keyspace keeps an authority.
    w.tick_until(|ks, _| ks.contains("{1 [-inf, +inf) Subsuming p0=aaa:Active}"))
        .await;
    assert_eq!(w.ops_str(), "{Split 1 <- 2,3}");

    // Then the failed copy is discarded, the operation flips forward again,
    // and the left child is re-placed on a node that hasn't failed it.
    w.tick_until_stable().await;
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, +inf) Obsolete} \
         {2 [-inf, mmm) Active p0=ccc:Active} \
         {3 [mmm, +inf) Active p0=bbb:Active}"
    );
    assert_eq!(w.ros_str(), "{aaa []} {bbb [3:Active]} {ccc [2:Active]}");
    assert_eq!(w.ops_str(), "");
    assert!(matches!(rx.await, Ok(Ok(()))));
}

#[tokio::test]
async fn split_key_outside_range_is_rejected() {
    let w = world()
        .range(1, "", "mmm", &["aaa"])
        .range(2, "mmm", "", &["bbb"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[(2, RemoteState::Active)])
        .build();

    let rx = w.split_op(1, "zzz");
    w.tick().await;
    assert!(matches!(rx.await, Ok(Err(Error::TransitionRejected(_)))));
    w.tick_until_stable().await;
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, mmm) Active p0=aaa:Active} {2 [mmm, +inf) Active p0=bbb:Active}"
    );
}

// ---- Join ----

#[tokio::test]
async fn join() {
    let w = world()
        .range(1, "", "ggg", &["aaa"])
        .range(2, "ggg", "", &["bbb"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[(2, RemoteState::Active)])
        .node("ccc", &[])
        .build();
    w.require_stable().await;

    let rx = w.join_op(1, 2, "ccc");

    // The joined range exists and prepares within the first tick.
    w.tick().await;
    assert_eq!(w.commands(), "Prepare(R3, ccc)");
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, ggg) Subsuming p0=aaa:Active} \
         {2 [ggg, +inf) Subsuming p0=bbb:Active} \
         {3 [-inf, +inf) Active p0=ccc:Pending}"
    );
    assert_eq!(w.ops_str(), "{Join 1,2 -> 3}");

    w.tick().await;
    assert_eq!(w.commands(), "");

    // Both parents step down together.
    w.tick().await;
    assert_eq!(w.commands(), "Deactivate(R1, aaa), Deactivate(R2, bbb)");
    assert_eq!(
        w.ros_str(),
        "{aaa [1:Inactive]} {bbb [2:Inactive]} {ccc [3:Inactive]}"
    );

    // Both parents observed down: the joined range takes over.
    w.tick().await;
    assert_eq!(w.commands(), "Activate(R3, ccc)");

    w.tick_until_stable().await;
    assert_eq!(
        w.ks_str(),
        "{1 [-inf, ggg) Obsolete} \
         {2 [ggg, +inf) Obsolete} \
         {3 [-inf, +inf) Active p0=ccc:Active}"
    );
    assert_eq!(w.ros_str(), "{aaa []} {bbb []} {ccc [3:Active]}");
    assert_eq!(w.ops_str(), "");
    assert!(matches!(rx.await, Ok(Ok(()))));
}

#[tokio::test]
async fn join_non_adjacent_is_rejected() {
    let w = world()
        .range(1, "", "ggg", &["aaa"])
        .range(2, "ggg", "", &["bbb"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[(2, RemoteState::Active)])
        .build();

    // Right-then-left is not adjacency.
    let rx = w.join_op(2, 1, "aaa");
    w.tick().await;
    assert!(matches!(rx.await, Ok(Err(Error::TransitionRejected(_)))));
}

// ---- Liveness and stability ----

#[tokio::test]
async fn stable_system_stays_silent() {
    let w = world()
        .range(1, "", "mmm", &["aaa"])
        .range(2, "mmm", "", &["bbb"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[(2, RemoteState::Active)])
        .build();

    let before = (w.ks_str(), w.ros_str());
    for _ in 0..5 {
        w.tick().await;
        assert_eq!(w.commands(), "");
    }
    assert_eq!((w.ks_str(), w.ros_str()), before);
}

#[tokio::test]
async fn expired_node_placement_is_replaced() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .expire_after(std::time::Duration::from_millis(50))
        .build();

    // aaa goes dark; only bbb keeps appearing in discovery.
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    w.roster.observe("bbb".to_string(), "127.0.0.1:5002".to_string());

    w.tick_until_stable().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=bbb:Active}");

    // Once its last placement is gone, the expired node is torn down.
    {
        let cat = w.ks.lock();
        w.roster.purge_stale(&cat);
    }
    assert_eq!(w.ros_str(), "{bbb [1:Active]}");
}

#[tokio::test]
async fn draining_node_sheds_placements() {
    let w = world()
        .range(1, "", "", &["aaa"])
        .node("aaa", &[(1, RemoteState::Active)])
        .node("bbb", &[])
        .build();
    w.require_stable().await;

    w.roster.set_drain(&"aaa".to_string(), true);
    w.tick_until_stable().await;
    assert_eq!(w.ks_str(), "{1 [-inf, +inf) Active p0=bbb:Active}");
    assert_eq!(w.ros_str(), "{aaa []} {bbb [1:Active]}");
}
