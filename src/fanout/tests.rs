//! Tests for concurrent delivery and bootstrap.

use std::net::Ipv4Addr;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::directory::Instance;
use crate::fleet::{Fleet, FleetNode, NodeRole};
use crate::reconcile::reconcile;
use crate::session::SessionManager;
use crate::test_support::{FakeConnector, FakeEvent};

const COMMANDS: [&str; 3] = ["c1", "c2", "c3"];

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non UTF-8 tempdir: {}", path.display()));
    Workspace { _dir: dir, root }
}

fn fleet(workspace: &Workspace) -> Fleet {
    let declared = Fleet::new(
        "devnet",
        "aa:bb",
        ["node1", "node2"].map(|name| {
            FleetNode::new(
                name,
                NodeRole::Validator,
                workspace.root.join(format!("payload/{name}")),
                workspace.root.join(format!("{name}.log")),
            )
            .with_commands(COMMANDS)
        }),
    );
    let live = [
        Instance::new(1, "node1")
            .with_tag("devnet")
            .with_public_ipv4(Ipv4Addr::new(192, 0, 2, 1)),
        Instance::new(2, "node2")
            .with_tag("devnet")
            .with_public_ipv4(Ipv4Addr::new(192, 0, 2, 2)),
    ];
    reconcile(&declared, &live).unwrap_or_else(|err| panic!("reconcile: {err}"))
}

fn started(node: &str, command: &str) -> FakeEvent {
    FakeEvent::Started {
        node: node.to_owned(),
        command: command.to_owned(),
    }
}

fn finished(node: &str, command: &str) -> FakeEvent {
    FakeEvent::Finished {
        node: node.to_owned(),
        command: command.to_owned(),
    }
}

fn expected_run(workspace: &Workspace, node: &str) -> Vec<FakeEvent> {
    let mut events = vec![
        FakeEvent::Connected {
            node: node.to_owned(),
        },
        FakeEvent::Delivered {
            node: node.to_owned(),
            payload: workspace.root.join(format!("payload/{node}")).to_string(),
        },
    ];
    for command in COMMANDS {
        events.push(started(node, command));
        events.push(finished(node, command));
    }
    events
}

async fn run(
    workspace: &Workspace,
    connector: &FakeConnector,
) -> (SessionManager<FakeConnector>, FanoutReport, usize) {
    let manager = SessionManager::new(connector.clone());
    let pool = manager
        .open_all(&fleet(workspace))
        .unwrap_or_else(|err| panic!("open_all: {err}"));
    let (mut returned, report) = deliver_and_run(pool).await;
    let remaining = returned.len();
    let teardown = manager.close_all(&mut returned);
    assert!(teardown.is_clean(), "teardown: {:?}", teardown.failures);
    (manager, report, remaining)
}

#[rstest]
#[tokio::test]
async fn delivers_then_runs_commands_in_order(workspace: Workspace) {
    let connector = FakeConnector::new();

    let (_manager, report, remaining) = run(&workspace, &connector).await;

    assert!(report.is_clean());
    assert_eq!(remaining, 2);
    for node in ["node1", "node2"] {
        let mut expected = expected_run(&workspace, node);
        expected.push(FakeEvent::Closed {
            node: node.to_owned(),
        });
        assert_eq!(connector.events_for(node), expected);
        assert_eq!(
            report.host(node),
            Some(&HostReport {
                node: node.to_owned(),
                delivered: true,
                commands_run: 3,
                commands_failed: 0,
            })
        );
    }
}

#[rstest]
#[tokio::test]
async fn command_output_lands_in_each_host_log(workspace: Workspace) {
    let connector = FakeConnector::new();

    let _outcome = run(&workspace, &connector).await;

    let log = std::fs::read_to_string(workspace.root.join("node2.log"))
        .unwrap_or_else(|err| panic!("read log: {err}"));
    assert_eq!(log, "node2: c1\nnode2: c2\nnode2: c3\n");
}

#[rstest]
#[tokio::test]
async fn failing_command_is_isolated_to_its_host(workspace: Workspace) {
    let connector = FakeConnector::new().fail_command("node1", "c2");

    let (_manager, report, _remaining) = run(&workspace, &connector).await;

    assert_eq!(
        report.failures,
        vec![HostFailure::Session(SessionError::Command {
            node: String::from("node1"),
            command: String::from("c2"),
            message: String::from("exited with status 1"),
        })]
    );
    let node1 = connector.events_for("node1");
    assert!(node1.contains(&finished("node1", "c3")));
    assert_eq!(report.failures_for("node2").count(), 0);
    assert_eq!(
        report.host("node1").map(|host| host.commands_failed),
        Some(1)
    );
    assert!(report.host("node2").is_some_and(HostReport::is_clean));
}

#[rstest]
#[tokio::test]
async fn delivery_failure_still_runs_commands(workspace: Workspace) {
    let connector = FakeConnector::new().fail_delivery_for("node2");

    let (_manager, report, _remaining) = run(&workspace, &connector).await;

    let failures: Vec<_> = report.failures_for("node2").collect();
    assert!(matches!(
        failures.as_slice(),
        [HostFailure::Session(SessionError::Delivery { node, .. })] if node == "node2"
    ));
    let node2 = connector.events_for("node2");
    assert!(!node2.iter().any(|event| matches!(event, FakeEvent::Delivered { .. })));
    for command in COMMANDS {
        assert!(node2.contains(&finished("node2", command)));
    }
    assert_eq!(
        report.host("node2").map(|host| (host.delivered, host.commands_run)),
        Some((false, 3))
    );
}

#[rstest]
#[tokio::test]
async fn panicking_worker_is_reported_and_its_session_closed(workspace: Workspace) {
    let connector = FakeConnector::new().panic_on_command("node2", "c2");

    let (_manager, report, remaining) = run(&workspace, &connector).await;

    assert_eq!(remaining, 1);
    assert!(matches!(
        report.failures.as_slice(),
        [HostFailure::WorkerLost { node, message }]
            if node == "node2" && message.contains("scripted panic")
    ));
    assert!(report.host("node2").is_none());
    assert_eq!(connector.close_count("node2"), 1);
    assert!(!connector.events_for("node2").contains(&started("node2", "c3")));
    assert_eq!(
        connector.events_for("node1").last(),
        Some(&FakeEvent::Closed {
            node: String::from("node1"),
        })
    );
    assert!(connector.open_connections().is_empty());
}

#[rstest]
#[tokio::test]
async fn hosts_run_their_commands_at_the_same_time(workspace: Workspace) {
    let connector = FakeConnector::new().rendezvous_on("c2", 2, Duration::from_secs(10));

    let (_manager, report, remaining) = run(&workspace, &connector).await;

    assert!(report.is_clean(), "failures: {:?}", report.failures);
    assert_eq!(remaining, 2);
    for node in ["node1", "node2"] {
        assert!(connector.events_for(node).contains(&finished(node, "c3")));
    }
}

#[tokio::test]
async fn empty_pool_produces_an_empty_report() {
    let pool = SessionPool::<crate::test_support::FakeConnection>::default();

    let (returned, report) = deliver_and_run(pool).await;

    assert!(returned.is_empty());
    assert_eq!(report, FanoutReport::default());
}

#[tokio::test]
async fn task_group_collects_outputs_and_failures() {
    let mut group = TaskGroup::new();
    group.spawn_blocking("a", |_failures| 1_u32);
    group.spawn_blocking("b", |failures| {
        failures.report(HostFailure::WorkerLost {
            node: String::from("b"),
            message: String::from("reported"),
        });
        2_u32
    });
    assert_eq!(group.len(), 2);

    let joined = group.join().await;
    let mut outputs = joined.outputs;
    outputs.sort_unstable();

    assert_eq!(outputs, vec![1, 2]);
    assert_eq!(joined.failures.len(), 1);
}
