//! Tests for session setup and teardown.

use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::directory::Instance;
use crate::fleet::NodeRole;
use crate::reconcile::reconcile;
use crate::test_support::{FakeConnector, FakeEvent};

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

fn node(workspace: &Workspace, name: &str) -> FleetNode {
    FleetNode::new(
        name,
        NodeRole::Validator,
        workspace.root.join("payload"),
        workspace.root.join(format!("{name}.log")),
    )
}

fn live(name: &str, last_octet: u8) -> Instance {
    Instance::new(u64::from(last_octet), name)
        .with_tag("devnet")
        .with_public_ipv4(Ipv4Addr::new(192, 0, 2, last_octet))
}

fn bound_fleet(workspace: &Workspace, names: &[&str]) -> Fleet {
    let declared = Fleet::new(
        "devnet",
        "aa:bb",
        names.iter().map(|name| node(workspace, name)),
    );
    let instances: Vec<_> = names
        .iter()
        .zip(1_u8..)
        .map(|(name, octet)| live(name, octet))
        .collect();
    reconcile(&declared, &instances).unwrap_or_else(|err| panic!("reconcile: {err}"))
}

#[rstest]
fn opens_one_session_per_bound_node(workspace: Workspace) {
    let declared = Fleet::new(
        "devnet",
        "aa:bb",
        ["node1", "node2", "node3"].map(|name| node(&workspace, name)),
    );
    let fleet = reconcile(&declared, &[live("node1", 1), live("node3", 3)])
        .unwrap_or_else(|err| panic!("reconcile: {err}"));
    let connector = FakeConnector::new();
    let manager = SessionManager::new(connector.clone());

    let mut pool = manager
        .open_all(&fleet)
        .unwrap_or_else(|err| panic!("open_all: {err}"));

    assert_eq!(pool.names().collect::<Vec<_>>(), vec!["node1", "node3"]);
    assert_eq!(
        pool.get("node3").map(RemoteSession::address),
        Some(IpAddr::from(Ipv4Addr::new(192, 0, 2, 3)))
    );
    assert_eq!(connector.open_connections().len(), 2);
    assert!(workspace.root.join("node1.log").exists());
    assert!(!workspace.root.join("node2.log").exists());

    let report = manager.close_all(&mut pool);
    assert!(report.is_clean());
    assert_eq!(report.closed, 2);
}

#[rstest]
fn opening_an_unbound_fleet_yields_an_empty_pool(workspace: Workspace) {
    let fleet = Fleet::new("devnet", "aa:bb", [node(&workspace, "node1")]);
    let manager = SessionManager::new(FakeConnector::new());

    let pool = manager
        .open_all(&fleet)
        .unwrap_or_else(|err| panic!("open_all: {err}"));

    assert!(pool.is_empty());
}

#[rstest]
#[case::first("node1")]
#[case::middle("node2")]
#[case::last("node3")]
fn connect_failure_closes_sessions_already_opened(workspace: Workspace, #[case] failing: &str) {
    let fleet = bound_fleet(&workspace, &["node1", "node2", "node3"]);
    let connector = FakeConnector::new().fail_connect_for(failing);
    let manager = SessionManager::new(connector.clone());

    let err = manager
        .open_all(&fleet)
        .expect_err("connect failure should abort setup");

    assert!(
        matches!(&err, SessionError::Connect { node, .. } if node == failing),
        "unexpected error: {err}"
    );
    assert!(connector.open_connections().is_empty());
}

#[rstest]
fn sink_failure_closes_sessions_already_opened(workspace: Workspace) {
    let declared = Fleet::new(
        "devnet",
        "aa:bb",
        [
            node(&workspace, "node1"),
            FleetNode::new(
                "node2",
                NodeRole::Full,
                workspace.root.join("payload"),
                workspace.root.join("missing/node2.log"),
            ),
        ],
    );
    let fleet = reconcile(&declared, &[live("node1", 1), live("node2", 2)])
        .unwrap_or_else(|err| panic!("reconcile: {err}"));
    let connector = FakeConnector::new();
    let manager = SessionManager::new(connector.clone());

    let err = manager
        .open_all(&fleet)
        .expect_err("missing output directory should abort setup");

    assert!(matches!(err, SessionError::OutputSink { ref node, .. } if node == "node2"));
    assert_eq!(connector.close_count("node1"), 1);
    assert!(connector.open_connections().is_empty());
}

#[rstest]
fn bound_instance_without_address_is_rejected(workspace: Workspace) {
    let declared = Fleet::new("devnet", "aa:bb", [node(&workspace, "node1")]);
    let fleet = reconcile(
        &declared,
        &[Instance::new(7, "node1").with_tag("devnet")],
    )
    .unwrap_or_else(|err| panic!("reconcile: {err}"));
    let connector = FakeConnector::new();
    let manager = SessionManager::new(connector.clone());

    let err = manager
        .open_all(&fleet)
        .expect_err("instance without address should fail");

    assert!(matches!(err, SessionError::MissingAddress { ref node, .. } if node == "node1"));
    assert!(connector.events().is_empty());
}

#[rstest]
fn close_all_continues_past_failures(workspace: Workspace) {
    let fleet = bound_fleet(&workspace, &["node1", "node2", "node3"]);
    let connector = FakeConnector::new().fail_close_for("node2");
    let manager = SessionManager::new(connector.clone());
    let mut pool = manager
        .open_all(&fleet)
        .unwrap_or_else(|err| panic!("open_all: {err}"));

    let report = manager.close_all(&mut pool);

    assert_eq!(report.closed, 3);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failures.first(),
        Some(SessionError::CloseConnection { node, .. }) if node == "node2"
    ));
    for name in ["node1", "node2", "node3"] {
        assert_eq!(connector.close_count(name), 1, "{name} closed once");
    }
    assert_eq!(pool.open_count(), 0);
}

#[rstest]
fn close_all_is_idempotent(workspace: Workspace) {
    let fleet = bound_fleet(&workspace, &["node1", "node2"]);
    let connector = FakeConnector::new();
    let manager = SessionManager::new(connector.clone());
    let mut pool = manager
        .open_all(&fleet)
        .unwrap_or_else(|err| panic!("open_all: {err}"));

    let first = manager.close_all(&mut pool);
    let second = manager.close_all(&mut pool);

    assert_eq!(first.closed, 2);
    assert_eq!(second.closed, 0);
    assert!(second.is_clean());
    assert_eq!(connector.close_count("node1"), 1);
}

#[rstest]
fn dropping_a_pool_closes_its_sessions(workspace: Workspace) {
    let fleet = bound_fleet(&workspace, &["node1", "node2"]);
    let connector = FakeConnector::new();
    let manager = SessionManager::new(connector.clone());

    let pool = manager
        .open_all(&fleet)
        .unwrap_or_else(|err| panic!("open_all: {err}"));
    drop(pool);

    assert!(connector.open_connections().is_empty());
}

#[rstest]
fn session_appends_command_output_to_its_sink(workspace: Workspace) {
    let fleet = bound_fleet(&workspace, &["node1"]);
    let connector = FakeConnector::new();
    let manager = SessionManager::new(connector.clone());
    let mut pool = manager
        .open_all(&fleet)
        .unwrap_or_else(|err| panic!("open_all: {err}"));

    let mut sessions: Vec<_> = pool.into_sessions().collect();
    let session = sessions
        .first_mut()
        .unwrap_or_else(|| panic!("one session expected"));
    session
        .deliver_payload()
        .unwrap_or_else(|err| panic!("deliver: {err}"));
    session
        .run_command("echo ready")
        .unwrap_or_else(|err| panic!("run: {err}"));
    assert!(session.close().is_empty());
    pool = sessions.into_iter().collect();
    assert_eq!(pool.open_count(), 0);

    let log = std::fs::read_to_string(workspace.root.join("node1.log"))
        .unwrap_or_else(|err| panic!("read log: {err}"));
    assert_eq!(log, "node1: echo ready\n");
    assert_eq!(
        connector.events_for("node1"),
        vec![
            FakeEvent::Connected {
                node: String::from("node1"),
            },
            FakeEvent::Delivered {
                node: String::from("node1"),
                payload: workspace.root.join("payload").to_string(),
            },
            FakeEvent::Started {
                node: String::from("node1"),
                command: String::from("echo ready"),
            },
            FakeEvent::Finished {
                node: String::from("node1"),
                command: String::from("echo ready"),
            },
            FakeEvent::Closed {
                node: String::from("node1"),
            },
        ]
    );
}

#[rstest]
fn failing_command_reports_node_and_command(workspace: Workspace) {
    let fleet = bound_fleet(&workspace, &["node1"]);
    let connector = FakeConnector::new().fail_command("node1", "false");
    let manager = SessionManager::new(connector);
    let pool = manager
        .open_all(&fleet)
        .unwrap_or_else(|err| panic!("open_all: {err}"));

    let mut sessions: Vec<_> = pool.into_sessions().collect();
    let session = sessions
        .first_mut()
        .unwrap_or_else(|| panic!("one session expected"));
    let err = session
        .run_command("false")
        .expect_err("command should fail");

    assert_eq!(
        err,
        SessionError::Command {
            node: String::from("node1"),
            command: String::from("false"),
            message: String::from("exited with status 1"),
        }
    );
}
