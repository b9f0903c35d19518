//! Orchestrator tests against an in-memory provisioning backend.
//!
//! Run with: cargo test --test orchestrator_test

mod common;

use std::time::Duration;

use common::{MockProvisioner, ReadOnlyRegistry};
use serde_json::json;
use stackup_deploy::{
    AbortSignal, Arg, ConfigurationError, DeploymentGraph, EXIT_ABORTED, EXIT_FAILURE,
    EXIT_WIRING_FAILURE, FailurePolicy, FileRegistry, InvokeError, MemoryRegistry, Orchestrator,
    ProvisionError, RegistryEntry, ResourceRegistry, ResourceStep, RunOptions, StepStatus,
    WiringCall, WiringExitPolicy, WiringFailureKind,
};
use tempdir::TempDir;

const NETWORK: &str = "localhost";
const DEV_ADDRESS: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

fn orchestrator(
    mock: &MockProvisioner,
    registry: MemoryRegistry,
) -> Orchestrator<MockProvisioner, MemoryRegistry> {
    Orchestrator::new(NETWORK, mock.clone(), registry)
}

/// `A`, then `B` taking `A`'s address.
fn chain_graph() -> DeploymentGraph {
    DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B").arg(Arg::reference("A")))
}

#[tokio::test]
async fn test_dependent_step_receives_address() {
    let mock = MockProvisioner::new();
    let orchestrator = orchestrator(&mock, MemoryRegistry::new());

    let report = orchestrator
        .run(&chain_graph(), &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Deployed);
    assert_eq!(report.address("A"), Some("0xA1"));
    assert_eq!(report.step("B").unwrap().status, StepStatus::Deployed);
    assert_eq!(report.address("B"), Some("0xB1"));
    assert_eq!(mock.create_args("B"), Some(vec![json!("0xA1")]));
    assert_eq!(report.exit_code(WiringExitPolicy::FailOnAny), 0);

    // Both addresses are durable.
    let registry = orchestrator.registry();
    assert_eq!(
        registry.lookup(NETWORK, "B").unwrap().map(|e| e.address),
        Some("0xB1".to_string())
    );
    assert_eq!(
        registry.lookup(NETWORK, "A").unwrap().and_then(|e| e.tx_hash),
        Some("0xtxA".to_string())
    );
}

#[tokio::test]
async fn test_recorded_step_is_skipped_and_reused() {
    let mock = MockProvisioner::new();
    let registry = MemoryRegistry::new().with_entry(NETWORK, RegistryEntry::new("A", "0xA1"));
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A").skip_if_already_deployed(true))
        .step(ResourceStep::new("B").arg(Arg::reference("A")));

    let report = orchestrator(&mock, registry)
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Skipped);
    assert_eq!(report.address("A"), Some("0xA1"));
    assert_eq!(report.step("B").unwrap().status, StepStatus::Deployed);
    assert_eq!(mock.created(), vec!["B"]);
    assert_eq!(mock.create_args("B"), Some(vec![json!("0xA1")]));
}

#[tokio::test]
async fn test_already_configured_wiring_is_soft_failure() {
    let mock = MockProvisioner::new().fail_invoke(
        "configure(address)",
        InvokeError::AlreadyApplied("already configured".to_string()),
    );
    let graph = DeploymentGraph::default().step(
        ResourceStep::new("A")
            .wire(WiringCall::new("A", "configure(address)").arg(Arg::literal(DEV_ADDRESS))),
    );

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    let a = report.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Deployed);
    assert_eq!(a.wiring_applied, 0);
    assert_eq!(a.wiring_failures.len(), 1);
    assert_eq!(a.wiring_failures[0].call, "A.configure(address)");
    assert_eq!(a.wiring_failures[0].kind, WiringFailureKind::AlreadyApplied);
    assert!(a.wiring_failures[0].reason.contains("already configured"));

    assert_eq!(mock.invoked(), vec![("0xA1".to_string(), "configure(address)".to_string())]);
    assert!(report.succeeded(WiringExitPolicy::Ignore));
    assert!(report.succeeded(WiringExitPolicy::FailOnError));
    assert_eq!(report.exit_code(WiringExitPolicy::FailOnAny), EXIT_WIRING_FAILURE);
}

#[tokio::test]
async fn test_failed_producer_stops_dependents() {
    let mock = MockProvisioner::new()
        .fail_create("A", ProvisionError::Network("connection refused".to_string()));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&chain_graph(), &AbortSignal::new())
        .await
        .unwrap();

    let a = report.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert!(a.reason.as_deref().unwrap().contains("connection refused"));

    let b = report.step("B").unwrap();
    assert!(matches!(b.status, StepStatus::Blocked | StepStatus::Aborted));
    assert!(b.address.is_none());

    assert_eq!(mock.created(), vec!["A"]);
    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), EXIT_FAILURE);
}

#[tokio::test]
async fn test_abort_policy_stops_independent_steps_too() {
    let mock = MockProvisioner::new().fail_create("A", ProvisionError::Rejected("out of gas".to_string()));
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B").arg(Arg::reference("A")))
        .step(ResourceStep::new("C"));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("B").unwrap().status, StepStatus::Blocked);
    assert_eq!(report.step("C").unwrap().status, StepStatus::Aborted);
    assert!(report.aborted.is_none());
    assert_eq!(mock.created(), vec!["A"]);
}

#[tokio::test]
async fn test_continue_independent_blocks_only_dependents() {
    let mock = MockProvisioner::new().fail_create("A", ProvisionError::Rejected("reverted".to_string()));
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B").arg(Arg::reference("A")))
        .step(ResourceStep::new("C"))
        .step(ResourceStep::new("D").arg(Arg::reference("B")).arg(Arg::reference("C")));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .with_options(RunOptions {
            failure_policy: FailurePolicy::ContinueIndependent,
            ..Default::default()
        })
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Failed);
    assert_eq!(report.step("B").unwrap().status, StepStatus::Blocked);
    assert_eq!(report.step("C").unwrap().status, StepStatus::Deployed);
    assert_eq!(report.step("D").unwrap().status, StepStatus::Blocked);
    assert!(report.step("D").unwrap().reason.as_deref().unwrap().contains("`B`"));

    assert_eq!(mock.created(), vec!["A", "C"]);
    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), EXIT_FAILURE);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let mock = MockProvisioner::new();
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A").skip_if_already_deployed(true))
        .step(
            ResourceStep::new("B")
                .arg(Arg::reference("A"))
                .skip_if_already_deployed(true),
        )
        .step(
            ResourceStep::new("C")
                .arg(Arg::reference("B"))
                .arg(Arg::literal(42))
                .skip_if_already_deployed(true),
        );
    let orchestrator = orchestrator(&mock, MemoryRegistry::new());

    let first = orchestrator.run(&graph, &AbortSignal::new()).await.unwrap();
    assert_eq!(mock.created().len(), 3);

    let second = orchestrator.run(&graph, &AbortSignal::new()).await.unwrap();
    assert_eq!(mock.created().len(), 3, "second run must not create anything");
    assert_eq!(first.addresses(), second.addresses());
    assert_eq!(second.count(StepStatus::Skipped), 3);
    assert!(second.steps.iter().all(|s| s.notes.is_empty()));
}

#[tokio::test]
async fn test_file_registry_idempotence_across_reopen() {
    let temp_dir = TempDir::new("stackup-test").expect("Failed to create temp dir");
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("Erc20Scuba").skip_if_already_deployed(true))
        .step(
            ResourceStep::new("MasterDiver")
                .arg(Arg::reference("Erc20Scuba"))
                .skip_if_already_deployed(true),
        );

    let first_mock = MockProvisioner::new();
    let first = {
        let registry = FileRegistry::open(temp_dir.path()).unwrap();
        Orchestrator::new(NETWORK, first_mock.clone(), registry)
            .run(&graph, &AbortSignal::new())
            .await
            .unwrap()
    };
    assert_eq!(first_mock.created().len(), 2);

    let second_mock = MockProvisioner::new();
    let registry = FileRegistry::open(temp_dir.path()).unwrap();
    let second = Orchestrator::new(NETWORK, second_mock.clone(), registry)
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert!(second_mock.created().is_empty());
    assert_eq!(first.addresses(), second.addresses());
    assert!(
        temp_dir
            .path()
            .join(NETWORK)
            .join("MasterDiver.json")
            .is_file()
    );
}

#[tokio::test]
async fn test_invalid_graph_makes_no_call() {
    let mock = MockProvisioner::new();
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A").arg(Arg::reference("B")))
        .step(ResourceStep::new("B"));

    let result = orchestrator(&mock, MemoryRegistry::new())
        .run(&graph, &AbortSignal::new())
        .await;

    assert_eq!(
        result.unwrap_err(),
        ConfigurationError::ForwardReference {
            step: "A".to_string(),
            reference: "B".to_string(),
        }
    );
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_options_make_no_call() {
    let mock = MockProvisioner::new();
    let result = orchestrator(&mock, MemoryRegistry::new())
        .with_options(RunOptions {
            max_concurrency: 0,
            ..Default::default()
        })
        .run(&chain_graph(), &AbortSignal::new())
        .await;

    assert!(matches!(result, Err(ConfigurationError::InvalidOption(_))));
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_already_existing_resource_counts_as_deployed() {
    let mock = MockProvisioner::new().fail_create(
        "A",
        ProvisionError::AlreadyExists {
            address: "0xExisting".to_string(),
        },
    );
    let orchestrator = orchestrator(&mock, MemoryRegistry::new());

    let report = orchestrator
        .run(&chain_graph(), &AbortSignal::new())
        .await
        .unwrap();

    let a = report.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Deployed);
    assert_eq!(a.address.as_deref(), Some("0xExisting"));
    assert!(a.notes.iter().any(|n| n.contains("already present")));
    assert_eq!(mock.create_args("B"), Some(vec![json!("0xExisting")]));
    assert!(orchestrator.registry().is_deployed(NETWORK, "A").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_is_reported_as_timeout() {
    let mock = MockProvisioner::new().with_delay("A", Duration::from_secs(600));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .with_options(RunOptions {
            step_timeout_secs: Some(30),
            ..Default::default()
        })
        .run(&chain_graph(), &AbortSignal::new())
        .await
        .unwrap();

    let a = report.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert!(a.reason.as_deref().unwrap().contains("timed out"));
    assert!(!a.reason.as_deref().unwrap().contains("network"));
    assert_ne!(report.step("B").unwrap().status, StepStatus::Deployed);
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_override() {
    let mock = MockProvisioner::new().with_delay("A", Duration::from_secs(60));
    let graph = DeploymentGraph::default().step(ResourceStep::new("A").timeout_secs(120));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .with_options(RunOptions {
            step_timeout_secs: Some(10),
            ..Default::default()
        })
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Deployed);
}

#[tokio::test]
async fn test_abort_before_start_attempts_nothing() {
    let mock = MockProvisioner::new();
    let abort = AbortSignal::new();
    abort.abort("shutdown requested");

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&chain_graph(), &abort)
        .await
        .unwrap();

    assert!(mock.calls().is_empty());
    assert_eq!(report.count(StepStatus::Aborted), 2);
    assert_eq!(report.aborted.as_deref(), Some("shutdown requested"));
    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), EXIT_ABORTED);
}

#[tokio::test]
async fn test_abort_mid_run_keeps_confirmed_work() {
    let abort = AbortSignal::new();
    let mock = MockProvisioner::new().abort_after("B", abort.clone());
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(
            ResourceStep::new("B")
                .arg(Arg::reference("A"))
                .wire(WiringCall::new("A", "setB(address)").arg(Arg::reference("B"))),
        )
        .step(ResourceStep::new("C"));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&graph, &abort)
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Deployed);

    // B was in flight when the abort fired: its deployment stands, its wiring is not issued.
    let b = report.step("B").unwrap();
    assert_eq!(b.status, StepStatus::Deployed);
    assert_eq!(b.wiring_failures.len(), 1);
    assert_eq!(b.wiring_failures[0].kind, WiringFailureKind::Aborted);
    assert!(mock.invoked().is_empty());

    assert_eq!(report.step("C").unwrap().status, StepStatus::Aborted);
    assert_eq!(mock.created(), vec!["A", "B"]);
    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), EXIT_ABORTED);
}

/// `A` and `B` are independent, `C` needs `A`, `D` needs `B`, `E` needs `C` and `D`.
fn diamond_graph() -> DeploymentGraph {
    DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B"))
        .step(ResourceStep::new("C").arg(Arg::reference("A")))
        .step(ResourceStep::new("D").arg(Arg::reference("B")))
        .step(
            ResourceStep::new("E")
                .arg(Arg::reference("C"))
                .arg(Arg::reference("D")),
        )
}

fn assert_producers_first(events: &[String], graph: &DeploymentGraph) {
    let position = |marker: String| {
        events
            .iter()
            .position(|e| *e == marker)
            .unwrap_or_else(|| panic!("missing event {marker}"))
    };

    for (index, step) in graph.steps.iter().enumerate() {
        for dep in graph.dependencies(index) {
            let producer = &graph.steps[dep].name;
            assert!(
                position(format!("end:{producer}")) < position(format!("start:{}", step.name)),
                "{} started before {producer} confirmed",
                step.name
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_mode_respects_dependencies() {
    let mut mock = MockProvisioner::new();
    for name in ["A", "B", "C", "D", "E"] {
        mock = mock.with_delay(name, Duration::from_secs(5));
    }
    let graph = diamond_graph();

    let report = orchestrator(&mock, MemoryRegistry::new())
        .with_options(RunOptions {
            max_concurrency: 2,
            ..Default::default()
        })
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.count(StepStatus::Deployed), 5);
    assert_eq!(mock.max_active(), 2);
    assert_producers_first(&mock.events(), &graph);
    assert_eq!(
        mock.create_args("E"),
        Some(vec![json!("0xC1"), json!("0xD1")])
    );

    // The report keeps declared order whatever the completion order.
    let names: Vec<_> = report.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C", "D", "E"]);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_mode_runs_one_step_at_a_time() {
    let mut mock = MockProvisioner::new();
    for name in ["A", "B", "C", "D", "E"] {
        mock = mock.with_delay(name, Duration::from_secs(1));
    }

    orchestrator(&mock, MemoryRegistry::new())
        .run(&diamond_graph(), &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(mock.max_active(), 1);
    assert_eq!(mock.created(), vec!["A", "B", "C", "D", "E"]);
}

#[tokio::test]
async fn test_wiring_failure_does_not_stop_later_steps() {
    let mock = MockProvisioner::new().fail_invoke(
        "transferOwnership(address)",
        InvokeError::Reverted("Ownable: caller is not the owner".to_string()),
    );
    let graph = DeploymentGraph::default()
        .step(
            ResourceStep::new("A")
                .wire(WiringCall::new("A", "transferOwnership(address)").arg(Arg::literal(DEV_ADDRESS)))
                .wire(WiringCall::new("A", "setFee(uint256)").arg(Arg::literal(30))),
        )
        .step(ResourceStep::new("B").arg(Arg::reference("A")));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    let a = report.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Deployed);
    assert_eq!(a.wiring_applied, 1);
    assert_eq!(a.wiring_failures[0].kind, WiringFailureKind::Reverted);
    assert_eq!(report.step("B").unwrap().status, StepStatus::Deployed);

    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), 0);
    assert_eq!(report.exit_code(WiringExitPolicy::FailOnError), EXIT_WIRING_FAILURE);
}

#[tokio::test]
async fn test_wiring_runs_after_producer_with_its_address() {
    let mock = MockProvisioner::new();
    // Deploy the token, then point it at the master contract once that one exists.
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("Erc20Scuba"))
        .step(
            ResourceStep::new("MasterDiver")
                .arg(Arg::reference("Erc20Scuba"))
                .wire(
                    WiringCall::new("Erc20Scuba", "changeMasterchef(address)")
                        .arg(Arg::reference("MasterDiver")),
                ),
        );

    orchestrator(&mock, MemoryRegistry::new())
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    let calls = mock.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(
        calls[2],
        common::Call::Invoke {
            address: "0xErc20Scuba1".to_string(),
            method: "changeMasterchef(address)".to_string(),
            args: vec![json!("0xMasterDiver1")],
        }
    );
}

#[tokio::test]
async fn test_wiring_runs_for_skipped_steps() {
    let mock = MockProvisioner::new();
    let registry = MemoryRegistry::new().with_entry(NETWORK, RegistryEntry::new("A", "0xA1"));
    let graph = DeploymentGraph::default().step(
        ResourceStep::new("A")
            .skip_if_already_deployed(true)
            .wire(WiringCall::new("A", "unpause()")),
    );

    let report = orchestrator(&mock, registry)
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Skipped);
    assert_eq!(report.step("A").unwrap().wiring_applied, 1);
    assert_eq!(mock.invoked(), vec![("0xA1".to_string(), "unpause()".to_string())]);
}

#[tokio::test]
async fn test_wiring_with_missing_address_is_unresolved() {
    let mock = MockProvisioner::new().fail_create("A", ProvisionError::Rejected("reverted".to_string()));
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B").wire(WiringCall::new("A", "setB(address)").arg(Arg::reference("B"))));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .with_options(RunOptions {
            failure_policy: FailurePolicy::ContinueIndependent,
            ..Default::default()
        })
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    let b = report.step("B").unwrap();
    assert_eq!(b.status, StepStatus::Deployed);
    assert_eq!(b.wiring_failures[0].kind, WiringFailureKind::Unresolved);
    assert!(mock.invoked().is_empty());
}

#[tokio::test]
async fn test_unrecorded_deployment_fails_the_step() {
    let mock = MockProvisioner::new();

    let report = Orchestrator::new(NETWORK, mock.clone(), ReadOnlyRegistry)
        .run(&chain_graph(), &AbortSignal::new())
        .await
        .unwrap();

    let a = report.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert_eq!(a.address.as_deref(), Some("0xA1"));
    assert!(a.reason.as_deref().unwrap().contains("could not be recorded"));

    // B never sees an address that is not durable.
    assert_eq!(mock.created(), vec!["A"]);
    assert_ne!(report.step("B").unwrap().status, StepStatus::Deployed);
}

#[tokio::test]
async fn test_changed_inputs_mark_skipped_step_stale() {
    let mock = MockProvisioner::new();
    let registry = MemoryRegistry::new()
        .with_entry(NETWORK, RegistryEntry::new("A", "0xA1").with_fingerprint("deadbeef"));
    let graph = DeploymentGraph::default().step(
        ResourceStep::new("A")
            .arg(Arg::literal(1000))
            .skip_if_already_deployed(true),
    );

    let report = orchestrator(&mock, registry)
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    let a = report.step("A").unwrap();
    assert_eq!(a.status, StepStatus::Skipped);
    assert!(a.notes.iter().any(|n| n.starts_with("stale")));
    assert!(mock.created().is_empty());
}

#[tokio::test]
async fn test_force_redeploy_ignores_registry() {
    let mock = MockProvisioner::new().with_address("A", "0xA2");
    let registry = MemoryRegistry::new().with_entry(NETWORK, RegistryEntry::new("A", "0xA1"));
    let graph = DeploymentGraph::default().step(ResourceStep::new("A").skip_if_already_deployed(true));
    let orchestrator = orchestrator(&mock, registry).with_options(RunOptions {
        force_redeploy: true,
        ..Default::default()
    });

    let report = orchestrator.run(&graph, &AbortSignal::new()).await.unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Deployed);
    assert_eq!(report.address("A"), Some("0xA2"));
    assert_eq!(
        orchestrator
            .registry()
            .lookup(NETWORK, "A")
            .unwrap()
            .map(|e| e.address),
        Some("0xA2".to_string())
    );
}

#[tokio::test]
async fn test_registry_is_keyed_by_network() {
    let mock = MockProvisioner::new();
    let registry = MemoryRegistry::new().with_entry("sepolia", RegistryEntry::new("A", "0xSepolia"));
    let graph = DeploymentGraph::default().step(ResourceStep::new("A").skip_if_already_deployed(true));

    let report = orchestrator(&mock, registry)
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Deployed);
    assert_eq!(report.address("A"), Some("0xA1"));
}

#[tokio::test(start_paused = true)]
async fn test_continue_independent_in_waves_blocks_dependents_of_failure() {
    let mock = MockProvisioner::new()
        .with_delay("A", Duration::from_secs(1))
        .with_delay("B", Duration::from_secs(1))
        .fail_create("A", ProvisionError::Rejected("reverted".to_string()));
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B"))
        .step(ResourceStep::new("C").arg(Arg::reference("A")))
        .step(ResourceStep::new("D").arg(Arg::reference("B")));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .with_options(RunOptions {
            failure_policy: FailurePolicy::ContinueIndependent,
            max_concurrency: 2,
            ..Default::default()
        })
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Failed);
    assert_eq!(report.step("B").unwrap().status, StepStatus::Deployed);
    let c = report.step("C").unwrap();
    assert_eq!(c.status, StepStatus::Blocked);
    assert!(c.reason.as_deref().unwrap().contains("`A`"));
    assert_eq!(report.step("D").unwrap().status, StepStatus::Deployed);
    assert_eq!(mock.create_args("D"), Some(vec![json!("0xB1")]));

    let mut created = mock.created();
    created.sort();
    assert_eq!(created, vec!["A", "B", "D"]);
    assert_eq!(mock.max_active(), 2);
    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), EXIT_FAILURE);
}

#[tokio::test(start_paused = true)]
async fn test_abort_policy_lets_in_flight_sibling_finish() {
    let mock = MockProvisioner::new()
        .with_delay("A", Duration::from_secs(1))
        .with_delay("B", Duration::from_secs(5))
        .fail_create("A", ProvisionError::Rejected("out of gas".to_string()));
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B"))
        .step(ResourceStep::new("C").arg(Arg::reference("B")));
    let orchestrator = orchestrator(&mock, MemoryRegistry::new()).with_options(RunOptions {
        max_concurrency: 2,
        ..Default::default()
    });

    let report = orchestrator.run(&graph, &AbortSignal::new()).await.unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Failed);

    // B was already in flight when A failed: it confirms and is recorded.
    assert_eq!(report.step("B").unwrap().status, StepStatus::Deployed);
    assert_eq!(report.address("B"), Some("0xB1"));
    assert!(orchestrator.registry().is_deployed(NETWORK, "B").unwrap());

    let c = report.step("C").unwrap();
    assert_eq!(c.status, StepStatus::Aborted);
    assert!(c.reason.as_deref().unwrap().contains("step `A` failed"));
    assert!(report.aborted.is_none());

    assert_eq!(mock.events(), vec!["start:A", "start:B", "end:A", "end:B"]);
    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), EXIT_FAILURE);
}

#[tokio::test]
async fn test_wiring_reference_to_failed_step_does_not_block() {
    let mock = MockProvisioner::new().fail_create("A", ProvisionError::Rejected("reverted".to_string()));
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("A"))
        .step(ResourceStep::new("B").wire(WiringCall::new("A", "setB(address)").arg(Arg::reference("B"))))
        .step(ResourceStep::new("C").arg(Arg::reference("A")));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    assert_eq!(report.step("A").unwrap().status, StepStatus::Failed);
    // B could have deployed without A: only the abort stopped it.
    assert_eq!(report.step("B").unwrap().status, StepStatus::Aborted);
    assert_eq!(report.step("C").unwrap().status, StepStatus::Blocked);
    assert_eq!(mock.created(), vec!["A"]);
}

/// `Factory` and `Chef` deployed, then `Pool` reads its pool from the factory and registers
/// it on the chef.
fn read_graph() -> DeploymentGraph {
    DeploymentGraph::default()
        .step(ResourceStep::new("Factory"))
        .step(ResourceStep::new("Chef"))
        .step(
            ResourceStep::new("Pool")
                .wire(
                    WiringCall::new("Factory", "pairToPool(address)")
                        .arg(Arg::literal(DEV_ADDRESS))
                        .output("newPool"),
                )
                .wire(
                    WiringCall::new("Chef", "add(uint256,address,bool)")
                        .arg(Arg::literal(100))
                        .arg(Arg::reference("newPool"))
                        .arg(Arg::literal(false)),
                ),
        )
        .step(ResourceStep::new("Zap").arg(Arg::reference("newPool")))
}

#[tokio::test]
async fn test_read_output_feeds_later_calls_and_steps() {
    let mock = MockProvisioner::new().with_read("pairToPool(address)", json!("0x9001"));

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&read_graph(), &AbortSignal::new())
        .await
        .unwrap();

    let pool = report.step("Pool").unwrap();
    assert_eq!(pool.status, StepStatus::Deployed);
    assert_eq!(pool.wiring_applied, 2);
    assert!(pool.wiring_failures.is_empty());

    assert_eq!(
        mock.reads(),
        vec![("0xFactory1".to_string(), "pairToPool(address)".to_string())]
    );
    assert_eq!(
        mock.invoke_args("add(uint256,address,bool)"),
        Some(vec![json!(100), json!("0x9001"), json!(false)])
    );
    assert_eq!(mock.create_args("Zap"), Some(vec![json!("0x9001")]));
    assert_eq!(report.exit_code(WiringExitPolicy::FailOnAny), 0);
}

#[tokio::test]
async fn test_failed_read_leaves_its_output_unresolved() {
    let mock = MockProvisioner::new().fail_invoke(
        "pairToPool(address)",
        InvokeError::Reverted("execution reverted".to_string()),
    );

    let report = orchestrator(&mock, MemoryRegistry::new())
        .run(&read_graph(), &AbortSignal::new())
        .await
        .unwrap();

    let pool = report.step("Pool").unwrap();
    assert_eq!(pool.status, StepStatus::Deployed);
    assert_eq!(pool.wiring_applied, 0);
    let kinds: Vec<_> = pool.wiring_failures.iter().map(|f| f.kind).collect();
    assert_eq!(
        kinds,
        vec![WiringFailureKind::Reverted, WiringFailureKind::Unresolved]
    );
    assert!(pool.wiring_failures[1].reason.contains("newPool"));
    assert!(mock.invoked().is_empty());

    // The step taking the output as a constructor argument cannot deploy.
    assert_eq!(report.step("Zap").unwrap().status, StepStatus::Blocked);
    assert_eq!(report.exit_code(WiringExitPolicy::Ignore), EXIT_FAILURE);
}

#[tokio::test]
async fn test_hardhat_deploy_file_is_reused() {
    let temp_dir = TempDir::new("stackup-orchestrator").expect("Failed to create temp dir");
    let network_dir = temp_dir.path().join(NETWORK);
    std::fs::create_dir_all(&network_dir).unwrap();
    std::fs::write(
        network_dir.join("Erc20Scuba.json"),
        r#"{"address": "0x5FbDB2315678afecb367f032d93F642f64180aa3", "abi": [], "transactionHash": "0xfeed", "receipt": {"blockNumber": 3}}"#,
    )
    .unwrap();

    let mock = MockProvisioner::new();
    let graph = DeploymentGraph::default()
        .step(ResourceStep::new("Erc20Scuba").skip_if_already_deployed(true))
        .step(ResourceStep::new("Staking").arg(Arg::reference("Erc20Scuba")));
    let registry = FileRegistry::open(temp_dir.path()).unwrap();

    let report = Orchestrator::new(NETWORK, mock.clone(), registry)
        .run(&graph, &AbortSignal::new())
        .await
        .unwrap();

    let token = report.step("Erc20Scuba").unwrap();
    assert_eq!(token.status, StepStatus::Skipped);
    assert_eq!(token.tx_hash.as_deref(), Some("0xfeed"));
    assert!(token.notes.is_empty());
    assert_eq!(mock.created(), vec!["Staking"]);
    assert_eq!(
        mock.create_args("Staking"),
        Some(vec![json!("0x5FbDB2315678afecb367f032d93F642f64180aa3")])
    );
}
