//! Reconciler integration tests.
//!
//! Drives full sync passes against the in-memory IPVS table. These tests
//! don't require CAP_NET_ADMIN or the ip_vs module.

use mvirt_lb::test_util::{
    Fault, MemoryTable, Op, service_id, test_destination, test_service,
};
use mvirt_lb::{
    AllHealthy, DesiredState, Destination, Error, FileState, ForwardMode, Normalize, Operation,
    Protocol, Reconciler, Service, ServiceEntry,
};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::thread;

fn desired(entries: Vec<(Service, Vec<Destination>)>) -> DesiredState {
    DesiredState::new(
        entries
            .into_iter()
            .map(|(s, d)| ServiceEntry::new(s, d))
            .collect(),
    )
    .expect("invalid desired state")
}

fn setup() -> (Reconciler<MemoryTable>, MemoryTable) {
    let table = MemoryTable::new();
    let reconciler = Reconciler::initialize(table.clone()).expect("initialize failed");
    table.clear_ops();
    (reconciler, table)
}

/// Assert the live table equals `state` under normalized equality.
fn assert_converged(table: &MemoryTable, state: &DesiredState) {
    let live = table.snapshot();

    let live_services: HashSet<_> = live.iter().map(|e| e.service.normalized()).collect();
    let want_services: HashSet<_> = state.services().map(|s| s.normalized()).collect();
    assert_eq!(live_services, want_services);

    for entry in &live {
        let live_dsts: HashSet<_> = entry.destinations.iter().map(|d| d.normalized()).collect();
        let want_dsts: HashSet<_> = state
            .destinations(&entry.service)
            .iter()
            .map(|d| d.normalized())
            .collect();
        assert_eq!(live_dsts, want_dsts, "destinations of {}", entry.service);
    }
}

#[test]
fn test_scenario_add_service_to_empty_table() {
    let (reconciler, table) = setup();
    let svc = Service::new("10.8.0.1".parse().unwrap(), 80, Protocol::Tcp, "rr");
    let dst = Destination::new("10.0.0.1".parse().unwrap(), 8080, 1, ForwardMode::Nat);
    let state = desired(vec![(svc.clone(), vec![dst.clone()])]);

    reconciler.sync(&state).unwrap();
    assert_eq!(
        table.mutations(),
        vec![
            Op::AddService(service_id(&svc)),
            Op::AddDestination(service_id(&svc), dst.endpoint()),
        ]
    );
    assert_converged(&table, &state);

    table.clear_ops();
    let report = reconciler.sync(&state).unwrap();
    assert!(report.is_noop());
    assert!(table.mutations().is_empty());
}

#[test]
fn test_scenario_remove_service_cascades() {
    let (reconciler, table) = setup();
    let keep = test_service("10.8.0.1");
    let gone = test_service("10.8.0.2");
    let state = desired(vec![
        (keep.clone(), vec![test_destination("10.0.0.1")]),
        (
            gone.clone(),
            vec![test_destination("10.0.0.2"), test_destination("10.0.0.3")],
        ),
    ]);
    reconciler.sync(&state).unwrap();

    let state = desired(vec![(keep.clone(), vec![test_destination("10.0.0.1")])]);
    table.clear_ops();
    let report = reconciler.sync(&state).unwrap();

    assert_eq!(report.services_removed, 1);
    assert_eq!(table.mutations(), vec![Op::DeleteService(service_id(&gone))]);

    let mut handle = table.clone();
    let err = mvirt_lb::IpvsTable::get_service(&mut handle, &gone).unwrap_err();
    assert!(matches!(err, mvirt_lb::IpvsError::NotFound(_)));
    assert_converged(&table, &state);
}

#[test]
fn test_scenario_swap_destinations() {
    let (reconciler, table) = setup();
    let svc = test_service("10.8.0.1");
    let (a, b, c) = (
        test_destination("10.0.0.1"),
        test_destination("10.0.0.2"),
        test_destination("10.0.0.3"),
    );

    reconciler
        .sync(&desired(vec![(svc.clone(), vec![a.clone(), b.clone()])]))
        .unwrap();
    table.clear_ops();

    let state = desired(vec![(svc.clone(), vec![b.clone(), c.clone()])]);
    reconciler.sync(&state).unwrap();

    assert_eq!(
        table.mutations(),
        vec![
            Op::AddDestination(service_id(&svc), c.endpoint()),
            Op::DeleteDestination(service_id(&svc), a.endpoint()),
        ]
    );
    assert_converged(&table, &state);
}

#[test]
fn test_partial_failure_recovers_on_next_sync() {
    let (reconciler, table) = setup();
    let first = test_service("10.8.0.1");
    let second = test_service("10.8.0.2");
    let broken = test_destination("10.0.0.20");
    let state = desired(vec![
        (first.clone(), vec![test_destination("10.0.0.10")]),
        (second.clone(), vec![broken.clone(), test_destination("10.0.0.21")]),
    ]);

    table.fail_next(Fault::AddDestination(broken.endpoint()));
    let err = reconciler.sync(&state).unwrap_err();
    assert_eq!(err.operation(), Some(Operation::AddDestination));
    assert!(matches!(err, Error::Ipvs { .. }));

    // The first service's additions persist
    let live = table.snapshot();
    assert_eq!(live.len(), 2);
    assert_eq!(live[0].service.addr(), first.addr());
    assert_eq!(live[0].destinations.len(), 1);
    assert!(live[1].destinations.is_empty());

    table.clear_ops();
    let report = reconciler.sync(&state).unwrap();
    assert_eq!(report.services_added, 0);
    assert_eq!(report.destinations_added, 2);
    assert!(
        !table
            .mutations()
            .iter()
            .any(|op| matches!(op, Op::AddService(_)))
    );
    assert_converged(&table, &state);
}

#[test]
fn test_service_delete_failure_aborts_pass() {
    let (reconciler, table) = setup();
    let stale = test_service("10.8.0.9");
    table.insert(stale.clone(), vec![]);
    table.fail_next(Fault::DeleteService(service_id(&stale)));

    let state = desired(vec![(
        test_service("10.8.0.1"),
        vec![test_destination("10.0.0.1")],
    )]);
    let err = reconciler.sync(&state).unwrap_err();
    assert_eq!(err.operation(), Some(Operation::DeleteService));
    // Destination pass never ran
    assert!(
        !table
            .ops()
            .iter()
            .any(|op| matches!(op, Op::GetService(_)))
    );

    reconciler.sync(&state).unwrap();
    assert_converged(&table, &state);
}

#[test]
fn test_get_service_failure_aborts_destination_pass() {
    let (reconciler, table) = setup();
    let first = test_service("10.8.0.1");
    let second = test_service("10.8.0.2");
    let state = desired(vec![
        (first.clone(), vec![test_destination("10.0.0.1")]),
        (second.clone(), vec![test_destination("10.0.0.2")]),
    ]);
    reconciler.sync(&state).unwrap();

    // Drift on both services, then fail reading back the first one
    table.insert(first.clone(), vec![]);
    table.insert(second.clone(), vec![]);
    table.fail_next(Fault::GetService(service_id(&first)));
    table.clear_ops();

    let err = reconciler.sync(&state).unwrap_err();
    assert_eq!(err.operation(), Some(Operation::GetService));
    assert!(table.mutations().is_empty());
    assert!(
        !table
            .ops()
            .contains(&Op::GetService(service_id(&second)))
    );

    let report = reconciler.sync(&state).unwrap();
    assert_eq!(report.destinations_added, 2);
    assert_converged(&table, &state);
}

#[test]
fn test_same_address_services_are_kept_apart() {
    let (reconciler, table) = setup();
    let tcp = test_service("10.8.0.1");
    let mut udp = tcp.clone();
    udp.protocol = Protocol::Udp;
    let state = desired(vec![
        (tcp.clone(), vec![test_destination("10.0.0.1")]),
        (udp.clone(), vec![test_destination("10.0.0.2")]),
    ]);

    table.fail_next(Fault::AddService(service_id(&udp)));
    let err = reconciler.sync(&state).unwrap_err();
    assert_eq!(err.operation(), Some(Operation::AddService));
    assert_eq!(table.snapshot().len(), 1);
    assert_eq!(table.snapshot()[0].service.protocol, Protocol::Tcp);

    table.clear_ops();
    reconciler.sync(&state).unwrap();
    assert_eq!(
        table.mutations(),
        vec![
            Op::AddService(service_id(&udp)),
            Op::AddDestination(service_id(&udp), test_destination("10.0.0.2").endpoint()),
        ]
    );
    assert_converged(&table, &state);
}

#[test]
fn test_scheduler_change_replaces_service() {
    let (reconciler, table) = setup();
    let rr = test_service("10.8.0.1");
    let dsts = vec![test_destination("10.0.0.1"), test_destination("10.0.0.2")];
    reconciler
        .sync(&desired(vec![(rr.clone(), dsts.clone())]))
        .unwrap();
    table.clear_ops();

    let mut wlc = rr.clone();
    wlc.scheduler = "wlc".to_string();
    let state = desired(vec![(wlc.clone(), dsts.clone())]);
    let report = reconciler.sync(&state).unwrap();

    assert_eq!(report.services_removed, 1);
    assert_eq!(report.services_added, 1);
    assert_eq!(report.destinations_added, 2);

    let mutations = table.mutations();
    assert_eq!(mutations[0], Op::DeleteService(service_id(&rr)));
    assert_eq!(mutations[1], Op::AddService(service_id(&wlc)));
    assert_eq!(table.snapshot()[0].service.scheduler, "wlc");
    assert_converged(&table, &state);
}

#[test]
fn test_metadata_only_change_is_noop() {
    let (reconciler, table) = setup();
    let state = desired(vec![(
        test_service("10.8.0.1").with_name("web").with_mode("nat"),
        vec![test_destination("10.0.0.1").with_name("web-1").with_service_id("web")],
    )]);
    reconciler.sync(&state).unwrap();

    let renamed = desired(vec![(
        test_service("10.8.0.1").with_name("frontend").with_mode("route"),
        vec![
            test_destination("10.0.0.1")
                .with_name("frontend-1")
                .with_service_id("frontend"),
        ],
    )]);
    table.clear_ops();
    assert!(reconciler.sync(&renamed).unwrap().is_noop());
    assert!(table.mutations().is_empty());
}

#[test]
fn test_converges_from_arbitrary_live_state() {
    let (reconciler, table) = setup();
    let shared = test_service("10.8.0.1");
    let udp = Service::new("fd00::53".parse().unwrap(), 53, Protocol::Udp, "wlc");

    // Live: a stale service, and drifted destinations on a shared one
    table.insert(test_service("10.8.0.99"), vec![test_destination("10.0.0.99")]);
    let mut drifted = test_destination("10.0.0.1");
    drifted.mode = ForwardMode::Route;
    table.insert(shared.clone(), vec![drifted, test_destination("10.0.0.5")]);

    let state = desired(vec![
        (
            shared.clone(),
            vec![test_destination("10.0.0.1"), test_destination("10.0.0.2")],
        ),
        (
            udp,
            vec![Destination::new(
                "fd00::1".parse().unwrap(),
                53,
                2,
                ForwardMode::Tunnel,
            )],
        ),
    ]);

    reconciler.sync(&state).unwrap();
    assert_converged(&table, &state);

    table.clear_ops();
    assert!(reconciler.sync(&state).unwrap().is_noop());
}

#[test]
fn test_concurrent_syncs_serialize() {
    let (reconciler, table) = setup();
    let reconciler = Arc::new(reconciler);
    let state = Arc::new(desired(vec![
        (
            test_service("10.8.0.1"),
            vec![test_destination("10.0.0.1"), test_destination("10.0.0.2")],
        ),
        (test_service("10.8.0.2"), vec![test_destination("10.0.0.3")]),
    ]));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let reconciler = Arc::clone(&reconciler);
            let state = Arc::clone(&state);
            thread::spawn(move || reconciler.sync(&state))
        })
        .collect();

    // Interleaved passes would race on the same adds and hit AlreadyExists
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let adds = table
        .mutations()
        .iter()
        .filter(|op| matches!(op, Op::AddService(_)))
        .count();
    assert_eq!(adds, 2);
    assert_converged(&table, &state);
}

#[test]
fn test_bootstrap_failure_is_reported() {
    let table = MemoryTable::new();
    table.fail_next(Fault::Init);
    let err = Reconciler::initialize(table.clone()).err().unwrap();
    assert!(matches!(err, Error::Bootstrap(_)));
    // Flush is never attempted after a failed init
    assert_eq!(table.ops(), vec![Op::Init]);

    let table = MemoryTable::new();
    table.fail_next(Fault::Flush);
    let err = Reconciler::initialize(table).err().unwrap();
    assert!(matches!(err, Error::Bootstrap(_)));
}

#[test]
fn test_sync_from_state_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "services": [
                {{
                    "name": "web", "host": "10.8.0.1", "port": 80,
                    "protocol": "tcp", "scheduler": "rr", "mode": "nat",
                    "destinations": [
                        {{ "name": "web-1", "host": "10.0.0.1", "port": 8080 }},
                        {{ "name": "web-2", "host": "10.0.0.2", "port": 8080, "weight": 2 }}
                    ]
                }},
                {{
                    "name": "dns", "host": "10.8.0.53", "port": 53,
                    "protocol": "udp", "scheduler": "wlc",
                    "destinations": [
                        {{ "name": "dns-1", "host": "10.0.1.1", "port": 53, "mode": "route" }}
                    ]
                }}
            ]
        }}"#
    )
    .unwrap();

    let (reconciler, table) = setup();
    let provider = FileState::load(file.path()).unwrap();
    let state = DesiredState::load(&provider, &AllHealthy).unwrap();

    let report = reconciler.sync(&state).unwrap();
    assert_eq!(report.services_added, 2);
    assert_eq!(report.destinations_added, 3);
    assert_converged(&table, &state);

    // Reloading the unchanged file is a no-op pass
    let provider = FileState::load(file.path()).unwrap();
    let state = DesiredState::load(&provider, &AllHealthy).unwrap();
    assert!(reconciler.sync(&state).unwrap().is_noop());
}
