//! Tests of the public daemon API that do not depend on a working
//! multicast network: daemon lifecycle, the blocking register and
//! unregister calls, browse event delivery and idempotent shutdown.

use mcast_sd::{DaemonStatus, ServiceDaemon, ServiceEvent, ServiceInfo, UnregisterStatus};
use std::time::Duration;

#[test]
fn test_daemon_lifecycle() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let ty_domain = "_lifecycle._udp.local.";
    let browse_chan = daemon.browse(ty_domain).unwrap();
    match browse_chan.recv_timeout(Duration::from_secs(2)) {
        Ok(ServiceEvent::SearchStarted(_)) => {}
        other => panic!("expected SearchStarted, got {:?}", other),
    }

    // Register blocks through probing (3 x 250ms) and announcing
    // (1000ms + 250ms), so give it a comfortable margin.
    let info = ServiceInfo::new(
        ty_domain,
        "one",
        "lifecycle_host.local.",
        "192.168.77.1",
        7707,
        None,
    )
    .unwrap();
    daemon.register(info).expect("register failed");

    // The daemon counted the registration.
    let metrics = daemon.get_metrics().unwrap();
    assert!(metrics.get("register").copied().unwrap_or(0) >= 1);

    match daemon.unregister("one._lifecycle._udp.local.") {
        Ok(UnregisterStatus::OK) => {}
        other => panic!("expected UnregisterStatus::OK, got {:?}", other),
    }

    daemon.stop_browse(ty_domain).unwrap();
    let stopped = loop {
        match browse_chan.recv_timeout(Duration::from_secs(2)) {
            Ok(ServiceEvent::SearchStopped(_)) => break true,
            Ok(_) => continue,
            Err(_) => break false,
        }
    };
    assert!(stopped);

    let status = daemon.shutdown().unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);

    // Shutdown is idempotent.
    let status = daemon.shutdown().unwrap();
    assert_eq!(status, DaemonStatus::Shutdown);
}

#[test]
fn test_unregister_not_found() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    match daemon.unregister("nobody._nothing._udp.local.") {
        Ok(UnregisterStatus::NotFound) => {}
        other => panic!("expected UnregisterStatus::NotFound, got {:?}", other),
    }

    daemon.shutdown().unwrap();
}

#[test]
fn test_get_service_info_times_out() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let start = std::time::Instant::now();
    let result = daemon
        .get_service_info("_absent._udp.local.", "nobody", 500)
        .expect("get_service_info failed");
    assert!(result.is_none());
    assert!(start.elapsed() >= Duration::from_millis(400));

    daemon.shutdown().unwrap();
}

#[test]
fn test_list_first_call_waits_grace_window() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let start = std::time::Instant::now();
    let instances = daemon.list("_absent2._udp.local.").unwrap();
    assert!(instances.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(150));

    // The second call returns from the cache without the grace window.
    let start = std::time::Instant::now();
    let instances = daemon.list("_absent2._udp.local.").unwrap();
    assert!(instances.is_empty());
    assert!(start.elapsed() < Duration::from_millis(150));

    daemon.shutdown().unwrap();
}

#[test]
fn test_register_bad_names_rejected() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    // Service type must start with an underscore.
    let info = ServiceInfo::new(
        "bad-type._udp.local.",
        "inst",
        "host.local.",
        "10.0.0.9",
        8000,
        None,
    )
    .unwrap();
    assert!(daemon.register(info).is_err());

    // Hostname must end with ".local.".
    let info = ServiceInfo::new(
        "_goodtype._udp.local.",
        "inst",
        "host.example.com.",
        "10.0.0.9",
        8000,
        None,
    )
    .unwrap();
    assert!(daemon.register(info).is_err());

    daemon.shutdown().unwrap();
}

#[test]
fn test_register_reverse_domain_dropped_silently() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    // Registrations under the reverse domain return Ok immediately,
    // without publishing anything and without blocking.
    let info = ServiceInfo::new(
        "_svc._udp.9.0.0.10.in-addr.arpa.",
        "inst",
        "host.local.",
        "10.0.0.9",
        8000,
        None,
    )
    .unwrap();
    let start = std::time::Instant::now();
    daemon.register(info).expect("silent drop should not error");
    assert!(start.elapsed() < Duration::from_millis(100));

    // Nothing was registered.
    match daemon.unregister("inst._svc._udp.9.0.0.10.in-addr.arpa.") {
        Ok(UnregisterStatus::NotFound) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }

    daemon.shutdown().unwrap();
}

#[test]
fn test_unregister_all() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let ty_domain = "_unregall._udp.local.";
    for (name, port) in [("alpha", 7801), ("beta", 7802)] {
        let info = ServiceInfo::new(
            ty_domain,
            name,
            "unregall_host.local.",
            "192.168.77.2",
            port,
            None,
        )
        .unwrap();
        daemon.register(info).expect("register failed");
    }

    daemon.unregister_all().expect("unregister_all failed");

    // Everything is gone: a subsequent unregister cannot find them.
    match daemon.unregister("alpha._unregall._udp.local.") {
        Ok(UnregisterStatus::NotFound) => {}
        other => panic!("expected NotFound after unregister_all, got {:?}", other),
    }

    daemon.shutdown().unwrap();
}
