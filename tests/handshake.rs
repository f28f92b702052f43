//! Handshake through the real process environment.

use std::collections::HashMap;

use gem::lifecycle::handshake::{
    build_child_environment, inherited_offset_table, Handshake, GRACEFUL_RESTART_ENV,
    SERVER_ADDRS_ENV,
};
use gem::lifecycle::startup::prepare;

#[test]
fn offsets_follow_inherited_address_env() {
    std::env::set_var(SERVER_ADDRS_ENV, ":8080,:4343,:6060");

    let table = inherited_offset_table(std::env::vars_os());
    assert_eq!(table.len(), 3);
    assert_eq!(
        table.iter().collect::<Vec<_>>(),
        vec![(":8080", 0), (":4343", 1), (":6060", 2)]
    );
    assert_eq!(table.readiness_fd(), 6);

    std::env::remove_var(SERVER_ADDRS_ENV);
}

#[test]
fn child_environment_round_trips_through_detection() {
    let addrs = [":8080", ":4343", ":6060"];
    let env = build_child_environment(std::env::vars_os(), &addrs);

    let handshake = Handshake::detect(env.clone());
    assert!(handshake.graceful_restart);
    assert_eq!(handshake.addrs, addrs);

    let vars: HashMap<_, _> = env.into_iter().collect();
    assert_eq!(vars[std::ffi::OsStr::new(GRACEFUL_RESTART_ENV)], "true");

    let mut reversed = addrs;
    reversed.reverse();
    let env = build_child_environment(Vec::<(String, String)>::new(), &reversed);
    assert_eq!(Handshake::detect(env).addrs, reversed);
}

#[test]
fn restarted_child_without_descriptors_refuses_to_start() {
    // Nothing listening on port 1 was placed at fd 3.
    let handshake = Handshake {
        graceful_restart: true,
        addrs: vec!["127.0.0.1:1".to_string()],
    };
    assert!(prepare("gem", &handshake.addrs, &handshake).is_err());
}
