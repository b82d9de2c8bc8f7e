use ipfs_pubsub_bridge::config::Config;
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const VARS: &[&str] = &[
    "IPFS_BINARY",
    "IPFS_PATH",
    "IPFS_API_HOST",
    "IPFS_API_PORT",
    "SWARM_KEY_REGISTRY",
    "DAEMON_READY_TIMEOUT_SECS",
    "PUBSUB_TOPICS",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_defaults() {
    clear_env();
    env::set_var("HOME", "/home/tester");

    let config = Config::load().unwrap();
    assert_eq!(config.ipfs_binary, PathBuf::from("ipfs"));
    assert_eq!(config.repo_path, PathBuf::from("/home/tester/.ipfs"));
    assert_eq!(config.api_host, "127.0.0.1");
    assert_eq!(config.api_port, None);
    assert_eq!(config.swarm_key_registry, PathBuf::from("./data/swarm-keys.json"));
    assert_eq!(config.readiness_timeout(), Duration::from_secs(30));
    assert!(config.topics.is_empty());
}

#[test]
#[serial]
fn test_values_from_environment() {
    clear_env();
    env::set_var("IPFS_BINARY", "/opt/kubo/ipfs");
    env::set_var("IPFS_PATH", "/var/lib/ipfs");
    env::set_var("IPFS_API_HOST", "10.0.0.5");
    env::set_var("IPFS_API_PORT", "5101");
    env::set_var("SWARM_KEY_REGISTRY", "/etc/bridge/keys.json");
    env::set_var("DAEMON_READY_TIMEOUT_SECS", "45");
    env::set_var("PUBSUB_TOPICS", " notebook/cells, ,notebook/presence ");

    let config = Config::load().unwrap();
    assert_eq!(config.ipfs_binary, PathBuf::from("/opt/kubo/ipfs"));
    assert_eq!(config.repo_path, PathBuf::from("/var/lib/ipfs"));
    assert_eq!(config.api_host, "10.0.0.5");
    assert_eq!(config.api_port, Some(5101));
    assert_eq!(config.swarm_key_registry, PathBuf::from("/etc/bridge/keys.json"));
    assert_eq!(config.readiness_timeout_secs, 45);
    assert_eq!(config.topics, vec!["notebook/cells", "notebook/presence"]);

    clear_env();
}

#[test]
#[serial]
fn test_invalid_port_is_rejected() {
    clear_env();
    env::set_var("IPFS_API_PORT", "not-a-port");
    assert!(Config::load().is_err());

    env::set_var("IPFS_API_PORT", "70000");
    assert!(Config::load().is_err());

    clear_env();
}

#[test]
#[serial]
fn test_bad_timeout_falls_back_to_default() {
    clear_env();
    env::set_var("DAEMON_READY_TIMEOUT_SECS", "soon");
    assert_eq!(Config::load().unwrap().readiness_timeout_secs, 30);
    clear_env();
}
