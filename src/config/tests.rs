//! Config module tests

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("MESH_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${MESH_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("MESH_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("MESH_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${MESH_TEST_VAR_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("MESH_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${MESH_TEST_VAR_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("MESH_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("MESH_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${MESH_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.cluster.listen.port(), 7947);
    assert_eq!(config.cluster.heartbeat_interval, Duration::from_secs(20));
    assert!(config.cluster.tls.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse(
        r#"
[cluster]
name = "node-local"
"#,
    )
    .unwrap();

    assert_eq!(config.cluster.name, "node-local");
    assert_eq!(config.cluster.dial_timeout, Duration::from_secs(60));
    assert!(config.cluster.nodes.is_empty());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[cluster]
name = "node-local"
listen = "127.0.0.1:7950"
heartbeat_interval = "5s"
dial_timeout = "2s"
handshake_timeout = "500ms"
max_packet_size = 65536

[cluster.tls]
cert = "certs/server.pem"
key = "certs/server.key"
ca_cert = "certs/ca.pem"
client_cert = "certs/client.pem"
client_key = "certs/client.key"

[[cluster.nodes]]
name = "edge-1"
host = "10.0.0.5:1883"

[[cluster.nodes]]
name = "edge-2"
host = "edge-2.internal:7947"
tls = false
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    let cluster = &config.cluster;
    assert_eq!(cluster.listen.to_string(), "127.0.0.1:7950");
    assert_eq!(cluster.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(cluster.dial_timeout, Duration::from_secs(2));
    assert_eq!(cluster.handshake_timeout, Duration::from_millis(500));
    assert_eq!(cluster.max_packet_size, 65536);

    let tls = cluster.tls.as_ref().unwrap();
    assert_eq!(tls.client_identity(), ("certs/client.pem", "certs/client.key"));

    assert_eq!(
        cluster.nodes,
        vec![
            ClusterNode {
                name: "edge-1".to_string(),
                host: "10.0.0.5:1883".to_string(),
                tls: None,
            },
            ClusterNode {
                name: "edge-2".to_string(),
                host: "edge-2.internal:7947".to_string(),
                tls: Some(false),
            },
        ]
    );
    assert!(cluster.node_uses_tls(&cluster.nodes[0]));
    assert!(!cluster.node_uses_tls(&cluster.nodes[1]));
}

#[test]
fn test_parse_rejects_duplicate_peers() {
    let result = Config::parse(
        r#"
[cluster]
name = "node-local"

[[cluster.nodes]]
name = "edge-1"
host = "a:1"

[[cluster.nodes]]
name = "edge-1"
host = "b:1"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_parse_rejects_incomplete_tls() {
    let result = Config::parse(
        r#"
[cluster]
name = "node-local"

[cluster.tls]
cert = "server.pem"
key = "server.key"
ca_cert = ""
"#,
    );
    match result {
        Err(ConfigError::Validation(msg)) => assert!(msg.contains("ca_cert")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_parse_trims_padded_peer_names() {
    let config = Config::parse(
        r#"
[cluster]
name = " node-local "
write_timeout = "3s"

[[cluster.nodes]]
name = " edge-1 "
host = "10.0.0.5:7947"
"#,
    )
    .unwrap();

    assert_eq!(config.cluster.name, "node-local");
    assert_eq!(config.cluster.nodes[0].name, "edge-1");
    assert_eq!(config.cluster.nodes_named("edge-1").count(), 1);
    assert_eq!(config.cluster.write_timeout, Duration::from_secs(3));
}

#[test]
fn test_parse_bad_duration() {
    let result = Config::parse(
        r#"
[cluster]
heartbeat_interval = "soon"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("mesh.toml");

    std::env::set_var("MESH_TEST_PEER_HOST", "10.0.0.9");

    let config_content = r#"
[cluster]
name = "${MESH_TEST_NODE_NAME:-node-a}"
listen = "127.0.0.1:7951"

[[cluster.nodes]]
name = "node-b"
host = "${MESH_TEST_PEER_HOST}:7947"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.cluster.name, "node-a");
    assert_eq!(config.cluster.listen.to_string(), "127.0.0.1:7951");
    assert_eq!(config.cluster.heartbeat_interval, Duration::from_secs(20));
    assert_eq!(config.cluster.nodes[0].host, "10.0.0.9:7947");

    std::env::remove_var("MESH_TEST_PEER_HOST");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.cluster.listen.port(), 7947);
    assert_eq!(config.cluster.dial_timeout, Duration::from_secs(60));
    assert_eq!(config.cluster.write_timeout, Duration::from_secs(10));
}
