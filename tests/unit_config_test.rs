use beryld::config::{Config, PrivateData, SharedPolicy};
use std::time::Duration;

const MINIMAL: &str = r#"
control_hosts = ["ctl0"]

[[node]]
names = "n[1-2]"
cpus = 4

[[partition]]
name = "batch"
nodes = "n[1-2]"
default = true
"#;

#[test]
fn test_minimal_config_defaults() {
    let config = Config::from_str(MINIMAL).unwrap();
    assert_eq!(config.port, 6817);
    assert_eq!(config.state_save_location, "beryl_state");
    assert_eq!(config.auth_type, "shared-key");
    assert_eq!(config.sched_type, "fifo");
    assert_eq!(config.select_type, "linear");
    assert!(config.fast_schedule);
    assert_eq!(config.first_job_id, 1);
    assert_eq!(config.controller_timeout, Duration::from_secs(120));
    assert_eq!(config.worker_timeout, Duration::from_secs(300));
    assert!(config.private_data.is_empty());
    assert_eq!(config.nodes.len(), 1);
    assert_eq!(config.nodes[0].cpus, 4);
    assert_eq!(config.partitions.len(), 1);
    assert!(config.partitions[0].default);
    assert_eq!(config.partitions[0].shared, SharedPolicy::No);
}

#[test]
fn test_humantime_durations() {
    // Scalars must precede the [[node]]/[[partition]] tables in TOML.
    let toml = format!("worker_timeout = \"2m\"\nmsg_timeout = \"3s\"\n{MINIMAL}");
    let config = Config::from_str(&toml).unwrap();
    assert_eq!(config.worker_timeout, Duration::from_secs(120));
    assert_eq!(config.msg_timeout, Duration::from_secs(3));
}

#[test]
fn test_private_data_parsing() {
    let toml = format!("private_data = [\"jobs\", \"nodes\"]\n{MINIMAL}");
    let config = Config::from_str(&toml).unwrap();
    assert!(config.private_data.contains(PrivateData::JOBS));
    assert!(config.private_data.contains(PrivateData::NODES));
    assert!(!config.private_data.contains(PrivateData::PARTITIONS));
}

#[test]
fn test_unknown_private_data_rejected() {
    let toml = format!("private_data = [\"secrets\"]\n{MINIMAL}");
    assert!(Config::from_str(&toml).is_err());
}

#[test]
fn test_zero_port_rejected() {
    let toml = format!("port = 0\n{MINIMAL}");
    assert!(Config::from_str(&toml).is_err());
}

#[test]
fn test_missing_control_hosts_rejected() {
    assert!(Config::from_str("port = 6817").is_err());
}

#[test]
fn test_empty_control_hosts_rejected() {
    assert!(Config::from_str("control_hosts = []").is_err());
}

#[test]
fn test_zero_cpu_node_rejected() {
    let toml = r#"
control_hosts = ["ctl0"]
[[node]]
names = "n1"
cpus = 0
"#;
    assert!(Config::from_str(toml).is_err());
}

#[test]
fn test_metrics_port_clash_rejected() {
    let toml = format!("{MINIMAL}\n[metrics]\nenabled = true\nport = 6817\n");
    assert!(Config::from_str(&toml).is_err());
}

#[test]
fn test_backup_index_of() {
    let toml = r#"
control_hosts = ["ctl0", "ctl1"]
[[node]]
names = "n1"
"#;
    let config = Config::from_str(toml).unwrap();
    assert_eq!(config.backup_index_of("ctl0"), Some(0));
    assert_eq!(config.backup_index_of("ctl1"), Some(1));
    assert_eq!(config.backup_index_of("elsewhere"), None);
}

#[test]
fn test_bad_first_job_id_rejected() {
    let toml = format!("first_job_id = 0\n{MINIMAL}");
    assert!(Config::from_str(&toml).is_err());
}
