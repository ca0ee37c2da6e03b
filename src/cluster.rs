use std::net::{IpAddr, Ipv4Addr};

use crate::config::ClusterSettings;
use crate::error::{ProvisionError, Result};
use crate::models::Host;
use crate::progress::{LogLevel, RunContext};
use crate::remote::{CommandResult, RemoteExecutor, RemoteSession};
use crate::task_helpers::{close_session, open_session, run_and_log};

pub const HASH_SLOTS: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u32,
    pub end: u32,
}

impl SlotRange {
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// Even split of the hash-slot space; the remainder goes to the earliest
/// hosts one slot each.
pub fn split_slots(hosts: usize) -> Vec<SlotRange> {
    if hosts == 0 {
        return Vec::new();
    }
    let hosts = hosts as u32;
    let base = HASH_SLOTS / hosts;
    let remainder = HASH_SLOTS % hosts;

    let mut start = 0;
    (0..hosts)
        .map(|index| {
            let size = base + u32::from(index < remainder);
            let range = SlotRange {
                start,
                end: start + size - 1,
            };
            start += size;
            range
        })
        .collect()
}

/// Pair each host with its share of [`split_slots`], in host order.
pub fn even_assignment(hosts: &[Host]) -> Vec<(u32, SlotRange)> {
    hosts
        .iter()
        .zip(split_slots(hosts.len()))
        .map(|(host, range)| (host.id, range))
        .collect()
}

pub fn instance_conf_path(port: u16) -> String {
    format!("/etc/redis/redis_{port}.conf")
}

pub fn render_instance_conf(port: u16) -> String {
    [
        format!("port {port}"),
        "cluster-enabled yes".to_string(),
        "daemonize yes".to_string(),
        "dir /var/lib/redis".to_string(),
        format!("dbfilename dump_{port}.rdb"),
        format!("cluster-config-file nodes_{port}.conf"),
        "cluster-node-timeout 5000".to_string(),
        "appendonly yes".to_string(),
        format!("appendfilename node_{port}.aof"),
        format!("logfile /var/log/redis/redis-{port}.log"),
        "save 900 1".to_string(),
        "save 300 10".to_string(),
        "save 60 10000".to_string(),
    ]
    .join("\n")
}

/// Master and replica instance files for one host.
pub fn instance_confs(settings: &ClusterSettings) -> Vec<(String, String)> {
    [settings.master_port, settings.replica_port]
        .into_iter()
        .map(|port| (instance_conf_path(port), render_instance_conf(port)))
        .collect()
}

/// `CLUSTER MEET` only accepts an IP literal, never a hostname.
pub fn meet_command(settings: &ClusterSettings, peer_ip: IpAddr) -> String {
    format!(
        "redis-cli -c -h 127.0.0.1 -p {port} cluster meet {peer_ip} {port}",
        port = settings.master_port
    )
}

pub fn resolve_command(hostname: &str) -> String {
    format!("getent ahostsv4 {hostname} | awk 'NR==1 {{print $1}}'")
}

pub fn add_slots_command(settings: &ClusterSettings, range: SlotRange) -> String {
    format!(
        "for slot in $(seq {} {}); do redis-cli -h localhost -p {} CLUSTER ADDSLOTS $slot; done",
        range.start, range.end, settings.master_port
    )
}

pub fn status_command(settings: &ClusterSettings) -> String {
    format!("redis-cli -p {} cluster nodes", settings.master_port)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterFormation {
    pub initializer: Option<u32>,
    pub met: Vec<u32>,
    pub assigned: Vec<(u32, SlotRange)>,
}

/// Join every host into one cluster through an initializer and have each
/// host claim the range `assignments` gives it. Replicas on the second port
/// are started by the init script but never attached to a master. A meet or
/// slot claim only counts when Redis answers `OK`.
pub fn form_cluster(
    context: &RunContext,
    executor: &dyn RemoteExecutor,
    settings: &ClusterSettings,
    hosts: &[Host],
    assignments: &[(u32, SlotRange)],
) -> ClusterFormation {
    let mut formation = ClusterFormation::default();

    let mut initializer = None;
    for host in hosts {
        if let Ok(session) = open_session(context, executor, host) {
            initializer = Some((host, session));
            break;
        }
    }
    let Some((leader, mut leader_session)) = initializer else {
        context.log(
            None,
            LogLevel::Error,
            "Cannot connect even a single server. Redis-cluster setup failed",
        );
        return formation;
    };
    formation.initializer = Some(leader.id);
    context.host(
        leader.id,
        LogLevel::Info,
        format!("Forming cluster from {}", leader.hostname),
    );

    for peer in hosts.iter().filter(|host| host.id != leader.id) {
        let address = match peer_ip(context, leader_session.as_mut(), leader.id, peer) {
            Ok(ip) => ip,
            Err(error) => {
                context.host(
                    peer.id,
                    LogLevel::Error,
                    format!("{error}. {} is left out of the cluster", peer.hostname),
                );
                continue;
            }
        };
        let command = meet_command(settings, address);
        match run_and_log(context, leader_session.as_mut(), leader.id, &command) {
            Ok(result) if acknowledged(&result) => formation.met.push(peer.id),
            Ok(result) => context.host(
                peer.id,
                LogLevel::Error,
                format!(
                    "Cluster meet with {} was refused: {}",
                    peer.hostname,
                    reply_text(&result)
                ),
            ),
            Err(_) => {}
        }
    }

    for (host_id, range) in assignments {
        let Some(host) = hosts.iter().find(|host| host.id == *host_id) else {
            continue;
        };
        context.host(
            host.id,
            LogLevel::Info,
            format!("Assigning slots {}-{} to {}", range.start, range.end, host.hostname),
        );
        let command = add_slots_command(settings, *range);
        let assigned = if host.id == leader.id {
            claim_slots(context, leader_session.as_mut(), host, &command)
        } else {
            assign_remote(context, executor, host, &command)
        };
        if assigned {
            formation.assigned.push((host.id, *range));
        }
    }

    log_cluster_status(context, leader_session.as_mut(), leader.id, settings);
    context.log(
        None,
        LogLevel::Warning,
        format!(
            "Replica instances on port {} are running but not attached to masters",
            settings.replica_port
        ),
    );
    close_session(context, leader, leader_session);
    formation
}

/// The peer's IPv4 address: the stored override, the hostname when it is
/// already an address, or what the initializer resolves it to.
fn peer_ip(
    context: &RunContext,
    session: &mut dyn RemoteSession,
    leader_id: u32,
    peer: &Host,
) -> Result<IpAddr> {
    let stored = peer
        .ip
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = stored {
        return ip.parse::<IpAddr>().map_err(|_| {
            ProvisionError::PreconditionMissing(format!(
                "{} has an invalid IP address `{ip}`",
                peer.hostname
            ))
        });
    }
    if let Ok(ip) = peer.hostname.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolved = run_and_log(context, session, leader_id, &resolve_command(&peer.hostname))
        .ok()
        .and_then(|result| result.stdout.trim().parse::<Ipv4Addr>().ok());
    resolved.map(IpAddr::V4).ok_or_else(|| {
        ProvisionError::PreconditionMissing(format!(
            "no IP address is known for {}",
            peer.hostname
        ))
    })
}

/// Every reply line is `OK`; `ADDSLOTS` run in a loop prints one per slot.
fn acknowledged(result: &CommandResult) -> bool {
    let mut replies = result
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .peekable();
    result.exit_status == 0 && replies.peek().is_some() && replies.all(|line| line == "OK")
}

fn reply_text(result: &CommandResult) -> String {
    let text = [result.stdout.trim(), result.stderr.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        "no reply".to_string()
    } else {
        text
    }
}

fn claim_slots(
    context: &RunContext,
    session: &mut dyn RemoteSession,
    host: &Host,
    command: &str,
) -> bool {
    match run_and_log(context, session, host.id, command) {
        Ok(result) if acknowledged(&result) => true,
        Ok(result) => {
            context.host(
                host.id,
                LogLevel::Error,
                format!(
                    "Slot assignment on {} was refused: {}",
                    host.hostname,
                    reply_text(&result)
                ),
            );
            false
        }
        Err(_) => false,
    }
}

fn assign_remote(
    context: &RunContext,
    executor: &dyn RemoteExecutor,
    host: &Host,
    command: &str,
) -> bool {
    let Ok(mut session) = open_session(context, executor, host) else {
        return false;
    };
    let assigned = claim_slots(context, session.as_mut(), host, command);
    close_session(context, host, session);
    assigned
}

fn log_cluster_status(
    context: &RunContext,
    session: &mut dyn RemoteSession,
    host_id: u32,
    settings: &ClusterSettings,
) {
    if let Ok(result) = session.run(&status_command(settings)) {
        let level = if result.stdout.trim().is_empty() {
            LogLevel::Warning
        } else {
            LogLevel::Info
        };
        context.host(host_id, level, format!("Cluster nodes:\n{}", result.stdout.trim_end()));
    }
}
