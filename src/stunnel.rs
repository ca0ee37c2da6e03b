use crate::config::ProxySettings;
use crate::models::Host;

pub const STUNNEL_CONF_PATH: &str = "/etc/stunnel/stunnel.conf";
pub const RENDEZVOUS_PORT: u16 = 7777;
pub const LOCAL_REDIS_PORT: u16 = 6379;
pub const CLIENT_PORT_BASE: u32 = 7000;

const CERT_LINE: &str = "cert = /etc/stunnel/cert.pem";
const PID_LINE: &str = "pid = /var/run/stunnel.pid";

/// Local port under which a peer's Redis is reachable once tunneled.
pub fn client_port(host_id: u32) -> u32 {
    CLIENT_PORT_BASE + host_id
}

pub fn local_endpoint(host_id: u32) -> String {
    format!("localhost:{}", client_port(host_id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStanza {
    pub name: String,
    pub client: bool,
    pub accept: String,
    pub connect: String,
}

impl TunnelStanza {
    pub fn server(name: impl Into<String>, accept: String, connect: String) -> Self {
        Self {
            name: name.into(),
            client: false,
            accept,
            connect,
        }
    }

    pub fn client(name: impl Into<String>, accept: String, connect: String) -> Self {
        Self {
            name: name.into(),
            client: true,
            accept,
            connect,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StunnelConfig {
    pub stanzas: Vec<TunnelStanza>,
}

impl StunnelConfig {
    pub fn servers(&self) -> impl Iterator<Item = &TunnelStanza> {
        self.stanzas.iter().filter(|stanza| !stanza.client)
    }

    pub fn clients(&self) -> impl Iterator<Item = &TunnelStanza> {
        self.stanzas.iter().filter(|stanza| stanza.client)
    }

    pub fn merge(&mut self, other: StunnelConfig) {
        for stanza in other.stanzas {
            if !self.stanzas.iter().any(|existing| existing.name == stanza.name) {
                self.stanzas.push(stanza);
            }
        }
    }

    pub fn render(&self) -> String {
        let mut lines = vec![CERT_LINE.to_string(), PID_LINE.to_string()];
        for stanza in &self.stanzas {
            lines.push(format!("[{}]", stanza.name));
            lines.push(format!(
                "client = {}",
                if stanza.client { "yes" } else { "no" }
            ));
            lines.push(format!("accept = {}", stanza.accept));
            lines.push(format!("connect = {}", stanza.connect));
        }
        lines.join("\n")
    }
}

pub fn redis_server_stanza(host: &Host) -> TunnelStanza {
    TunnelStanza::server(
        "redis-server",
        format!("{}:{RENDEZVOUS_PORT}", host.address()),
        format!("127.0.0.1:{LOCAL_REDIS_PORT}"),
    )
}

/// Client-side sharding: every host exposes its Redis on the rendezvous port
/// and tunnels to every host of the set, itself included.
pub fn sharded_config(host: &Host, peers: &[Host]) -> StunnelConfig {
    let mut stanzas = vec![redis_server_stanza(host)];
    for peer in peers {
        stanzas.push(TunnelStanza::client(
            format!("client{}", peer.id),
            format!("127.0.0.1:{}", client_port(peer.id)),
            format!("{}:{RENDEZVOUS_PORT}", peer.address()),
        ));
    }
    StunnelConfig { stanzas }
}

pub fn sharded_endpoints(hosts: &[Host]) -> Vec<String> {
    hosts.iter().map(|host| local_endpoint(host.id)).collect()
}

/// A cache host behind the proxy: its Redis is exposed to the proxy and a
/// local tunnel at port 7000 leads to the proxy's encrypted listener.
pub fn cache_host_config(host: &Host, proxy: &Host, proxy_settings: &ProxySettings) -> StunnelConfig {
    StunnelConfig {
        stanzas: vec![
            redis_server_stanza(host),
            TunnelStanza::client(
                "twemproxy-client",
                format!("127.0.0.1:{CLIENT_PORT_BASE}"),
                format!("{}:{}", proxy.address(), proxy_settings.tunnel_port),
            ),
        ],
    }
}

pub fn proxy_host_config(
    proxy: &Host,
    cache_hosts: &[Host],
    proxy_settings: &ProxySettings,
) -> StunnelConfig {
    let mut stanzas = vec![TunnelStanza::server(
        "twemproxy-server",
        format!("{}:{}", proxy.address(), proxy_settings.tunnel_port),
        format!("127.0.0.1:{}", proxy_settings.listen_port),
    )];
    for host in cache_hosts {
        stanzas.push(TunnelStanza::client(
            format!("redis{}", host.id),
            format!("127.0.0.1:{}", client_port(host.id)),
            format!("{}:{RENDEZVOUS_PORT}", host.address()),
        ));
    }
    StunnelConfig { stanzas }
}
