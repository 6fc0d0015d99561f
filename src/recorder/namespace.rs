//! Per-client network namespaces.
//!
//! Each client gets its own namespace joined to the server namespace by a
//! veth pair on a private /30 link:
//!
//! ```text
//!  server namespace                       client namespace
//!  ┌──────────────────────────┐          ┌──────────────────────────┐
//!  │ egress if (x.x.x.1/30)   │◀── veth ─▶│ ingress if (x.x.x.2/30)  │
//!  │   PREROUTING DNAT tcp ───┼─▶ interception proxy   default via .1 │
//!  │   POSTROUTING MASQUERADE │          │ lo up                     │
//!  └──────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! The namespace name carries the server pid and the client identity;
//! interface names and addresses carry the pid and the leased pool link.
//! Every setup step that leaves state behind registers its undo; the undo
//! list runs on `release`, or synchronously on drop if `release` was never
//! reached.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use crate::config::NamespaceConfig;
use crate::error::ResourceError;
use crate::net::identity::ClientIdentity;

/// Longest interface name the kernel accepts.
pub const INTERFACE_NAME_LIMIT: usize = 15;

/// Prefix length of each client link.
pub const LINK_PREFIX_LEN: u8 = 30;

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    fn new(program: &Path, args: &[&str]) -> Self {
        Self {
            program: program.to_path_buf(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A setup command and, when it leaves state behind, the command undoing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub setup: CommandLine,
    pub undo: Option<CommandLine>,
}

/// The two ends of a client's point-to-point link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddresses {
    /// Server side; the interception proxy listens here.
    pub egress: Ipv4Addr,
    /// Client side, inside the namespace.
    pub ingress: Ipv4Addr,
}

impl LinkAddresses {
    /// The `index`-th /30 of the pool, wrapping at the pool size.
    pub fn for_index(config: &NamespaceConfig, index: u64) -> Self {
        let links = config.link_count().max(1);
        let index = (index % links) as u32;
        let host_bits = 32 - config.address_pool_prefix.min(32) as u32;
        let mask = if host_bits >= 32 { 0 } else { u32::MAX << host_bits };
        let subnet = (u32::from(config.address_pool) & mask).wrapping_add(index << 2);
        Self {
            egress: Ipv4Addr::from(subnet.wrapping_add(1)),
            ingress: Ipv4Addr::from(subnet.wrapping_add(2)),
        }
    }
}

/// Links currently assigned to live namespaces.
#[derive(Debug)]
pub struct LinkPool {
    config: NamespaceConfig,
    in_use: Mutex<BTreeSet<u64>>,
}

impl LinkPool {
    pub fn new(config: NamespaceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    /// Lease a free link, preferring the one `identity` maps to.
    pub fn lease(self: &Arc<Self>, identity: ClientIdentity) -> Result<LinkLease, ResourceError> {
        let links = self.config.link_count();
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let start = identity.as_u64() % links.max(1);
        let index = (0..links)
            .map(|step| (start + step) % links)
            .find(|index| !in_use.contains(index))
            .ok_or(ResourceError::AddressPoolExhausted { links })?;
        in_use.insert(index);

        Ok(LinkLease {
            pool: Arc::clone(self),
            index,
            addresses: LinkAddresses::for_index(&self.config, index),
        })
    }

    pub fn leased(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A link held for one namespace; returned to the pool on drop.
#[derive(Debug)]
pub struct LinkLease {
    pool: Arc<LinkPool>,
    index: u64,
    addresses: LinkAddresses,
}

impl LinkLease {
    /// Position of the link in the pool; unique among live namespaces.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn addresses(&self) -> LinkAddresses {
        self.addresses
    }
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        self.pool
            .in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.index);
    }
}

/// Names, addresses and commands for one client namespace.
#[derive(Debug, Clone)]
pub struct NamespacePlan {
    pub namespace: String,
    pub egress_interface: String,
    pub ingress_interface: String,
    pub addresses: LinkAddresses,
    ip: PathBuf,
    iptables: PathBuf,
}

impl NamespacePlan {
    /// Plan the namespace of `identity` on pool link `link`.
    ///
    /// Interface names carry the link index rather than the identity: links
    /// are bounded by the pool size, so the names stay within the kernel
    /// limit however many clients the server has seen.
    pub fn new(
        config: &NamespaceConfig,
        server_pid: u32,
        identity: ClientIdentity,
        link: u64,
    ) -> Result<Self, ResourceError> {
        let id = identity.as_u64();
        let egress_interface = format!("rp{:x}e{:x}", server_pid, link);
        let ingress_interface = format!("rp{:x}i{:x}", server_pid, link);
        for name in [&egress_interface, &ingress_interface] {
            if name.len() > INTERFACE_NAME_LIMIT {
                return Err(ResourceError::InterfaceName {
                    name: name.clone(),
                    limit: INTERFACE_NAME_LIMIT,
                });
            }
        }

        Ok(Self {
            namespace: format!("{}-{}-{}", config.name_prefix, server_pid, id),
            egress_interface,
            ingress_interface,
            addresses: LinkAddresses::for_index(config, link),
            ip: config.ip_command.clone(),
            iptables: config.iptables_command.clone(),
        })
    }

    fn ip(&self, args: &[&str]) -> CommandLine {
        CommandLine::new(&self.ip, args)
    }

    fn ip_inside(&self, args: &[&str]) -> CommandLine {
        let ip = self.ip.to_string_lossy();
        let mut full = vec!["netns", "exec", self.namespace.as_str(), ip.as_ref()];
        full.extend_from_slice(args);
        CommandLine::new(&self.ip, &full)
    }

    fn iptables(&self, args: &[&str]) -> CommandLine {
        CommandLine::new(&self.iptables, args)
    }

    /// Namespace, veth pair, addresses and routes.
    pub fn link_steps(&self) -> Vec<Step> {
        let ns = self.namespace.as_str();
        let egress = self.egress_interface.as_str();
        let ingress = self.ingress_interface.as_str();
        let egress_cidr = format!("{}/{}", self.addresses.egress, LINK_PREFIX_LEN);
        let ingress_cidr = format!("{}/{}", self.addresses.ingress, LINK_PREFIX_LEN);
        let gateway = self.addresses.egress.to_string();

        vec![
            Step {
                setup: self.ip(&["netns", "add", ns]),
                undo: Some(self.ip(&["netns", "del", ns])),
            },
            Step {
                setup: self.ip(&["link", "add", egress, "type", "veth", "peer", "name", ingress]),
                // Deleting one end removes the pair.
                undo: Some(self.ip(&["link", "del", egress])),
            },
            Step {
                setup: self.ip(&["link", "set", ingress, "netns", ns]),
                undo: None,
            },
            Step {
                setup: self.ip(&["addr", "add", &egress_cidr, "dev", egress]),
                undo: None,
            },
            Step {
                setup: self.ip(&["link", "set", egress, "up"]),
                undo: None,
            },
            Step {
                setup: self.ip_inside(&["link", "set", "lo", "up"]),
                undo: None,
            },
            Step {
                setup: self.ip_inside(&["addr", "add", &ingress_cidr, "dev", ingress]),
                undo: None,
            },
            Step {
                setup: self.ip_inside(&["link", "set", ingress, "up"]),
                undo: None,
            },
            Step {
                setup: self.ip_inside(&["route", "add", "default", "via", &gateway]),
                undo: None,
            },
        ]
    }

    /// Send every TCP connection from the client to `proxy`, NAT the rest.
    pub fn redirect_steps(&self, proxy: SocketAddrV4) -> Vec<Step> {
        let egress = self.egress_interface.as_str();
        let target = proxy.to_string();
        let source = format!("{}/32", self.addresses.ingress);

        let dnat = |op: &str| {
            self.iptables(&[
                "-t", "nat", op, "PREROUTING", "-i", egress, "-p", "tcp", "-j", "DNAT",
                "--to-destination", &target,
            ])
        };
        let masquerade = |op: &str| {
            self.iptables(&["-t", "nat", op, "POSTROUTING", "-s", &source, "-j", "MASQUERADE"])
        };

        vec![
            Step {
                setup: dnat("-A"),
                undo: Some(dnat("-D")),
            },
            Step {
                setup: masquerade("-A"),
                undo: Some(masquerade("-D")),
            },
        ]
    }

    /// Command running `program` inside the namespace with an empty environment.
    pub fn exec_in_namespace(&self, program: &Path, args: &[String]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.ip);
        cmd.args(["netns", "exec", self.namespace.as_str()]);
        cmd.arg(program);
        cmd.args(args);
        cmd.env_clear();
        cmd
    }
}

/// A live client namespace. Torn down by `release` or on drop.
#[derive(Debug)]
pub struct NetworkNamespace {
    plan: NamespacePlan,
    undo: Vec<CommandLine>,
}

impl NetworkNamespace {
    /// Create the namespace and its link. Partial setup is rolled back on error.
    pub async fn create(plan: NamespacePlan) -> Result<Self, ResourceError> {
        let mut namespace = Self {
            plan,
            undo: Vec::new(),
        };
        let steps = namespace.plan.link_steps();
        if let Err(e) = namespace.apply(steps).await {
            namespace.release().await;
            return Err(e);
        }

        tracing::debug!(
            namespace = %namespace.plan.namespace,
            egress = %namespace.plan.addresses.egress,
            ingress = %namespace.plan.addresses.ingress,
            "Network namespace created"
        );
        Ok(namespace)
    }

    /// Redirect the client's TCP traffic to the interception proxy.
    pub async fn install_redirect(&mut self, proxy: SocketAddrV4) -> Result<(), ResourceError> {
        let steps = self.plan.redirect_steps(proxy);
        self.apply(steps).await
    }

    async fn apply(&mut self, steps: Vec<Step>) -> Result<(), ResourceError> {
        for step in steps {
            run(&step.setup).await?;
            if let Some(undo) = step.undo {
                self.undo.push(undo);
            }
        }
        Ok(())
    }

    pub fn plan(&self) -> &NamespacePlan {
        &self.plan
    }

    pub fn name(&self) -> &str {
        &self.plan.namespace
    }

    /// Undo every setup step, most recent first. Failures are logged.
    pub async fn release(mut self) {
        while let Some(cmd) = self.undo.pop() {
            if let Err(e) = run(&cmd).await {
                tracing::warn!(namespace = %self.plan.namespace, error = %e, "Namespace teardown step failed");
            }
        }
        tracing::debug!(namespace = %self.plan.namespace, "Network namespace released");
    }
}

impl Drop for NetworkNamespace {
    fn drop(&mut self) {
        while let Some(cmd) = self.undo.pop() {
            let status = std::process::Command::new(&cmd.program)
                .args(&cmd.args)
                .env_clear()
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if !matches!(status, Ok(s) if s.success()) {
                tracing::warn!(namespace = %self.plan.namespace, command = %cmd, "Namespace teardown step failed");
            }
        }
    }
}

async fn run(cmd: &CommandLine) -> Result<(), ResourceError> {
    tracing::trace!(command = %cmd, "Running");
    let output = tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ResourceError::Command {
            command: cmd.to_string(),
            stderr: e.to_string(),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ResourceError::Command {
            command: cmd.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Plan for `identity` on the link of the same number.
    fn plan(identity: u64) -> NamespacePlan {
        NamespacePlan::new(&NamespaceConfig::default(), 4321, ClientIdentity::new(identity), identity).unwrap()
    }

    #[test]
    fn names_derive_from_pid_identity_and_link() {
        let p = NamespacePlan::new(&NamespaceConfig::default(), 4321, ClientIdentity::new(26), 7).unwrap();
        assert_eq!(p.namespace, "render-4321-26");
        assert_eq!(p.egress_interface, "rp10e1e7");
        assert_eq!(p.ingress_interface, "rp10e1i7");
        assert_eq!(p.addresses, LinkAddresses::for_index(&NamespaceConfig::default(), 7));
    }

    #[test]
    fn interface_names_stay_short_for_large_identities() {
        let config = NamespaceConfig::default();
        let last_link = config.link_count() - 1;
        // Largest pid the kernel hands out, far more clients than links.
        let p = NamespacePlan::new(&config, 4_194_303, ClientIdentity::new(1 << 40), last_link).unwrap();
        assert_eq!(p.egress_interface, "rp3fffffefffff");
        assert!(p.ingress_interface.len() <= INTERFACE_NAME_LIMIT);
        assert_eq!(p.namespace, format!("render-4194303-{}", 1u64 << 40));
    }

    #[test]
    fn concurrent_identities_do_not_collide() {
        let a = plan(0);
        let b = plan(1);
        assert_ne!(a.namespace, b.namespace);
        assert_ne!(a.egress_interface, b.egress_interface);
        assert_ne!(a.addresses, b.addresses);
    }

    #[test]
    fn link_addresses_are_carved_from_the_pool() {
        let config = NamespaceConfig::default();
        let first = LinkAddresses::for_index(&config, 0);
        assert_eq!(first.egress, Ipv4Addr::new(100, 64, 0, 1));
        assert_eq!(first.ingress, Ipv4Addr::new(100, 64, 0, 2));

        let later = LinkAddresses::for_index(&config, 64);
        assert_eq!(later.egress, Ipv4Addr::new(100, 64, 1, 1));

        // Wraps around once the pool is used up.
        let wrapped = LinkAddresses::for_index(&config, config.link_count());
        assert_eq!(wrapped, first);
    }

    #[test]
    fn leases_skip_links_in_use() {
        let mut config = NamespaceConfig::default();
        config.address_pool_prefix = 29;
        let pool = LinkPool::new(config.clone());
        assert_eq!(config.link_count(), 2);

        let a = pool.lease(ClientIdentity::new(0)).unwrap();
        // Identity 2 maps onto link 0, which is taken.
        let b = pool.lease(ClientIdentity::new(2)).unwrap();
        assert_eq!(a.addresses().egress, Ipv4Addr::new(100, 64, 0, 1));
        assert_eq!(b.addresses().egress, Ipv4Addr::new(100, 64, 0, 5));

        let err = pool.lease(ClientIdentity::new(3)).unwrap_err();
        assert!(matches!(err, ResourceError::AddressPoolExhausted { links: 2 }));

        drop(a);
        assert_eq!(pool.leased(), 1);
        let c = pool.lease(ClientIdentity::new(3)).unwrap();
        assert_eq!(c.addresses(), LinkAddresses::for_index(&config, 0));
    }

    #[test]
    fn overlong_interface_names_are_refused() {
        let err = NamespacePlan::new(&NamespaceConfig::default(), 0x3fffff, ClientIdentity::new(0), u64::MAX)
            .unwrap_err();
        assert!(matches!(err, ResourceError::InterfaceName { .. }));
    }

    #[test]
    fn every_stateful_step_has_an_undo() {
        let p = plan(3);
        let steps = p.link_steps();
        assert_eq!(steps[0].setup.to_string(), "/sbin/ip netns add render-4321-3");
        assert_eq!(steps[0].undo.as_ref().unwrap().to_string(), "/sbin/ip netns del render-4321-3");
        assert_eq!(
            steps[1].setup.to_string(),
            "/sbin/ip link add rp10e1e3 type veth peer name rp10e1i3"
        );
        assert!(steps[1].undo.is_some());
        assert_eq!(
            steps.last().unwrap().setup.to_string(),
            "/sbin/ip netns exec render-4321-3 /sbin/ip route add default via 100.64.0.13"
        );
    }

    #[test]
    fn redirect_targets_the_proxy() {
        let p = plan(0);
        let steps = p.redirect_steps(SocketAddrV4::new(Ipv4Addr::new(100, 64, 0, 1), 40000));
        assert_eq!(
            steps[0].setup.to_string(),
            "/sbin/iptables -t nat -A PREROUTING -i rp10e1e0 -p tcp -j DNAT --to-destination 100.64.0.1:40000"
        );
        assert_eq!(
            steps[0].undo.as_ref().unwrap().to_string(),
            "/sbin/iptables -t nat -D PREROUTING -i rp10e1e0 -p tcp -j DNAT --to-destination 100.64.0.1:40000"
        );
        assert_eq!(
            steps[1].setup.to_string(),
            "/sbin/iptables -t nat -A POSTROUTING -s 100.64.0.2/32 -j MASQUERADE"
        );
    }

    #[test]
    fn exec_wraps_the_program() {
        let p = plan(1);
        let cmd = p.exec_in_namespace(Path::new("/usr/bin/phantomjs"), &["/dev/stdin".to_string()]);
        let std_cmd = cmd.as_std();
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(std_cmd.get_program(), "/sbin/ip");
        assert_eq!(args, ["netns", "exec", "render-4321-1", "/usr/bin/phantomjs", "/dev/stdin"]);
        assert_eq!(std_cmd.get_envs().count(), 0);
    }

    #[tokio::test]
    async fn failed_setup_reports_command() {
        let mut config = NamespaceConfig::default();
        config.ip_command = PathBuf::from("/nonexistent/ip");
        let plan = NamespacePlan::new(&config, 1, ClientIdentity::new(0), 0).unwrap();
        let err = NetworkNamespace::create(plan).await.unwrap_err();
        match err {
            ResourceError::Command { command, .. } => assert!(command.starts_with("/nonexistent/ip netns add")),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Writes an `ip` stand-in that logs its arguments and fails on `link add`.
    fn failing_ip(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("ip.log");
        let script = dir.join("ip");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\ncase \"$1 $2\" in\n  \"link add\") exit 2 ;;\nesac\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[tokio::test]
    async fn partial_setup_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let (ip, log) = failing_ip(dir.path());
        let mut config = NamespaceConfig::default();
        config.ip_command = ip;

        let plan = NamespacePlan::new(&config, 1, ClientIdentity::new(0), 0).unwrap();
        let err = NetworkNamespace::create(plan).await.unwrap_err();
        assert!(matches!(err, ResourceError::Command { ref command, .. } if command.contains("link add")));

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            [
                "netns add render-1-0",
                "link add rp1e0 type veth peer name rp1i0",
                "netns del render-1-0",
            ]
        );
    }
}
