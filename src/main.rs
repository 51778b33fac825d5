use std::net::IpAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use env_logger::Env;
use tabled::Tabled;

use eni_ipam::alloc::address;
use eni_ipam::alloc::interface;
use eni_ipam::alloc::subnet::{self, Filter};
use eni_ipam::cloud::awscli::AwsCliClient;
use eni_ipam::cloud::imds::ImdsClient;
use eni_ipam::cloud::{AddressAllocation, CloudClient, Interface};
use eni_ipam::diag;
use eni_ipam::error::Error;
use eni_ipam::gc;
use eni_ipam::lock;
use eni_ipam::netstate::{KernelNetState, NetState};
use eni_ipam::registry::Registry;

/// Manage ENI adapters and the CNI address bindings on them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new interface
    NewInterface {
        /// Security group ids to attach to the new interface
        #[arg(required = true)]
        security_groups: Vec<String>,

        /// Comma separated key=value filters to restrict subnets
        #[arg(long = "subnet_filter", value_parser = Filter::parse, default_value = "")]
        subnet_filter: Filter,

        /// Number of ips to allocate on the interface. 0 maxes out the interface.
        #[arg(long = "ip_batch_size", default_value_t = 1)]
        ip_batch_size: u32,
    },

    /// Remove existing interfaces
    RemoveInterface {
        /// Interface ids to detach and destroy
        #[arg(required = true)]
        interface_ids: Vec<String>,
    },

    /// Allocate private IPs on the first available interface
    AllocateFirstAvailable {
        /// Interface position to allocate on; omit to use the first
        /// interface with spare capacity
        #[arg(long)]
        index: Option<usize>,

        /// Number of ips to allocate on the interface. 0 maxes out the interface.
        #[arg(long = "ip_batch_size", default_value_t = 1)]
        ip_batch_size: u32,
    },

    /// Deallocate private IPs
    Deallocate {
        /// Addresses to release
        #[arg(required = true)]
        ips: Vec<IpAddr>,
    },

    /// List all currently unassigned cloud IP addresses
    FreeIps,

    /// List all ENI interfaces and their setup with addresses
    Eniif,

    /// List all kernel-bound IP addresses
    Addr,

    /// Show available subnets for this host
    Subnets,

    /// Display ENI limits for this instance type
    Limits,

    /// Print the maximum number of pod addresses usable on this instance
    Maxpods {
        /// Cap the computed maximum to this value
        #[arg(long)]
        max: Option<u32>,
    },

    /// Evaluate diagnostic rules against this instance
    Diagnostics,

    /// Show the VPC CIDRs associated with current interfaces
    Vpccidr,

    /// Show the peered VPC CIDRs associated with current interfaces
    Vpcpeercidr,

    /// List all known free IPs in the internal registry
    RegistryList,

    /// Free all IPs that have remained unused for a given interval
    RegistryGc {
        /// Reclaim addresses tracked free for longer than this, e.g. 10m
        #[arg(long, value_parser = humantime::parse_duration)]
        free_after: Duration,

        /// Max number of ips to reap in a single run; -1 reaps all unused IPs
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        max_reap: i64,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Preconditions come before the lock is even considered.
    let imds = ImdsClient::new()?;
    if !imds.available() {
        return Err(Error::Precondition(
            "this command must be run from a running cloud instance".to_string(),
        )
        .into());
    }
    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::Precondition("this command must be run as root".to_string()).into());
    }

    let cloud = AwsCliClient::connect(imds)?;
    let net = KernelNetState;
    let registry = Registry::new();
    run_command(cli.command, &cloud, &net, &registry)?;
    Ok(())
}

fn run_command(
    command: Command,
    cloud: &dyn CloudClient,
    net: &dyn NetState,
    registry: &Registry,
) -> std::result::Result<(), Error> {
    match command {
        Command::NewInterface {
            security_groups,
            subnet_filter,
            ip_batch_size,
        } => {
            let iface = lock::run_locked(|| {
                interface::new_interface(cloud, &security_groups, &subnet_filter, ip_batch_size)
            })?;
            print_table([InterfaceRow::from(&iface)]);
            Ok(())
        }

        Command::RemoveInterface { interface_ids } => {
            lock::run_locked(|| interface::remove_interfaces(cloud, &interface_ids))
        }

        Command::AllocateFirstAvailable {
            index,
            ip_batch_size,
        } => {
            let outcome =
                lock::run_locked(|| address::allocate_at_index(cloud, index, ip_batch_size));
            match outcome {
                Ok(allocations) => {
                    print_allocations(&allocations);
                    Ok(())
                }
                // Print what was granted before reporting the shortfall.
                Err(Error::PartialAllocation { granted, requested }) => {
                    print_allocations(&granted);
                    Err(Error::PartialAllocation { granted, requested })
                }
                Err(e) => Err(e),
            }
        }

        Command::Deallocate { ips } => {
            lock::run_locked(|| address::deallocate_all(cloud, registry, &ips))
        }

        Command::FreeIps => {
            let free = address::find_free_ips(cloud, net, registry, false)?;
            print_table(free.iter().map(|alloc| AdapterIpRow {
                adapter: alloc.interface.local_name(),
                ip: alloc.ip.to_string(),
            }));
            Ok(())
        }

        Command::Eniif => {
            let interfaces = cloud.list_interfaces()?;
            print_table(interfaces.iter().map(InterfaceRow::from));
            Ok(())
        }

        Command::Addr => {
            let bound = net.list_assigned_addresses()?;
            print_table(bound.iter().map(|addr| IfaceIpRow {
                iface: addr.label.clone(),
                ip: addr.ip.to_string(),
            }));
            Ok(())
        }

        Command::Subnets => {
            let subnets = subnet::eligible_subnets(cloud, &Filter::default())?;
            print_table(subnets.iter().map(|s| SubnetRow {
                id: s.id.clone(),
                cidr: s.cidr.to_string(),
                default: s.is_default,
                addresses_available: s.available_addresses,
                tags: s
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(","),
            }));
            Ok(())
        }

        Command::Limits => {
            let limits = cloud.instance_limits()?;
            print_table([LimitsRow {
                adapters: limits.adapters,
                ipv4: limits.ipv4_per_adapter,
                ipv6: limits.ipv6_per_adapter,
            }]);
            Ok(())
        }

        Command::Maxpods { max } => {
            let limits = cloud.instance_limits()?;
            println!("{}", limits.max_pods(max));
            Ok(())
        }

        Command::Diagnostics => {
            let snapshot = diag::Snapshot::gather(cloud, net, registry)?;
            print_table(diag::evaluate(&snapshot).into_iter().map(
                |(name, present)| DiagnosticRow {
                    rule: name.to_string(),
                    present,
                },
            ));
            Ok(())
        }

        Command::Vpccidr => {
            let interfaces = cloud.list_interfaces()?;
            let mut rows = Vec::new();
            for iface in &interfaces {
                let cidrs = cloud.describe_vpc_cidrs(&iface.vpc_id)?;
                rows.push(IfaceCidrRow {
                    iface: iface.local_name(),
                    cidrs: join_cidrs(&cidrs),
                });
            }
            print_table(rows);
            Ok(())
        }

        Command::Vpcpeercidr => {
            let interfaces = cloud.list_interfaces()?;
            let mut rows = Vec::new();
            for iface in &interfaces {
                let cidrs = cloud.describe_vpc_peer_cidrs(&iface.vpc_id)?;
                rows.push(IfaceCidrRow {
                    iface: iface.local_name(),
                    cidrs: join_cidrs(&cidrs),
                });
            }
            print_table(rows);
            Ok(())
        }

        Command::RegistryList => {
            let ips = registry.list()?;
            print_table(ips.iter().map(|ip| IpRow { ip: ip.to_string() }));
            Ok(())
        }

        Command::RegistryGc {
            free_after,
            max_reap,
        } => lock::run_locked(|| {
            gc::run(cloud, net, registry, free_after, gc::DEFAULT_JITTER, max_reap)
        }),
    }
}

fn print_allocations(allocations: &[AddressAllocation]) {
    for alloc in allocations {
        println!("allocated {} on {}", alloc.ip, alloc.interface.local_name());
    }
}

fn join_cidrs(cidrs: &[ipnet::IpNet]) -> String {
    cidrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn print_table<T: Tabled>(rows: impl IntoIterator<Item = T>) {
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 3, 0, 0))
        .to_string();
    println!("{table}");
}

#[derive(Tabled)]
struct InterfaceRow {
    iface: String,
    mac: String,
    id: String,
    subnet: String,
    subnet_cidr: String,
    secgrps: String,
    vpc: String,
    ips: String,
}

impl From<&Interface> for InterfaceRow {
    fn from(iface: &Interface) -> Self {
        InterfaceRow {
            iface: iface.local_name(),
            mac: iface.mac.clone(),
            id: iface.id.clone(),
            subnet: iface.subnet_id.clone(),
            subnet_cidr: iface.subnet_cidr.to_string(),
            secgrps: iface.security_group_ids.join(","),
            vpc: iface.vpc_id.clone(),
            ips: iface
                .ipv4s
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

#[derive(Tabled)]
struct AdapterIpRow {
    adapter: String,
    ip: String,
}

#[derive(Tabled)]
struct IfaceIpRow {
    iface: String,
    ip: String,
}

#[derive(Tabled)]
struct IfaceCidrRow {
    iface: String,
    cidrs: String,
}

#[derive(Tabled)]
struct SubnetRow {
    id: String,
    cidr: String,
    default: bool,
    addresses_available: u32,
    tags: String,
}

#[derive(Tabled)]
struct LimitsRow {
    adapters: u32,
    ipv4: u32,
    ipv6: u32,
}

#[derive(Tabled)]
struct DiagnosticRow {
    rule: String,
    present: bool,
}

#[derive(Tabled)]
struct IpRow {
    ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_interface_parsing() {
        let cli = Cli::parse_from([
            "eni-ipam",
            "new-interface",
            "sg-123",
            "sg-456",
            "--subnet_filter",
            "environment=prod",
            "--ip_batch_size",
            "2",
        ]);
        match cli.command {
            Command::NewInterface {
                security_groups,
                subnet_filter,
                ip_batch_size,
            } => {
                assert_eq!(security_groups, vec!["sg-123", "sg-456"]);
                assert_eq!(subnet_filter, Filter::parse("environment=prod").unwrap());
                assert_eq!(ip_batch_size, 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_new_interface_requires_security_groups() {
        assert!(Cli::try_parse_from(["eni-ipam", "new-interface"]).is_err());
    }

    #[test]
    fn test_allocate_defaults_to_first_available() {
        let cli = Cli::parse_from(["eni-ipam", "allocate-first-available"]);
        match cli.command {
            Command::AllocateFirstAvailable {
                index,
                ip_batch_size,
            } => {
                assert_eq!(index, None);
                assert_eq!(ip_batch_size, 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_deallocate_rejects_unparseable_ip() {
        assert!(Cli::try_parse_from(["eni-ipam", "deallocate", "not-an-ip"]).is_err());
    }

    #[test]
    fn test_deallocate_parses_multiple_ips() {
        let cli = Cli::parse_from(["eni-ipam", "deallocate", "10.0.1.5", "10.0.1.6"]);
        match cli.command {
            Command::Deallocate { ips } => assert_eq!(ips.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_registry_gc_parses_duration_and_default_reap() {
        let cli = Cli::parse_from(["eni-ipam", "registry-gc", "--free-after", "10m"]);
        match cli.command {
            Command::RegistryGc {
                free_after,
                max_reap,
            } => {
                assert_eq!(free_after, Duration::from_secs(600));
                assert_eq!(max_reap, -1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_registry_gc_requires_free_after() {
        assert!(Cli::try_parse_from(["eni-ipam", "registry-gc"]).is_err());
    }

    #[test]
    fn test_maxpods_cap_flag() {
        let cli = Cli::parse_from(["eni-ipam", "maxpods", "--max", "20"]);
        match cli.command {
            Command::Maxpods { max } => assert_eq!(max, Some(20)),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
