//! `CloudClient` backed by the AWS CLI.
//!
//! The engine is transport-agnostic; authentication, signing, and wire
//! details stay with `aws ec2 ... --output json`, and this adapter parses
//! the JSON responses into the crate's data model. Every call shells out
//! once (plus a subnet lookup where the response lacks CIDRs); nothing is
//! cached across invocations.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use ipnet::IpNet;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::imds::{ImdsClient, InstanceIdentity};
use super::{CloudClient, InstanceLimits, Interface, Subnet};
use crate::error::{Error, Result};

const DETACH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DETACH_POLL_ATTEMPTS: u32 = 20;

pub struct AwsCliClient {
    imds: ImdsClient,
    identity: InstanceIdentity,
}

impl AwsCliClient {
    /// Build a client for the instance this process runs on.
    pub fn connect(imds: ImdsClient) -> Result<Self> {
        let identity = imds.identity()?;
        Ok(AwsCliClient { imds, identity })
    }

    fn ec2_raw(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!("aws ec2 {}", args.join(" "));
        let output = Command::new("aws")
            .arg("ec2")
            .args(args)
            .args(["--region", self.identity.region(), "--output", "json"])
            .output()
            .map_err(|e| Error::Cloud(format!("cannot run aws cli: {e}")))?;
        if !output.status.success() {
            let action = args.first().copied().unwrap_or("ec2");
            return Err(Error::Cloud(format!(
                "aws {action} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn ec2<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.ec2_raw(args)?;
        let action = args.first().copied().unwrap_or("ec2");
        serde_json::from_slice(&stdout)
            .map_err(|e| Error::Cloud(format!("unparseable response from aws {action}: {e}")))
    }

    fn subnet_cidrs(&self, subnet_ids: &[&str]) -> Result<BTreeMap<String, IpNet>> {
        if subnet_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut args = vec!["describe-subnets", "--subnet-ids"];
        args.extend(subnet_ids);
        let resp: DescribeSubnetsResponse = self.ec2(&args)?;
        Ok(resp
            .subnets
            .into_iter()
            .map(|s| (s.subnet_id, s.cidr_block))
            .collect())
    }

    fn describe_own_interfaces(&self) -> Result<Vec<ApiInterface>> {
        let filter = format!(
            "Name=attachment.instance-id,Values={}",
            self.identity.instance_id
        );
        let resp: DescribeNetworkInterfacesResponse =
            self.ec2(&["describe-network-interfaces", "--filters", &filter])?;
        Ok(resp.network_interfaces)
    }

    fn interface_attachment(&self, id: &str) -> Result<Option<ApiAttachment>> {
        let resp: DescribeNetworkInterfacesResponse =
            self.ec2(&["describe-network-interfaces", "--network-interface-ids", id])?;
        let iface = resp
            .network_interfaces
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("interface {id}")))?;
        Ok(iface.attachment)
    }
}

impl CloudClient for AwsCliClient {
    fn is_running_on_cloud_instance(&self) -> bool {
        self.imds.available()
    }

    fn instance_limits(&self) -> Result<InstanceLimits> {
        let resp: DescribeInstanceTypesResponse = self.ec2(&[
            "describe-instance-types",
            "--instance-types",
            &self.identity.instance_type,
        ])?;
        let info = resp
            .instance_types
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Cloud(format!(
                    "no limit data for instance type {}",
                    self.identity.instance_type
                ))
            })?
            .network_info;
        Ok(InstanceLimits {
            adapters: info.maximum_network_interfaces,
            ipv4_per_adapter: info.ipv4_addresses_per_interface,
            ipv6_per_adapter: info.ipv6_addresses_per_interface,
        })
    }

    fn list_interfaces(&self) -> Result<Vec<Interface>> {
        let raw = self.describe_own_interfaces()?;
        let subnet_ids: Vec<&str> = raw
            .iter()
            .map(|i| i.subnet_id.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let cidrs = self.subnet_cidrs(&subnet_ids)?;

        let mut interfaces = raw
            .into_iter()
            .map(|api| to_interface(api, &cidrs))
            .collect::<Result<Vec<_>>>()?;
        interfaces.sort_by_key(|iface| iface.device_index);
        Ok(interfaces)
    }

    fn list_subnets(&self) -> Result<Vec<Subnet>> {
        let vpc = self.imds.vpc_id()?;
        let vpc_filter = format!("Name=vpc-id,Values={vpc}");
        let az_filter = format!(
            "Name=availability-zone,Values={}",
            self.identity.availability_zone
        );
        let resp: DescribeSubnetsResponse = self.ec2(&[
            "describe-subnets",
            "--filters",
            &vpc_filter,
            &az_filter,
        ])?;
        Ok(resp.subnets.into_iter().map(ApiSubnet::into_subnet).collect())
    }

    fn create_interface(&self, subnet: &Subnet, security_groups: &[String]) -> Result<Interface> {
        let mut args = vec![
            "create-network-interface",
            "--subnet-id",
            subnet.id.as_str(),
            "--groups",
        ];
        args.extend(security_groups.iter().map(String::as_str));
        let created: CreateNetworkInterfaceResponse = self.ec2(&args)?;
        let id = created.network_interface.network_interface_id.clone();

        // Attach at the next free device index.
        let device_index = self
            .describe_own_interfaces()?
            .iter()
            .filter_map(|i| i.attachment.as_ref())
            .map(|a| a.device_index + 1)
            .max()
            .unwrap_or(1)
            .to_string();
        let attached: AttachNetworkInterfaceResponse = self.ec2(&[
            "attach-network-interface",
            "--network-interface-id",
            &id,
            "--instance-id",
            &self.identity.instance_id,
            "--device-index",
            &device_index,
        ])?;

        // Tie the adapter's lifetime to the instance.
        let attachment = format!(
            "AttachmentId={},DeleteOnTermination=true",
            attached.attachment_id
        );
        self.ec2_raw(&[
            "modify-network-interface-attribute",
            "--network-interface-id",
            &id,
            "--attachment",
            &attachment,
        ])?;

        let cidrs = self.subnet_cidrs(&[created.network_interface.subnet_id.as_str()])?;
        to_interface(created.network_interface, &cidrs)
    }

    fn remove_interface(&self, id: &str) -> Result<()> {
        if let Some(attachment) = self.interface_attachment(id)? {
            self.ec2_raw(&[
                "detach-network-interface",
                "--attachment-id",
                &attachment.attachment_id,
                "--force",
            ])?;
            // The detach was accepted; wait for it to settle so the delete
            // below does not race the attachment teardown.
            for _ in 0..DETACH_POLL_ATTEMPTS {
                if self.interface_attachment(id)?.is_none() {
                    break;
                }
                sleep(DETACH_POLL_INTERVAL);
            }
        }
        self.ec2_raw(&["delete-network-interface", "--network-interface-id", id])?;
        Ok(())
    }

    fn allocate_addresses(&self, interface: &Interface, count: u32) -> Result<Vec<IpAddr>> {
        let count = count.to_string();
        let resp: AssignPrivateIpAddressesResponse = self.ec2(&[
            "assign-private-ip-addresses",
            "--network-interface-id",
            &interface.id,
            "--secondary-private-ip-address-count",
            &count,
        ])?;
        Ok(resp
            .assigned_private_ip_addresses
            .into_iter()
            .map(|a| a.private_ip_address)
            .collect())
    }

    fn release_address(&self, ip: IpAddr) -> Result<()> {
        // Resolve the owning interface on this instance at release time.
        let owner = self
            .describe_own_interfaces()?
            .into_iter()
            .find(|iface| {
                iface
                    .private_ip_addresses
                    .iter()
                    .any(|p| p.private_ip_address == ip)
            })
            .ok_or_else(|| Error::NotFound(format!("{ip} is not assigned to this instance")))?;
        let ip = ip.to_string();
        self.ec2_raw(&[
            "unassign-private-ip-addresses",
            "--network-interface-id",
            &owner.network_interface_id,
            "--private-ip-addresses",
            &ip,
        ])?;
        Ok(())
    }

    fn describe_vpc_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>> {
        let resp: DescribeVpcsResponse = self.ec2(&["describe-vpcs", "--vpc-ids", vpc_id])?;
        Ok(resp
            .vpcs
            .into_iter()
            .flat_map(|vpc| vpc.cidr_block_association_set)
            .map(|assoc| assoc.cidr_block)
            .collect())
    }

    fn describe_vpc_peer_cidrs(&self, vpc_id: &str) -> Result<Vec<IpNet>> {
        let requester = format!("Name=requester-vpc-info.vpc-id,Values={vpc_id}");
        let accepter = format!("Name=accepter-vpc-info.vpc-id,Values={vpc_id}");

        let mut cidrs = Vec::new();
        let as_requester: DescribeVpcPeeringConnectionsResponse = self.ec2(&[
            "describe-vpc-peering-connections",
            "--filters",
            &requester,
        ])?;
        for peering in as_requester.vpc_peering_connections {
            cidrs.extend(peering.accepter_vpc_info.cidr_block);
        }
        let as_accepter: DescribeVpcPeeringConnectionsResponse = self.ec2(&[
            "describe-vpc-peering-connections",
            "--filters",
            &accepter,
        ])?;
        for peering in as_accepter.vpc_peering_connections {
            cidrs.extend(peering.requester_vpc_info.cidr_block);
        }
        Ok(cidrs)
    }
}

fn to_interface(api: ApiInterface, cidrs: &BTreeMap<String, IpNet>) -> Result<Interface> {
    let subnet_cidr = cidrs.get(&api.subnet_id).copied().ok_or_else(|| {
        Error::Cloud(format!("no CIDR known for subnet {}", api.subnet_id))
    })?;

    // Primary address first, then secondaries in cloud order.
    let mut ipv4s: Vec<IpAddr> = api
        .private_ip_addresses
        .iter()
        .filter(|p| p.primary)
        .map(|p| p.private_ip_address)
        .collect();
    ipv4s.extend(
        api.private_ip_addresses
            .iter()
            .filter(|p| !p.primary)
            .map(|p| p.private_ip_address),
    );

    Ok(Interface {
        id: api.network_interface_id,
        mac: api.mac_address,
        security_group_ids: api.groups.into_iter().map(|g| g.group_id).collect(),
        subnet_id: api.subnet_id,
        subnet_cidr,
        vpc_id: api.vpc_id,
        device_index: api.attachment.map(|a| a.device_index).unwrap_or(0),
        ipv4s,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnetsResponse {
    subnets: Vec<ApiSubnet>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiSubnet {
    subnet_id: String,
    cidr_block: IpNet,
    #[serde(default)]
    default_for_az: bool,
    #[serde(default)]
    available_ip_address_count: u32,
    #[serde(default)]
    tags: Vec<ApiTag>,
}

impl ApiSubnet {
    fn into_subnet(self) -> Subnet {
        Subnet {
            id: self.subnet_id,
            cidr: self.cidr_block,
            is_default: self.default_for_az,
            available_addresses: self.available_ip_address_count,
            tags: self.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiTag {
    key: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeNetworkInterfacesResponse {
    network_interfaces: Vec<ApiInterface>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiInterface {
    network_interface_id: String,
    mac_address: String,
    #[serde(default)]
    groups: Vec<ApiGroup>,
    subnet_id: String,
    vpc_id: String,
    #[serde(default)]
    private_ip_addresses: Vec<ApiPrivateIp>,
    attachment: Option<ApiAttachment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiGroup {
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiPrivateIp {
    private_ip_address: IpAddr,
    #[serde(default)]
    primary: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiAttachment {
    attachment_id: String,
    device_index: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateNetworkInterfaceResponse {
    network_interface: ApiInterface,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachNetworkInterfaceResponse {
    attachment_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssignPrivateIpAddressesResponse {
    #[serde(default)]
    assigned_private_ip_addresses: Vec<ApiAssignedIp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiAssignedIp {
    private_ip_address: IpAddr,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstanceTypesResponse {
    instance_types: Vec<ApiInstanceType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiInstanceType {
    network_info: ApiNetworkInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiNetworkInfo {
    maximum_network_interfaces: u32,
    ipv4_addresses_per_interface: u32,
    ipv6_addresses_per_interface: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVpcsResponse {
    vpcs: Vec<ApiVpc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiVpc {
    #[serde(default)]
    cidr_block_association_set: Vec<ApiCidrAssociation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiCidrAssociation {
    cidr_block: IpNet,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVpcPeeringConnectionsResponse {
    #[serde(default)]
    vpc_peering_connections: Vec<ApiPeering>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiPeering {
    requester_vpc_info: ApiPeerVpcInfo,
    accepter_vpc_info: ApiPeerVpcInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiPeerVpcInfo {
    #[serde(default)]
    cidr_block: Option<IpNet>,
}
