//! Cloud-inventory collaborator and subnet discovery.

use crate::gateway::identity::join_api;
use crate::gateway::types::{GatewayError, GatewayErrorKind, GatewayResult, Subnet};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One address reservation as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpReservation {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub gateway: String,
    pub network: String,
    pub netmask: String,
    pub cidr: u8,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "default_family")]
    pub address_family: u8,
}

fn default_family() -> u8 {
    4
}

impl IpReservation {
    /// Private IPv4 reservations become routes; everything else is ignored.
    pub fn routable(&self) -> bool {
        !self.public && self.address_family == 4
    }

    pub fn to_subnet(&self) -> GatewayResult<Subnet> {
        let parse = |raw: &str, what: &str| {
            raw.parse::<Ipv4Addr>().map_err(|_| {
                GatewayError::new(
                    GatewayErrorKind::Inventory,
                    format!("reservation has invalid {}", what),
                )
                .with_detail(raw.to_string())
            })
        };
        if self.cidr > 32 {
            return Err(GatewayError::new(
                GatewayErrorKind::Inventory,
                "reservation has invalid cidr",
            )
            .with_detail(self.cidr.to_string()));
        }
        Ok(Subnet {
            network: parse(&self.network, "network")?,
            netmask: parse(&self.netmask, "netmask")?,
            cidr: self.cidr,
        })
    }
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn list_projects(&self, token: &str) -> GatewayResult<Vec<Project>>;

    async fn list_reservations(
        &self,
        token: &str,
        project: &Project,
    ) -> GatewayResult<Vec<IpReservation>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enumerate routable subnets across every project, one task per project.
///
/// Results are returned in project order. The first failing project aborts
/// the remaining lookups.
pub async fn discover_subnets(
    inventory: Arc<dyn Inventory>,
    token: &str,
) -> GatewayResult<Vec<Subnet>> {
    let projects = inventory.list_projects(token).await?;
    if projects.is_empty() {
        return Err(GatewayError::new(
            GatewayErrorKind::Inventory,
            "no projects found",
        ));
    }

    let found: Arc<Mutex<Vec<(usize, Vec<Subnet>)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();
    for (idx, project) in projects.into_iter().enumerate() {
        let inventory = inventory.clone();
        let found = found.clone();
        let token = token.to_string();
        tasks.spawn(async move {
            let reservations = inventory
                .list_reservations(&token, &project)
                .await
                .map_err(|e| {
                    let detail = match &e.detail {
                        Some(d) => format!("project={}: {}", project.id, d),
                        None => format!("project={}", project.id),
                    };
                    e.with_detail(detail)
                })?;
            let subnets = reservations
                .iter()
                .filter(|r| r.routable())
                .map(IpReservation::to_subnet)
                .collect::<GatewayResult<Vec<_>>>()?;
            if !subnets.is_empty() {
                found.lock().await.push((idx, subnets));
            }
            Ok::<(), GatewayError>(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| {
            GatewayError::new(GatewayErrorKind::Internal, "subnet discovery task failed")
                .with_detail(e.to_string())
        });
        if let Err(e) = outcome.and_then(|r| r) {
            tasks.abort_all();
            return Err(e);
        }
    }

    let mut per_project = std::mem::take(&mut *found.lock().await);
    per_project.sort_by_key(|(idx, _)| *idx);
    let subnets: Vec<Subnet> = per_project.into_iter().flat_map(|(_, s)| s).collect();

    if subnets.is_empty() {
        return Err(GatewayError::new(
            GatewayErrorKind::NoRoutes,
            "no backend routes to push",
        ));
    }
    Ok(subnets)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Static inventory (testing environment)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fixed inventory with a single project.
#[derive(Debug, Clone)]
pub struct StaticInventory {
    reservations: Vec<IpReservation>,
}

impl StaticInventory {
    pub fn new(reservations: Vec<IpReservation>) -> Self {
        Self { reservations }
    }

    /// The reservation served in the testing environment.
    pub fn testing() -> Self {
        Self::new(vec![IpReservation {
            address: "10.88.111.11".into(),
            gateway: "10.88.111.1".into(),
            network: "10.88.111.0".into(),
            netmask: "255.255.255.128".into(),
            cidr: 25,
            public: false,
            address_family: 4,
        }])
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn list_projects(&self, _token: &str) -> GatewayResult<Vec<Project>> {
        Ok(vec![Project {
            id: "static".into(),
            name: "static".into(),
        }])
    }

    async fn list_reservations(
        &self,
        _token: &str,
        _project: &Project,
    ) -> GatewayResult<Vec<IpReservation>> {
        Ok(self.reservations.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct ProjectList {
    #[serde(default)]
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct IpList {
    #[serde(default)]
    ip_addresses: Vec<IpReservation>,
}

pub struct HttpInventory {
    http: Client,
    api_host: Url,
    consumer_token: String,
}

impl HttpInventory {
    pub fn new(api_host: Url, consumer_token: impl Into<String>) -> GatewayResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                GatewayError::new(GatewayErrorKind::Internal, "building http client")
                    .with_detail(e.to_string())
            })?;
        Ok(Self {
            http,
            api_host,
            consumer_token: consumer_token.into(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, token: &str, path: &str) -> GatewayResult<T> {
        let url = join_api(&self.api_host, path)?;
        let inventory_err = |msg: &str, detail: String| {
            GatewayError::new(GatewayErrorKind::Inventory, format!("{} {}", msg, path))
                .with_detail(detail)
        };

        let response = self
            .http
            .get(url)
            .header("X-Auth-Token", token)
            .header("X-Consumer-Token", &self.consumer_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| inventory_err("request failed:", e.without_url().to_string()))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(inventory_err("listing", format!("status {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| inventory_err("decoding", e.to_string()))
    }
}

#[async_trait]
impl Inventory for HttpInventory {
    async fn list_projects(&self, token: &str) -> GatewayResult<Vec<Project>> {
        let list: ProjectList = self.get(token, "projects").await?;
        Ok(list.projects)
    }

    async fn list_reservations(
        &self,
        token: &str,
        project: &Project,
    ) -> GatewayResult<Vec<IpReservation>> {
        let list: IpList = self
            .get(token, &format!("projects/{}/ips", project.id))
            .await?;
        Ok(list.ip_addresses)
    }
}
