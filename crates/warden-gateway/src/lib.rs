//! # warden-gateway
//!
//! Core of the warden VPN access gateway.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Shared records, error kinds and categories |
//! | **config** | Environment-driven configuration and validation |
//! | **credentials** | Two-line credential bundle parsing |
//! | **ledger** | Certificate-authority ledger (`index.txt`) reader |
//! | **state** | Address pool + connection registry behind one lock |
//! | **identity** | Identity-provider client (password, one-time code, token) |
//! | **inventory** | Cloud inventory client and routable-subnet discovery |
//! | **agent** | Network / certificate agent invocation |
//! | **rollback** | Ordered compensation plan for partial failures |
//! | **pipeline** | Multi-stage client authentication |
//! | **teardown** | Session teardown shared by disconnect and revoke |
//! | **profile** | Client profile rendering and PEM extraction |
//! | **certs** | Client certificate lifecycle |
//! | **service** | Top-level service behind the RPC surface |
//! | **api** | HTTP/JSON RPC router |
//! | **metrics** | Counters and gauges, Prometheus text format |
//! | **supervisor** | Startup/shutdown sequencing around the VPN daemon |

pub mod gateway;
