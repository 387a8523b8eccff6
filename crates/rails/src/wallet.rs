//! Wallet backends and the credential shapes each one needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of outbound payment backends.
///
/// Adding a backend means adding a variant here plus its credential shape and
/// adapter; the engine's priority-ordered iteration stays untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    Lnd,
    Cln,
    LightningAddress,
}

impl WalletKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lnd => "lnd",
            Self::Cln => "cln",
            Self::LightningAddress => "lightning_address",
        }
    }

    /// Human form used in invoice descriptions and wallet log lines.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Lnd => "LND",
            Self::Cln => "CLN",
            Self::LightningAddress => "lightning address",
        }
    }
}

impl std::fmt::Display for WalletKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific connection/authentication material, as stored on the
/// wallet row. Fields are optional because rows can be saved incomplete;
/// each adapter validates what it needs and fails the attempt otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalletCredentials {
    Lnd {
        /// host:port of the node's REST endpoint.
        socket: Option<String>,
        /// Base64 TLS certificate to pin, when the node uses a self-signed one.
        cert: Option<String>,
        /// Base64 invoice macaroon.
        macaroon: Option<String>,
    },
    Cln {
        socket: Option<String>,
        cert: Option<String>,
        /// Invoice-scoped rune for the REST plugin.
        rune: Option<String>,
    },
    LightningAddress {
        address: Option<String>,
    },
}

impl WalletCredentials {
    #[must_use]
    pub fn kind(&self) -> WalletKind {
        match self {
            Self::Lnd { .. } => WalletKind::Lnd,
            Self::Cln { .. } => WalletKind::Cln,
            Self::LightningAddress { .. } => WalletKind::LightningAddress,
        }
    }
}

/// One user-attached wallet, as read from the ledger. Read-only here.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Higher priority is tried first.
    pub priority: i32,
    pub credentials: WalletCredentials,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    #[must_use]
    pub fn kind(&self) -> WalletKind {
        self.credentials.kind()
    }
}

/// Per-user context threaded through a rail attempt.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: Uuid,
    /// Suppresses descriptions on destination-node invoices.
    pub hide_invoice_desc: bool,
}
