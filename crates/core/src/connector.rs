//! Connectors and their declared capabilities.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::ConnectorId;

/// A named operation a connector declares it can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    FetchAccounts,
    FetchBalances,
    FetchExternalAccounts,
    FetchPayments,
    FetchOthers,
    CreateWebhooks,
    TranslateWebhooks,
    CreateBankAccount,
    CreateTransfer,
    CreatePayout,
    ReverseTransfer,
    ReversePayout,
    CreateUser,
    CreateUserLink,
    UpdateUserLink,
    CompleteUserLink,
    DeleteUser,
    DeleteUserConnection,
}

impl Capability {
    pub const ALL: [Capability; 18] = [
        Capability::FetchAccounts,
        Capability::FetchBalances,
        Capability::FetchExternalAccounts,
        Capability::FetchPayments,
        Capability::FetchOthers,
        Capability::CreateWebhooks,
        Capability::TranslateWebhooks,
        Capability::CreateBankAccount,
        Capability::CreateTransfer,
        Capability::CreatePayout,
        Capability::ReverseTransfer,
        Capability::ReversePayout,
        Capability::CreateUser,
        Capability::CreateUserLink,
        Capability::UpdateUserLink,
        Capability::CompleteUserLink,
        Capability::DeleteUser,
        Capability::DeleteUserConnection,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::FetchAccounts => "FETCH_ACCOUNTS",
            Capability::FetchBalances => "FETCH_BALANCES",
            Capability::FetchExternalAccounts => "FETCH_EXTERNAL_ACCOUNTS",
            Capability::FetchPayments => "FETCH_PAYMENTS",
            Capability::FetchOthers => "FETCH_OTHERS",
            Capability::CreateWebhooks => "CREATE_WEBHOOKS",
            Capability::TranslateWebhooks => "TRANSLATE_WEBHOOKS",
            Capability::CreateBankAccount => "CREATE_BANK_ACCOUNT",
            Capability::CreateTransfer => "CREATE_TRANSFER",
            Capability::CreatePayout => "CREATE_PAYOUT",
            Capability::ReverseTransfer => "REVERSE_TRANSFER",
            Capability::ReversePayout => "REVERSE_PAYOUT",
            Capability::CreateUser => "CREATE_USER",
            Capability::CreateUserLink => "CREATE_USER_LINK",
            Capability::UpdateUserLink => "UPDATE_USER_LINK",
            Capability::CompleteUserLink => "COMPLETE_USER_LINK",
            Capability::DeleteUser => "DELETE_USER",
            Capability::DeleteUserConnection => "DELETE_USER_CONNECTION",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed set of capabilities, stored as a bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<Capability>", from = "Vec<Capability>")]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(value: CapabilitySet) -> Self {
        value.iter().collect()
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(value: Vec<Capability>) -> Self {
        value.into_iter().collect()
    }
}

/// An installed integration with one external PSP or open-banking provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: ConnectorId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Opaque provider configuration, validated by the provider's plugin factory.
    pub config: serde_json::Value,
    pub capabilities: CapabilitySet,
    pub scheduled_for_deletion: bool,
}

impl Connector {
    pub fn new(
        id: ConnectorId,
        name: impl Into<String>,
        config: serde_json::Value,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            created_at: Utc::now(),
            config,
            capabilities,
            scheduled_for_deletion: false,
        }
    }

    pub fn provider(&self) -> &str {
        &self.id.provider
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

impl Entity for Connector {
    type Id = ConnectorId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
