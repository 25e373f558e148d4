//! The closed set of record kinds synchronized from the source system.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Group,
    Currency,
    Unit,
    StockGroup,
    StockCategory,
    CostCategory,
    CostCenter,
    Godown,
    VoucherType,
    TaxUnit,
    Ledger,
    StockItem,
    Voucher,
    BillsOutstanding,
}

/// Master kinds in dependency order: later kinds reference identifiers introduced by
/// earlier ones, so this order must be preserved by every sync loop.
pub const MASTER_SEQUENCE: [EntityKind; 12] = [
    EntityKind::Group,
    EntityKind::Currency,
    EntityKind::Unit,
    EntityKind::StockGroup,
    EntityKind::StockCategory,
    EntityKind::CostCategory,
    EntityKind::CostCenter,
    EntityKind::Godown,
    EntityKind::VoucherType,
    EntityKind::TaxUnit,
    EntityKind::Ledger,
    EntityKind::StockItem,
];

/// Steps of a company-specific manual sync: all masters, then transactions.
pub const FULL_SEQUENCE: [EntityKind; 14] = [
    EntityKind::Group,
    EntityKind::Currency,
    EntityKind::Unit,
    EntityKind::StockGroup,
    EntityKind::StockCategory,
    EntityKind::CostCategory,
    EntityKind::CostCenter,
    EntityKind::Godown,
    EntityKind::VoucherType,
    EntityKind::TaxUnit,
    EntityKind::Ledger,
    EntityKind::StockItem,
    EntityKind::Voucher,
    EntityKind::BillsOutstanding,
];

impl EntityKind {
    /// Name used on the connector boundary and in user-facing messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Group => "Group",
            EntityKind::Currency => "Currency",
            EntityKind::Unit => "Unit",
            EntityKind::StockGroup => "StockGroup",
            EntityKind::StockCategory => "StockCategory",
            EntityKind::CostCategory => "CostCategory",
            EntityKind::CostCenter => "CostCenter",
            EntityKind::Godown => "Godown",
            EntityKind::VoucherType => "VoucherType",
            EntityKind::TaxUnit => "TaxUnit",
            EntityKind::Ledger => "Ledger",
            EntityKind::StockItem => "StockItem",
            EntityKind::Voucher => "Voucher",
            EntityKind::BillsOutstanding => "BillsOutstanding",
        }
    }

    /// Canonical key in the backend's master-mapping response.
    pub fn mapping_key(&self) -> &'static str {
        match self {
            EntityKind::Group => "group",
            EntityKind::Currency => "currency",
            EntityKind::Unit => "units",
            EntityKind::StockGroup => "stockgroup",
            EntityKind::StockCategory => "stockcategory",
            EntityKind::CostCategory => "costcategory",
            EntityKind::CostCenter => "costcenter",
            EntityKind::Godown => "godown",
            EntityKind::VoucherType => "vouchertype",
            EntityKind::TaxUnit => "taxunit",
            EntityKind::Ledger => "ledger",
            EntityKind::StockItem => "stockitem",
            EntityKind::Voucher => "voucher",
            EntityKind::BillsOutstanding => "billsoutstanding",
        }
    }

    /// Resolve a master-mapping key. Keys are compared lower-cased with `_`/`-` removed,
    /// and singular/plural spellings are both accepted.
    pub fn from_mapping_key(key: &str) -> Option<Self> {
        let norm: String = key
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        let kind = match norm.as_str() {
            "group" | "groups" => EntityKind::Group,
            "currency" | "currencies" => EntityKind::Currency,
            "unit" | "units" => EntityKind::Unit,
            "stockgroup" | "stockgroups" => EntityKind::StockGroup,
            "stockcategory" | "stockcategories" => EntityKind::StockCategory,
            "costcategory" | "costcategories" => EntityKind::CostCategory,
            "costcenter" | "costcenters" | "costcentre" | "costcentres" => EntityKind::CostCenter,
            "godown" | "godowns" => EntityKind::Godown,
            "vouchertype" | "vouchertypes" => EntityKind::VoucherType,
            "taxunit" | "taxunits" => EntityKind::TaxUnit,
            "ledger" | "ledgers" => EntityKind::Ledger,
            "stockitem" | "stockitems" => EntityKind::StockItem,
            "voucher" | "vouchers" => EntityKind::Voucher,
            "billsoutstanding" | "bills" => EntityKind::BillsOutstanding,
            _ => return None,
        };
        Some(kind)
    }

    /// Backend collection path segment (`GET /{path}/company/{id}`).
    pub fn collection_path(&self) -> &'static str {
        match self {
            EntityKind::Group => "groups",
            EntityKind::Currency => "currencies",
            EntityKind::Unit => "units",
            EntityKind::StockGroup => "stock-groups",
            EntityKind::StockCategory => "stock-categories",
            EntityKind::CostCategory => "cost-categories",
            EntityKind::CostCenter => "cost-centers",
            EntityKind::Godown => "godowns",
            EntityKind::VoucherType => "voucher-types",
            EntityKind::TaxUnit => "tax-units",
            EntityKind::Ledger => "ledgers",
            EntityKind::StockItem => "stock-items",
            EntityKind::Voucher => "vouchers",
            EntityKind::BillsOutstanding => "bills-outstanding",
        }
    }

    pub fn is_master(&self) -> bool {
        !matches!(self, EntityKind::Voucher | EntityKind::BillsOutstanding)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FULL_SEQUENCE
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .or_else(|| Self::from_mapping_key(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity type '{s}'")))
    }
}
