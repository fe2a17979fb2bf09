//! Core domain model for RCW: reward products, catalog diffing,
//! category grouping and run statistics. Pure functions only.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rcw-core";

/// Subtype tag marking catalog records that must never appear in digests
/// or statistics, regardless of their point cost.
pub const NO_TRIGGER_SUB_TYPE: &str = "Experiential_notrigger";

/// Category label used when a record carries no `biType`.
pub const DEFAULT_CATEGORY: &str = "Other";

/// Nested description block on a catalog record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardsInfo {
    #[serde(default)]
    pub description: Option<String>,
}

/// One entry of the upstream rewards catalog.
///
/// Every semantic field is optional or defaulted so that partial upstream
/// records still parse at the fetch boundary; fields we do not model are
/// kept in `extra` so a persisted snapshot round-trips the full record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardProduct {
    pub product_id: String,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub brand_name: Option<String>,
    #[serde(default)]
    pub reward_points: u64,
    #[serde(default)]
    pub reward_sub_type: Option<String>,
    #[serde(default)]
    pub bi_type: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub full_size_product_url: Option<String>,
    #[serde(default)]
    pub rewards_info: Option<RewardsInfo>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RewardProduct {
    /// Records tagged with the no-trigger subtype are catalog noise as far
    /// as notifications and statistics are concerned.
    pub fn is_notifiable(&self) -> bool {
        self.reward_sub_type.as_deref() != Some(NO_TRIGGER_SUB_TYPE)
    }

    pub fn category(&self) -> &str {
        self.bi_type.as_deref().unwrap_or(DEFAULT_CATEGORY)
    }

    /// Display name, falling back to the product id for nameless records.
    pub fn display_name(&self) -> &str {
        self.product_name.as_deref().unwrap_or(&self.product_id)
    }

    pub fn description(&self) -> Option<&str> {
        self.rewards_info.as_ref()?.description.as_deref()
    }
}

/// Identity diff on `product_id`: every element of `latest` whose id does
/// not appear in `previous`, in `latest`'s order. Field-level changes to a
/// product that keeps its id are invisible to this diff.
pub fn diff_catalog(previous: &[RewardProduct], latest: &[RewardProduct]) -> Vec<RewardProduct> {
    let known: HashSet<&str> = previous.iter().map(|p| p.product_id.as_str()).collect();
    latest
        .iter()
        .filter(|p| !known.contains(p.product_id.as_str()))
        .cloned()
        .collect()
}

/// Group products by category, preserving first-seen category order and
/// first-seen product order within each category.
pub fn group_by_category<'a, I>(products: I) -> Vec<(String, Vec<&'a RewardProduct>)>
where
    I: IntoIterator<Item = &'a RewardProduct>,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<&RewardProduct>)> = Vec::new();
    for product in products {
        let category = product.category();
        match index.get(category) {
            Some(&slot) => groups[slot].1.push(product),
            None => {
                index.insert(category.to_string(), groups.len());
                groups.push((category.to_string(), vec![product]));
            }
        }
    }
    groups
}

/// Keep products that are notifiable and cost at least `min_points`.
pub fn notifiable_above(products: &[RewardProduct], min_points: u64) -> Vec<&RewardProduct> {
    products
        .iter()
        .filter(|p| p.is_notifiable() && p.reward_points >= min_points)
        .collect()
}

/// Derived, non-persisted summary of a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogStats {
    pub latest_total: usize,
    pub stored_total: usize,
    pub difference: i64,
    pub products_added: BTreeMap<String, Vec<Vec<String>>>,
    pub products_deleted: BTreeMap<String, Vec<Vec<String>>>,
    pub categories_added: Vec<String>,
    pub categories_deleted: Vec<String>,
}

/// Summarize a run: counts exclude no-trigger records on both sides.
///
/// When `difference > 0` the new-products grouping is emitted under both
/// the `*_added` and `*_deleted` keys. The legacy worker never computed a
/// true deleted set and downstream consumers grew around that shape;
/// callers must not read `products_deleted` as removals.
pub fn summarize(new_products: &[RewardProduct], previous: &[RewardProduct]) -> CatalogStats {
    let notifiable_new: Vec<&RewardProduct> =
        new_products.iter().filter(|p| p.is_notifiable()).collect();
    let latest_total = notifiable_new.len();
    let stored_total = previous.iter().filter(|p| p.is_notifiable()).count();
    let difference = latest_total as i64 - stored_total as i64;

    let mut stats = CatalogStats {
        latest_total,
        stored_total,
        difference,
        ..CatalogStats::default()
    };

    if difference > 0 {
        let groups = group_by_category(notifiable_new.iter().copied());
        for (category, products) in &groups {
            let names: Vec<String> = products
                .iter()
                .map(|p| p.display_name().to_string())
                .collect();
            stats
                .products_added
                .insert(category.clone(), vec![names.clone()]);
            stats.products_deleted.insert(category.clone(), vec![names]);
            stats.categories_added.push(category.clone());
            stats.categories_deleted.push(category.clone());
        }
    }

    stats
}
