//! Store topology and target-store resolution.
//!
//! The catalog is organized as websites containing store views. Every change
//! trigger resolves to a set of concrete store ids before anything is queued;
//! the rules here decide how far a change fans out (one store, a whole
//! website, or every store the product is assigned to).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config;
use crate::model::{ProductStatus, ADMIN_STORE_ID};

/// Attribute metadata needed by the widening rules: which attribute codes
/// hold one value per website rather than per store view. Resolved from
/// configuration at startup.
#[derive(Debug, Clone, Default)]
pub struct AttributeScopes {
    website_scoped: HashSet<String>,
}

impl AttributeScopes {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            website_scoped: codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(attributes: &config::Attributes) -> Self {
        Self::new(attributes.website_scoped.iter().cloned())
    }

    pub fn is_website_scoped(&self, code: &str) -> bool {
        self.website_scoped.contains(code)
    }
}

/// Store view definition used to build a topology.
#[derive(Debug, Clone)]
pub struct StoreDef {
    pub id: i64,
    pub code: String,
    pub active: bool,
}

/// Website definition: an ordered list of its store views.
#[derive(Debug, Clone)]
pub struct WebsiteDef {
    pub id: i64,
    pub code: String,
    pub stores: Vec<StoreDef>,
}

/// Immutable snapshot of the website/store layout.
#[derive(Debug, Clone, Default)]
pub struct StoreTopology {
    websites: BTreeMap<i64, Vec<i64>>,
    store_website: HashMap<i64, i64>,
    store_codes: HashMap<String, i64>,
    website_codes: HashMap<String, i64>,
    inactive: HashSet<i64>,
}

impl StoreTopology {
    pub fn new(websites: Vec<WebsiteDef>) -> Self {
        let mut topo = StoreTopology::default();
        for website in websites {
            let mut store_ids = Vec::with_capacity(website.stores.len());
            for store in website.stores {
                store_ids.push(store.id);
                topo.store_website.insert(store.id, website.id);
                topo.store_codes.insert(store.code, store.id);
                if !store.active {
                    topo.inactive.insert(store.id);
                }
            }
            topo.website_codes.insert(website.code, website.id);
            topo.websites.insert(website.id, store_ids);
        }
        topo
    }

    pub fn stores_of_website(&self, website_id: i64) -> &[i64] {
        self.websites
            .get(&website_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn website_of_store(&self, store_id: i64) -> Option<i64> {
        self.store_website.get(&store_id).copied()
    }

    /// All stores in the given store's website (including the store itself).
    pub fn sibling_stores(&self, store_id: i64) -> Vec<i64> {
        self.website_of_store(store_id)
            .map(|w| self.stores_of_website(w).to_vec())
            .unwrap_or_else(|| vec![store_id])
    }

    /// Stock is website-wide, so stock pushes go to the first store of the
    /// website. `None` means the default scope, resolved to the first
    /// configured website.
    pub fn first_store_of_website(&self, website_id: Option<i64>) -> Option<i64> {
        let stores = match website_id {
            Some(id) => self.websites.get(&id)?,
            None => self.websites.values().next()?,
        };
        stores.first().copied()
    }

    pub fn store_by_code(&self, code: &str) -> Option<i64> {
        self.store_codes.get(code).copied()
    }

    pub fn website_by_code(&self, code: &str) -> Option<i64> {
        self.website_codes.get(code).copied()
    }

    pub fn is_active(&self, store_id: i64) -> bool {
        !self.inactive.contains(&store_id)
    }

    fn deliverable(&self, store_id: i64) -> bool {
        store_id != ADMIN_STORE_ID && self.is_active(store_id)
    }

    /// Target stores for a product save, before status suppression.
    ///
    /// A global save fans out to every assigned store. A store-specific save
    /// targets just that store, widened to the whole website when a changed
    /// attribute is website-scoped or the product transitions
    /// disabled->enabled (the other stores inherit the change), and widened
    /// to all assigned stores when category membership changed.
    pub fn saved_targets(
        &self,
        change: &ProductSaved,
        assigned_store_ids: &[i64],
        scopes: &AttributeScopes,
    ) -> Vec<i64> {
        let mut targets: BTreeSet<i64> = BTreeSet::new();

        if change.store_id == ADMIN_STORE_ID {
            targets.extend(assigned_store_ids.iter().copied());
        } else {
            targets.insert(change.store_id);

            let website_attr_changed = change
                .changed_attributes
                .iter()
                .any(|code| scopes.is_website_scoped(code));
            let enabled_transition = change.old_status == Some(ProductStatus::Disabled)
                && change.new_status == ProductStatus::Enabled;
            if website_attr_changed || enabled_transition {
                targets.extend(self.sibling_stores(change.store_id));
            }
            if change.category_membership_changed {
                targets.extend(assigned_store_ids.iter().copied());
            }
        }

        targets
            .into_iter()
            .filter(|s| self.deliverable(*s))
            .collect()
    }

    /// Stores of websites the product was just removed from. These are
    /// pushed unconditionally so the external system receives a disabled
    /// signal instead of a silent disappearance.
    pub fn removal_targets(&self, removed_website_ids: &[i64]) -> Vec<i64> {
        let mut targets: BTreeSet<i64> = BTreeSet::new();
        for website_id in removed_website_ids {
            targets.extend(self.stores_of_website(*website_id));
        }
        targets
            .into_iter()
            .filter(|s| *s != ADMIN_STORE_ID)
            .collect()
    }

    /// Store scopes for an attribute mass-update. Unscoped updates stay
    /// unscoped; store-scoped updates widen to the website when a changed
    /// attribute is website-scoped.
    pub fn mass_update_targets(
        &self,
        store_id: Option<i64>,
        changed_attributes: &[String],
        scopes: &AttributeScopes,
    ) -> Vec<Option<i64>> {
        let store_id = match store_id {
            Some(id) if id != ADMIN_STORE_ID => id,
            _ => return vec![None],
        };

        let widen = changed_attributes
            .iter()
            .any(|code| scopes.is_website_scoped(code));
        if widen {
            self.sibling_stores(store_id)
                .into_iter()
                .filter(|s| self.deliverable(*s))
                .map(Some)
                .collect()
        } else {
            vec![Some(store_id)]
        }
    }

    /// Store scopes for one import row, in priority order: explicit store
    /// view code, explicit website code, website id list, then "all stores".
    ///
    /// A row that sets the status column explicitly is broadened to all
    /// stores of the resolved store's website, regardless of per-store
    /// disabled state.
    pub fn import_targets(&self, row: &ImportRow) -> Vec<Option<i64>> {
        if let Some(store_id) = row
            .store_view_code
            .as_deref()
            .and_then(|code| self.store_by_code(code))
        {
            let stores = if row.has_status_column {
                self.sibling_stores(store_id)
            } else {
                vec![store_id]
            };
            let stores: Vec<Option<i64>> = stores
                .into_iter()
                .filter(|s| *s != ADMIN_STORE_ID)
                .map(Some)
                .collect();
            if !stores.is_empty() {
                return stores;
            }
        }

        let website_id = row
            .website_code
            .as_deref()
            .and_then(|code| self.website_by_code(code));
        if let Some(website_id) = website_id {
            let stores: Vec<Option<i64>> = self
                .stores_of_website(website_id)
                .iter()
                .copied()
                .filter(|s| *s != ADMIN_STORE_ID)
                .map(Some)
                .collect();
            if !stores.is_empty() {
                return stores;
            }
        }

        if !row.website_ids.is_empty() {
            let mut stores: BTreeSet<i64> = BTreeSet::new();
            for website_id in &row.website_ids {
                stores.extend(self.stores_of_website(*website_id));
            }
            let stores: Vec<Option<i64>> = stores
                .into_iter()
                .filter(|s| *s != ADMIN_STORE_ID)
                .map(Some)
                .collect();
            if !stores.is_empty() {
                return stores;
            }
        }

        // No scope columns: push for all stores the product belongs to,
        // broadened by the consumer at delivery time.
        vec![None]
    }
}

/// A single product save, captured after the write with enough context to
/// resolve its fan-out. `store_id` 0 means the save happened at the global
/// (administrative) scope.
#[derive(Debug, Clone)]
pub struct ProductSaved {
    pub product_id: i64,
    pub store_id: i64,
    pub changed_attributes: Vec<String>,
    pub category_membership_changed: bool,
    pub removed_website_ids: Vec<i64>,
    /// None on creation.
    pub old_status: Option<ProductStatus>,
    pub new_status: ProductStatus,
}

impl ProductSaved {
    pub fn is_new(&self) -> bool {
        self.old_status.is_none()
    }

    /// Whether the product should be pushed for a store where it currently
    /// has `status_in_store`.
    ///
    /// Disabled products are not re-announced, except when this save is
    /// itself the status transition: enabled->disabled and
    /// disabled->enabled are always pushed.
    pub fn should_push(&self, status_in_store: ProductStatus) -> bool {
        if status_in_store == ProductStatus::Enabled {
            return true;
        }

        match self.old_status {
            // Creating an already-disabled product: nothing to announce.
            None => false,
            Some(old) => {
                if self.store_id == ADMIN_STORE_ID {
                    // Global update: push only if this save is the
                    // enabled->disabled transition.
                    old == ProductStatus::Enabled && self.new_status == ProductStatus::Disabled
                } else {
                    // Store-scoped update: suppress only when it was and
                    // stays disabled.
                    !(old == ProductStatus::Disabled
                        && self.new_status == ProductStatus::Disabled)
                }
            }
        }
    }
}

/// Category (re)assignment: all affected products are pushed unscoped.
#[derive(Debug, Clone)]
pub struct CategoryReassigned {
    pub category_id: i64,
    pub product_ids: Vec<i64>,
}

/// Mass attribute update applied to many products at one scope.
#[derive(Debug, Clone)]
pub struct AttributesMassUpdated {
    pub product_ids: Vec<i64>,
    pub store_id: Option<i64>,
    pub changed_attributes: Vec<String>,
}

/// One row of a bulk import bunch.
#[derive(Debug, Clone, Default)]
pub struct ImportRow {
    pub sku: String,
    pub store_view_code: Option<String>,
    pub website_code: Option<String>,
    pub website_ids: Vec<i64>,
    pub has_status_column: bool,
}
