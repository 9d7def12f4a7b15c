use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Store id 0 holds administrative fallback values and is never a delivery
/// target. Filtered at resolution time and again at delivery time.
pub const ADMIN_STORE_ID: i64 = 0;

/// Identifies a catalog product either by numeric id or by SKU.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Id(i64),
    Sku(String),
}

impl EntityRef {
    pub fn describe(&self) -> String {
        match self {
            EntityRef::Id(id) => format!("id={id}"),
            EntityRef::Sku(sku) => format!("sku={sku}"),
        }
    }
}

/// One unit of work on the product push queue.
///
/// `store_id = None` means "all stores the product belongs to"; the consumer
/// broadens it to concrete stores when the product is reloaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PushRequest {
    pub entity: EntityRef,
    pub store_id: Option<i64>,
}

impl PushRequest {
    pub fn by_id(id: i64, store_id: Option<i64>) -> Self {
        Self {
            entity: EntityRef::Id(id),
            store_id,
        }
    }

    pub fn by_sku(sku: impl Into<String>, store_id: Option<i64>) -> Self {
        Self {
            entity: EntityRef::Sku(sku.into()),
            store_id,
        }
    }

    /// Parse a queue payload into push requests.
    ///
    /// Accepts the object form `[{"product_id": 1, "store_id": null}, ...]`
    /// (or `sku` instead of `product_id`) and the legacy scalar form
    /// `[1, 2, 3]` still emitted by older producers.
    pub fn parse_batch(payload: &str) -> Result<Vec<PushRequest>, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    product_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sku: Option<String>,
    store_id: Option<i64>,
}

impl Serialize for PushRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match &self.entity {
            EntityRef::Id(id) => WireRequest {
                product_id: Some(*id),
                sku: None,
                store_id: self.store_id,
            },
            EntityRef::Sku(sku) => WireRequest {
                product_id: None,
                sku: Some(sku.clone()),
                store_id: self.store_id,
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PushRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            // Legacy scalar form: a bare product id, unscoped.
            Value::Number(n) => {
                let id = n
                    .as_i64()
                    .ok_or_else(|| D::Error::custom("product id is not an integer"))?;
                Ok(PushRequest::by_id(id, None))
            }
            Value::Object(_) => {
                let wire: WireRequest =
                    serde_json::from_value(value).map_err(D::Error::custom)?;
                // Some producers send store_id 0 where they mean "unscoped".
                let store_id = wire.store_id.filter(|s| *s != ADMIN_STORE_ID);
                match (wire.product_id, wire.sku) {
                    (Some(id), None) => Ok(PushRequest::by_id(id, store_id)),
                    (None, Some(sku)) => Ok(PushRequest::by_sku(sku, store_id)),
                    (Some(_), Some(_)) => {
                        Err(D::Error::custom("push request has both product_id and sku"))
                    }
                    (None, None) => {
                        Err(D::Error::custom("push request has neither product_id nor sku"))
                    }
                }
            }
            other => Err(D::Error::custom(format!(
                "unexpected push request form: {other}"
            ))),
        }
    }
}

/// Product status as understood by the external connector (1/2 on the wire,
/// matching the platform's enabled/disabled attribute encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductStatus {
    Enabled,
    Disabled,
}

impl ProductStatus {
    pub fn as_wire(&self) -> i64 {
        match self {
            ProductStatus::Enabled => 1,
            ProductStatus::Disabled => 2,
        }
    }
}

impl Serialize for ProductStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for ProductStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match i64::deserialize(deserializer)? {
            1 => Ok(ProductStatus::Enabled),
            2 => Ok(ProductStatus::Disabled),
            other => Err(D::Error::custom(format!("unknown product status {other}"))),
        }
    }
}

/// One media gallery entry with its role tags (base image, thumbnail, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaEntry {
    pub url: String,
    pub roles: Vec<String>,
}

/// Stock snapshot embedded in an outbound product record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockSnapshot {
    pub qty: f64,
    pub is_in_stock: bool,
}

/// Fully materialized payload for one product in one store.
///
/// Built per delivery attempt, never cached. The `extension` map is always
/// serialized (possibly empty) so the external schema stays stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub product_id: i64,
    pub sku: String,
    pub store_id: i64,
    pub status: ProductStatus,
    pub name: String,
    pub price: f64,
    pub final_price: f64,
    pub stock: StockSnapshot,
    pub category_ids: Vec<i64>,
    pub media: Vec<MediaEntry>,
    pub extension: Map<String, Value>,
}

/// Stock-only record pushed to the `ingest/product-stock` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockRecord {
    pub qty: f64,
    pub is_in_stock: bool,
    pub sku: String,
    pub product_id: i64,
    pub website_id: Option<i64>,
    pub store_id: i64,
}

/// Group records by destination store. The external system accepts one
/// batch-of-records-per-store per request, never multi-store batches.
///
/// Admin-scope records are dropped here; the delivery client refuses them
/// again as the final backstop.
pub fn group_by_store(records: Vec<OutboundRecord>) -> BTreeMap<i64, Vec<OutboundRecord>> {
    let mut groups: BTreeMap<i64, Vec<OutboundRecord>> = BTreeMap::new();
    for record in records {
        if record.store_id == ADMIN_STORE_ID {
            continue;
        }
        groups.entry(record.store_id).or_default().push(record);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(store_id: i64, sku: &str) -> OutboundRecord {
        OutboundRecord {
            product_id: 1,
            sku: sku.to_string(),
            store_id,
            status: ProductStatus::Enabled,
            name: "Widget".to_string(),
            price: 10.0,
            final_price: 8.0,
            stock: StockSnapshot {
                qty: 3.0,
                is_in_stock: true,
            },
            category_ids: vec![],
            media: vec![],
            extension: Map::new(),
        }
    }

    #[test]
    fn parse_object_batch() {
        let batch = PushRequest::parse_batch(
            r#"[{"product_id": 42, "store_id": null}, {"sku": "ABC-1", "store_id": 5}]"#,
        )
        .unwrap();
        assert_eq!(batch[0], PushRequest::by_id(42, None));
        assert_eq!(batch[1], PushRequest::by_sku("ABC-1", Some(5)));
    }

    #[test]
    fn parse_legacy_scalar_batch() {
        let batch = PushRequest::parse_batch("[42, 43]").unwrap();
        assert_eq!(batch[0], PushRequest::by_id(42, None));
        assert_eq!(batch[1], PushRequest::by_id(43, None));
    }

    #[test]
    fn parse_mixed_forms() {
        let batch = PushRequest::parse_batch(r#"[7, {"sku": "X", "store_id": 2}]"#).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], PushRequest::by_id(7, None));
    }

    #[test]
    fn store_zero_normalized_to_unscoped() {
        let batch = PushRequest::parse_batch(r#"[{"product_id": 1, "store_id": 0}]"#).unwrap();
        assert_eq!(batch[0].store_id, None);
    }

    #[test]
    fn reject_request_without_ref() {
        assert!(PushRequest::parse_batch(r#"[{"store_id": 2}]"#).is_err());
    }

    #[test]
    fn wire_roundtrip_keeps_ref_kind() {
        let reqs = vec![
            PushRequest::by_id(1, Some(3)),
            PushRequest::by_sku("SKU-9", None),
        ];
        let json = serde_json::to_string(&reqs).unwrap();
        assert!(json.contains("\"product_id\":1"));
        assert!(json.contains("\"sku\":\"SKU-9\""));
        let back = PushRequest::parse_batch(&json).unwrap();
        assert_eq!(back, reqs);
    }

    #[test]
    fn group_by_store_drops_admin_scope() {
        let groups = group_by_store(vec![record(0, "A"), record(2, "B"), record(2, "C")]);
        assert!(!groups.contains_key(&0));
        assert_eq!(groups.get(&2).map(Vec::len), Some(2));
    }

    #[test]
    fn extension_always_serialized() {
        let json = serde_json::to_value(record(2, "A")).unwrap();
        assert!(json.get("extension").is_some());
        assert_eq!(json["extension"], serde_json::json!({}));
    }

    #[test]
    fn status_wire_encoding() {
        assert_eq!(serde_json::to_string(&ProductStatus::Disabled).unwrap(), "2");
        let status: ProductStatus = serde_json::from_str("1").unwrap();
        assert_eq!(status, ProductStatus::Enabled);
    }
}
