use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;
use tokio::sync::watch;

pub type Fields = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("document store is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Decodes the document body; `None` when the shape does not match.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, value) => doc.get(field) == Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }

    /// Filters and orders `docs` in place. Ties fall back to document id.
    pub fn apply(&self, docs: &mut Vec<Document>) {
        docs.retain(|doc| self.matches(doc));
        docs.sort_by(|a, b| {
            let primary = match &self.order_by {
                Some(order) => {
                    let cmp = compare_values(a.get(&order.field), b.get(&order.field));
                    match order.direction {
                        Direction::Asc => cmp,
                        Direction::Desc => cmp.reverse(),
                    }
                }
                None => Ordering::Equal,
            };
            primary.then_with(|| a.id.cmp(&b.id))
        });
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        // Missing values sort first.
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read_once(&self, key: &DocumentKey) -> StoreResult<Option<Document>>;

    /// Merges `fields` into the document, creating it when absent. The store
    /// stamps `updatedAt` with its own clock. On `Err` nothing is visible to
    /// readers or subscribers.
    async fn write_merge(&self, key: &DocumentKey, fields: Fields) -> StoreResult<()>;

    /// The receiver starts at the current snapshot and sees every later write.
    fn subscribe_live(&self, key: &DocumentKey) -> watch::Receiver<Option<Document>>;

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;

    fn subscribe_query(&self, query: &Query) -> watch::Receiver<Vec<Document>>;
}
