// src/remote/store.rs

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::db::monitoring::{measure_remote, record_rows_written};
use crate::error::{SyncError, SyncResult};
use crate::models::Table;

/// Предикат над колонками строки: равенство, вхождение, AND/OR.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    /// Конъюнкция; вложенные AND разворачиваются.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut a) => {
                a.push(other);
                Filter::Or(a)
            }
            f => Filter::Or(vec![f, other]),
        }
    }

    /// Строки диалога `a` и `b` в обе стороны по двум колонкам.
    pub fn pair(col_a: &str, col_b: &str, a: &str, b: &str) -> Self {
        Filter::eq(col_a, a)
            .and(Filter::eq(col_b, b))
            .or(Filter::eq(col_a, b).and(Filter::eq(col_b, a)))
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(col, v) => row.get(col).map(|x| x == v).unwrap_or(false),
            Filter::In(col, vs) => row.get(col).map(|x| vs.contains(x)).unwrap_or(false),
            Filter::And(fs) => fs.iter().all(|f| f.matches(row)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(row)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// Выборка с фильтром, сортировкой и диапазоном.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub filter: Option<Filter>,
    pub order: Option<Order>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filter: None,
            order: None,
            offset: 0,
            limit: None,
        }
    }

    pub fn by_id(table: Table, id: &str) -> Self {
        Self::new(table).filter(Filter::eq("id", id)).limit(1)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Аналог `range(offset, offset + limit - 1)`.
    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Долговечное хранилище строк. Все значения - JSON-объекты сущностей.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, query: Query) -> SyncResult<Vec<Value>>;

    /// Вставка; хранилище назначает `id` и возвращает вставленные строки.
    async fn insert(&self, table: Table, rows: Vec<Value>) -> SyncResult<Vec<Value>>;

    /// Обновление по фильтру. Возвращает обновлённые строки; пустой результат
    /// означает, что фильтр (в том числе условие на текущий статус) ничего не нашёл.
    async fn update(&self, table: Table, filter: Filter, patch: Value) -> SyncResult<Vec<Value>>;

    async fn upsert(&self, table: Table, row: Value, conflict_key: &str) -> SyncResult<Value>;
}

pub fn to_row<T: Serialize>(value: &T) -> SyncResult<Value> {
    Ok(serde_json::to_value(value)?)
}

pub fn from_row<T: DeserializeOwned>(row: Value) -> SyncResult<T> {
    Ok(serde_json::from_value(row)?)
}

fn from_rows<T: DeserializeOwned>(rows: Vec<Value>) -> SyncResult<Vec<T>> {
    rows.into_iter().map(from_row).collect()
}

/// Типизированная выборка с метриками.
pub async fn select_as<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    operation: &str,
    query: Query,
) -> SyncResult<Vec<T>> {
    let rows = measure_remote(operation, store.select(query)).await?;
    from_rows(rows)
}

pub async fn select_one_as<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    operation: &str,
    query: Query,
) -> SyncResult<Option<T>> {
    let rows = measure_remote(operation, store.select(query.limit(1))).await?;
    rows.into_iter().next().map(from_row).transpose()
}

pub async fn insert_as<T: Serialize, R: DeserializeOwned>(
    store: &dyn RemoteStore,
    operation: &str,
    table: Table,
    values: &[T],
) -> SyncResult<Vec<R>> {
    let rows = values.iter().map(to_row).collect::<SyncResult<Vec<_>>>()?;
    let inserted = measure_remote(operation, store.insert(table, rows)).await?;
    record_rows_written(table.as_str(), inserted.len());
    from_rows(inserted)
}

pub async fn update_as<R: DeserializeOwned>(
    store: &dyn RemoteStore,
    operation: &str,
    table: Table,
    filter: Filter,
    patch: Value,
) -> SyncResult<Vec<R>> {
    let updated = measure_remote(operation, store.update(table, filter, patch)).await?;
    record_rows_written(table.as_str(), updated.len());
    from_rows(updated)
}

pub async fn upsert_as<T: Serialize, R: DeserializeOwned>(
    store: &dyn RemoteStore,
    operation: &str,
    table: Table,
    value: &T,
    conflict_key: &str,
) -> SyncResult<R> {
    let row = to_row(value)?;
    if row.get(conflict_key).is_none() {
        return Err(SyncError::Invalid(format!(
            "upsert into {table} without conflict key {conflict_key}"
        )));
    }
    let stored = measure_remote(operation, store.upsert(table, row, conflict_key)).await?;
    record_rows_written(table.as_str(), 1);
    from_row(stored)
}

/// Порядок значений колонки: числа численно, метки времени RFC 3339 по времени,
/// остальное как строки; null и отсутствующие в конце.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (
                x.parse::<DateTime<Utc>>(),
                y.parse::<DateTime<Utc>>(),
            ) {
                (Ok(tx), Ok(ty)) => tx.cmp(&ty),
                _ => x.cmp(y),
            }
        }
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
