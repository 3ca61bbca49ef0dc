//! Lazy, composable, paginated queries against an upstream collection.
//!
//! A [`RemoteQuery`] is an immutable cursor. `filter`, `order_by`, `skip`,
//! `take` and `stateful` each return a new query and leave the original
//! untouched. Nothing is sent until a terminal operation (`count`, `first`,
//! `single`, `any`, `to_vec`) runs or a [`QueryPager`] is driven.
//!
//! # Wire format
//!
//! ```text
//! GET {collection}?{field}={expr}&_offset=10&_count=5&_includeTotal=false
//!     &_orderBy={field}:asc&_queryId={token}
//! ```
//!
//! The response is a [`Bundle`] of resources with an optional total.

use crate::error::{ClientError, ClientResult};
use crate::model::{Bundle, Resource};
use crate::transport::TransportFactory;
use edgefed_types::{Principal, ServiceEndpointType};
use futures::Stream;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

pub const PARAM_OFFSET: &str = "_offset";
pub const PARAM_COUNT: &str = "_count";
pub const PARAM_INCLUDE_TOTAL: &str = "_includeTotal";
pub const PARAM_ORDER_BY: &str = "_orderBy";
pub const PARAM_QUERY_ID: &str = "_queryId";

/// Filter parameters: field path to one or more match expressions.
///
/// Every expression must hold for a record to match, so merging two filters
/// is a logical AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter(BTreeMap<String, Vec<String>>);

impl Filter {
    /// The empty filter, matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// A raw expression for `field` (e.g. `!value`, `>3`, `~part`).
    pub fn expr(field: impl Into<String>, expression: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(field.into(), vec![expression.into()]);
        Self(map)
    }

    /// `field` equals `value`.
    pub fn eq(field: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::expr(field, value.to_string())
    }

    /// `field` differs from `value`.
    pub fn not_eq(field: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::expr(field, format!("!{value}"))
    }

    /// `field` contains `value`.
    pub fn like(field: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::expr(field, format!("~{value}"))
    }

    /// `field` is greater than `value`.
    pub fn gt(field: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::expr(field, format!(">{value}"))
    }

    /// `field` is less than `value`.
    pub fn lt(field: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::expr(field, format!("<{value}"))
    }

    /// Logical AND of two filters.
    #[must_use]
    pub fn and(&self, other: &Filter) -> Filter {
        let mut merged = self.0.clone();
        for (field, exprs) in &other.0 {
            let entry = merged.entry(field.clone()).or_default();
            for expr in exprs {
                if !entry.contains(expr) {
                    entry.push(expr.clone());
                }
            }
        }
        Filter(merged)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Expressions for one field.
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// Query-string pairs.
    pub fn to_query(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .flat_map(|(field, exprs)| exprs.iter().map(move |e| (field.clone(), e.clone())))
            .collect()
    }

    /// Evaluates the filter against a JSON record (used by local stores).
    ///
    /// Field paths are dot-separated; array values match if any element does.
    pub fn matches(&self, record: &serde_json::Value) -> bool {
        self.0.iter().all(|(field, exprs)| {
            let values = lookup(record, field);
            exprs
                .iter()
                .all(|expr| values.iter().any(|v| expression_holds(expr, v)))
        })
    }
}

fn lookup<'a>(record: &'a serde_json::Value, path: &str) -> Vec<&'a serde_json::Value> {
    let mut current = vec![record];
    for segment in path.split('.') {
        current = current
            .into_iter()
            .flat_map(|v| match v {
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(|i| i.get(segment))
                    .collect::<Vec<_>>(),
                other => other.get(segment).into_iter().collect(),
            })
            .collect();
    }
    current
        .into_iter()
        .flat_map(|v| match v {
            serde_json::Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}

fn expression_holds(expr: &str, value: &serde_json::Value) -> bool {
    let actual = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => return false,
        other => other.to_string(),
    };
    if let Some(rest) = expr.strip_prefix('!') {
        return actual != rest;
    }
    if let Some(rest) = expr.strip_prefix('~') {
        return actual.to_lowercase().contains(&rest.to_lowercase());
    }
    if let Some(rest) = expr.strip_prefix('>') {
        return compare(&actual, rest).is_gt();
    }
    if let Some(rest) = expr.strip_prefix('<') {
        return compare(&actual, rest).is_lt();
    }
    actual == expr
}

fn compare(actual: &str, expected: &str) -> std::cmp::Ordering {
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// The single active sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    fn to_param(&self) -> String {
        let dir = match self.direction {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        };
        format!("{}:{}", self.field, dir)
    }
}

/// Immutable description of a query over one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCursor {
    collection: String,
    filter: Filter,
    sort: Option<Sort>,
    offset: Option<usize>,
    limit: Option<usize>,
    query_id: Option<String>,
}

impl QueryCursor {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: Filter::new(),
            sort: None,
            offset: None,
            limit: None,
            query_id: None,
        }
    }

    #[must_use]
    pub fn filter(&self, filter: &Filter) -> Self {
        Self {
            filter: self.filter.and(filter),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn sort(&self, field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            sort: Some(Sort {
                field: field.into(),
                direction,
            }),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn skip(&self, n: usize) -> Self {
        Self {
            offset: Some(self.offset.unwrap_or(0) + n),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn take(&self, n: usize) -> Self {
        Self {
            limit: Some(n),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn stateful(&self, token: impl Into<String>) -> Self {
        Self {
            query_id: Some(token.into()),
            ..self.clone()
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filter_params(&self) -> &Filter {
        &self.filter
    }

    pub fn sort_key(&self) -> Option<&Sort> {
        self.sort.as_ref()
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    /// Query-string pairs for one request.
    pub fn to_query(
        &self,
        offset: usize,
        count: usize,
        include_total: bool,
    ) -> Vec<(String, String)> {
        let mut params = self.filter.to_query();
        params.push((PARAM_OFFSET.to_string(), offset.to_string()));
        params.push((PARAM_COUNT.to_string(), count.to_string()));
        params.push((PARAM_INCLUDE_TOTAL.to_string(), include_total.to_string()));
        if let Some(sort) = &self.sort {
            params.push((PARAM_ORDER_BY.to_string(), sort.to_param()));
        }
        if let Some(id) = &self.query_id {
            params.push((PARAM_QUERY_ID.to_string(), id.clone()));
        }
        params
    }
}

/// A lazy query over resources of type `T`.
pub struct RemoteQuery<T> {
    factory: Arc<TransportFactory>,
    service: ServiceEndpointType,
    acting: Option<Principal>,
    cursor: QueryCursor,
    page_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RemoteQuery<T> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            service: self.service,
            acting: self.acting.clone(),
            cursor: self.cursor.clone(),
            page_size: self.page_size,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RemoteQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteQuery")
            .field("service", &self.service)
            .field("cursor", &self.cursor)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl<T: Resource> RemoteQuery<T> {
    pub fn new(
        factory: Arc<TransportFactory>,
        service: ServiceEndpointType,
        acting: Option<Principal>,
        page_size: usize,
    ) -> Self {
        Self {
            factory,
            service,
            acting,
            cursor: QueryCursor::new(T::COLLECTION),
            page_size: page_size.max(1),
            _marker: PhantomData,
        }
    }

    fn with_cursor(&self, cursor: QueryCursor) -> Self {
        Self {
            cursor,
            ..self.clone()
        }
    }

    pub fn cursor(&self) -> &QueryCursor {
        &self.cursor
    }

    /// Narrows the query (AND with any existing filter).
    #[must_use]
    pub fn filter(&self, filter: Filter) -> Self {
        self.with_cursor(self.cursor.filter(&filter))
    }

    /// Sorts ascending by `field`, replacing any previous sort.
    #[must_use]
    pub fn order_by(&self, field: impl Into<String>) -> Self {
        self.with_cursor(self.cursor.sort(field, SortDirection::Ascending))
    }

    /// Sorts descending by `field`, replacing any previous sort.
    #[must_use]
    pub fn order_by_descending(&self, field: impl Into<String>) -> Self {
        self.with_cursor(self.cursor.sort(field, SortDirection::Descending))
    }

    /// Skips `n` more results.
    #[must_use]
    pub fn skip(&self, n: usize) -> Self {
        self.with_cursor(self.cursor.skip(n))
    }

    /// Yields at most `n` results.
    #[must_use]
    pub fn take(&self, n: usize) -> Self {
        self.with_cursor(self.cursor.take(n))
    }

    /// Pins subsequent pages to a server-side result snapshot.
    #[must_use]
    pub fn stateful(&self, token: impl Into<String>) -> Self {
        self.with_cursor(self.cursor.stateful(token))
    }

    async fn fetch(
        &self,
        offset: usize,
        count: usize,
        include_total: bool,
    ) -> ClientResult<Bundle<T>> {
        let transport = self
            .factory
            .transport(self.service, self.acting.as_ref())
            .await?;
        let query = self.cursor.to_query(offset, count, include_total);
        debug!(
            "Querying {} offset={} count={} total={}",
            self.cursor.collection(),
            offset,
            count,
            include_total
        );
        Ok(transport
            .get::<Bundle<T>>(self.cursor.collection(), &query)
            .await?
            .value)
    }

    /// Total number of matching records, as reported by upstream.
    pub async fn count(&self) -> ClientResult<u64> {
        let bundle = self.fetch(self.cursor.offset(), 0, true).await?;
        Ok(bundle
            .total_results
            .unwrap_or(bundle.resource.len() as u64))
    }

    /// Whether any record matches.
    pub async fn any(&self) -> ClientResult<bool> {
        Ok(self.count().await? > 0)
    }

    /// The first match, if any.
    pub async fn first_or_default(&self) -> ClientResult<Option<T>> {
        let count = self.bounded(1);
        if count == 0 {
            return Ok(None);
        }
        let bundle = self.fetch(self.cursor.offset(), count, false).await?;
        Ok(bundle.resource.into_iter().next())
    }

    /// `wanted`, capped by the query's limit.
    fn bounded(&self, wanted: usize) -> usize {
        self.cursor.limit().map_or(wanted, |limit| limit.min(wanted))
    }

    /// The first match; `NotFound` when there is none.
    pub async fn first(&self) -> ClientResult<T> {
        self.first_or_default()
            .await?
            .ok_or_else(|| ClientError::NotFound(self.cursor.collection().to_string()))
    }

    /// The only match, if any; `Multiplicity` when several match.
    pub async fn single_or_default(&self) -> ClientResult<Option<T>> {
        let count = self.bounded(2);
        if count == 0 {
            return Ok(None);
        }
        let bundle = self.fetch(self.cursor.offset(), count, false).await?;
        if bundle.resource.len() > 1 {
            return Err(ClientError::Multiplicity(self.cursor.collection().to_string()));
        }
        Ok(bundle.resource.into_iter().next())
    }

    /// The only match; `NotFound` when none, `Multiplicity` when several.
    pub async fn single(&self) -> ClientResult<T> {
        self.single_or_default()
            .await?
            .ok_or_else(|| ClientError::NotFound(self.cursor.collection().to_string()))
    }

    /// Starts a new enumeration from the cursor's offset.
    pub fn pager(&self) -> QueryPager<T> {
        QueryPager {
            query: self.clone(),
            yielded: 0,
            page: VecDeque::new(),
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// Enumerates every match as a stream.
    pub fn stream(&self) -> impl Stream<Item = ClientResult<T>> + Send + 'static {
        futures::stream::try_unfold(self.pager(), |mut pager| async move {
            let item = pager.next().await?;
            Ok::<_, ClientError>(item.map(|item| (item, pager)))
        })
    }

    /// Collects every match.
    pub async fn to_vec(&self) -> ClientResult<Vec<T>> {
        let mut pager = self.pager();
        let mut items = Vec::new();
        while let Some(item) = pager.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}

/// One enumeration of a [`RemoteQuery`].
///
/// Holds the last fetched page; drive it from a single task.
pub struct QueryPager<T> {
    query: RemoteQuery<T>,
    yielded: usize,
    page: VecDeque<T>,
    exhausted: bool,
    pages_fetched: usize,
}

impl<T: Resource> QueryPager<T> {
    /// Next item, fetching the next page when the current one is drained.
    pub async fn next(&mut self) -> ClientResult<Option<T>> {
        loop {
            if let Some(item) = self.page.pop_front() {
                self.yielded += 1;
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }

            let cursor = &self.query.cursor;
            let count = match cursor.limit() {
                Some(limit) if self.yielded >= limit => {
                    self.exhausted = true;
                    return Ok(None);
                }
                Some(limit) => (limit - self.yielded).min(self.query.page_size),
                None => self.query.page_size,
            };
            let offset = cursor.offset() + self.yielded;

            let mut items = self.query.fetch(offset, count, false).await?.resource;
            self.pages_fetched += 1;
            if items.is_empty() {
                self.exhausted = true;
                return Ok(None);
            }
            items.truncate(count);
            self.page = items.into();
        }
    }

    /// Items yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Pages requested so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}
