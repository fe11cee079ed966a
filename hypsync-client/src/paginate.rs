//! Cursor-driven pagination over the search endpoint.

use async_stream::try_stream;
use futures::{Stream, TryStreamExt, pin_mut};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::annotation::Annotation;
use crate::api::{HypApi, Order, PAGE_LIMIT, SearchParams};
use crate::error::{Error, Result};

/// The global public group.
pub const WORLD_GROUP: &str = "__world__";

/// Bounds applied to a paginated search.
#[derive(Clone, Debug, Default)]
pub struct FetchBounds {
    /// Emit at most this many rows.
    pub max_results: Option<usize>,
    /// Terminate once a row's sort field crosses this value.
    ///
    /// Ascending runs yield rows up to and including the boundary value and
    /// stop at the first row past it; descending runs mirror that. The
    /// crossing row itself is never yielded.
    pub stop_at: Option<String>,
}

/// Pages through search results with the `search_after` cursor.
///
/// The cursor after each page is the sort field of that page's last row. An
/// empty page ends the stream, as does either bound; when both bounds apply
/// the stricter one wins. A transport failure that survives the retry budget
/// ends the stream like an empty page so partial progress is preserved.
pub fn search_all(
    api: &HypApi,
    params: SearchParams,
    bounds: FetchBounds,
) -> impl Stream<Item = Result<Value>> + '_ {
    try_stream! {
        ensure_constrained(&params, &bounds)?;

        let mut params = params;
        let sort = params.sort.clone();
        let order = params.order;
        if let Some(max) = bounds.max_results {
            let limit = params.limit.unwrap_or(PAGE_LIMIT);
            if max < limit {
                params.limit = Some(max);
            }
        }

        let mut emitted = 0usize;
        loop {
            let page = match api.search(&params).await {
                Err(Error::Transport { source }) => {
                    warn!("transport failure ended pagination: {source}");
                    break;
                }
                result => result?,
            };
            if page.rows.is_empty() {
                break;
            }

            let mut cursor = None;
            for row in page.rows {
                let stamp = row_stamp(&row, &sort)?;
                if let Some(stop) = &bounds.stop_at {
                    let crossed = match order {
                        Order::Asc => stamp.as_str() > stop.as_str(),
                        Order::Desc => stamp.as_str() < stop.as_str(),
                    };
                    if crossed {
                        return;
                    }
                }
                cursor = Some(stamp);
                yield row;
                emitted += 1;
                if let Some(max) = bounds.max_results
                    && emitted >= max
                {
                    return;
                }
            }
            debug!(cursor = cursor.as_deref(), "searching after");
            params.search_after = cursor;
        }
    }
}

fn ensure_constrained(params: &SearchParams, bounds: &FetchBounds) -> Result<()> {
    if params.group.as_deref() == Some(WORLD_GROUP)
        && params.user.is_none()
        && bounds.max_results.is_none()
    {
        return Err(Error::Usage(format!(
            "refusing an unconstrained {WORLD_GROUP} search; set a user or max_results"
        )));
    }
    Ok(())
}

fn row_stamp(row: &Value, sort: &str) -> Result<String> {
    row.get(sort)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Decode(format!("row missing sort field {sort:?}")))
}

/// Options for one bulk fetch.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Resume cursor, exclusive.
    pub search_after: Option<String>,
    /// Per-page limit override.
    pub limit: Option<usize>,
    pub max_results: Option<usize>,
    pub stop_at: Option<String>,
}

/// Fetch policy for one group: ascending by `updated`, group-bound, with the
/// authenticated user substituted in for unbounded world-group searches.
#[derive(Clone, Debug)]
pub struct AnnoFetcher {
    api: HypApi,
}

impl AnnoFetcher {
    pub fn new(api: HypApi) -> Self {
        Self { api }
    }

    /// The underlying REST client.
    pub fn api(&self) -> &HypApi {
        &self.api
    }

    /// Lazy stream of raw rows for this group.
    pub fn rows(&self, options: FetchOptions) -> impl Stream<Item = Result<Value>> + '_ {
        let FetchOptions {
            search_after,
            limit,
            max_results,
            stop_at,
        } = options;
        let mut params = SearchParams {
            group: Some(self.api.group().to_owned()),
            limit,
            search_after,
            ..SearchParams::default()
        };
        if max_results.is_none() && self.api.group() == WORLD_GROUP {
            info!(
                "searching {WORLD_GROUP} as {} since max_results was not set",
                self.api.username()
            );
            params.user = Some(self.api.username().to_owned());
        }
        search_all(&self.api, params, FetchBounds { max_results, stop_at })
    }

    /// Collects and decodes a bounded fetch.
    pub async fn annos(&self, options: FetchOptions) -> Result<Vec<Annotation>> {
        let stream = self.rows(options);
        pin_mut!(stream);
        let rows: Vec<Value> = stream.try_collect().await?;
        rows.into_iter().map(Annotation::from_row).collect()
    }
}
