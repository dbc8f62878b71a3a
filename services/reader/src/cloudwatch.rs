//! Flow log records from a CloudWatch Logs log group.
//!
//! [`FlowLogsReader`] drives a paginated `FilterLogEvents` query over a time
//! window and yields the events lazily, page by page. The paginator is
//! injected through [`LogEventsPaginator`]; [`CloudWatchLogsClient`] is the
//! AWS SDK backed implementation.

use crate::config::AwsConfig;
use crate::error::{ReaderError, Result, SourceFault};
use crate::record::FlowRecord;
use crate::time_window::TimeWindow;
use aws_sdk_cloudwatchlogs::error::DisplayErrorContext;
use aws_sdk_cloudwatchlogs::operation::filter_log_events::FilterLogEventsOutput;
use aws_sdk_cloudwatchlogs::Client as LogsClient;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

/// Filter pattern matching version 2 flow log lines
pub const DEFAULT_FILTER_PATTERN: &str = "[version=\"2\", account_id, interface_id, srcaddr, dstaddr, \
     srcport, dstport, protocol, packets, bytes, \
     start, end, action, log_status]";

/// One event returned by the log service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEvent {
    /// Raw flow log line
    pub message: String,
    /// Log stream the event came from
    pub log_stream_name: Option<String>,
    /// Ingestion timestamp in epoch milliseconds
    pub timestamp: Option<i64>,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_stream(mut self, log_stream_name: impl Into<String>) -> Self {
        self.log_stream_name = Some(log_stream_name.into());
        self
    }
}

/// One page of a filtered query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsPage {
    pub events: Vec<LogEvent>,
}

/// Parameters of a filtered log group query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterQuery {
    pub log_group_name: String,
    /// Inclusive lower bound, epoch milliseconds
    pub start_time_ms: i64,
    /// Exclusive upper bound, epoch milliseconds
    pub end_time_ms: i64,
    pub filter_pattern: Option<String>,
}

/// Paginated query capability of the log service
pub trait LogEventsPaginator: Send + Sync {
    /// Stream every page of results for `query`. A fault ends the stream.
    fn paginate(&self, query: FilterQuery) -> BoxStream<'_, Result<EventsPage, SourceFault>>;
}

/// Reader for flow log records stored in a CloudWatch Logs group
pub struct FlowLogsReader<P> {
    client: P,
    log_group_name: String,
    window: TimeWindow,
    filter_pattern: Option<String>,
}

impl<P: LogEventsPaginator> FlowLogsReader<P> {
    /// Read the last hour of `log_group_name` with the default filter pattern
    pub fn new(client: P, log_group_name: impl Into<String>) -> Self {
        Self {
            client,
            log_group_name: log_group_name.into(),
            window: TimeWindow::default(),
            filter_pattern: Some(DEFAULT_FILTER_PATTERN.to_string()),
        }
    }

    pub fn time_window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    /// Server-side filter pattern; `None` returns every event in the group
    pub fn filter_pattern(mut self, pattern: Option<String>) -> Self {
        self.filter_pattern = pattern;
        self
    }

    pub fn log_group_name(&self) -> &str {
        &self.log_group_name
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn query(&self) -> FilterQuery {
        FilterQuery {
            log_group_name: self.log_group_name.clone(),
            start_time_ms: self.window.start_millis(),
            end_time_ms: self.window.end_millis(),
            filter_pattern: self.filter_pattern.clone(),
        }
    }

    /// Every event in the window, in the order the paginator delivers them.
    ///
    /// The duplicate next token fault ends the stream cleanly; any other
    /// fault is yielded once as [`ReaderError::Source`] and ends it.
    pub fn events(&self) -> BoxStream<'_, Result<LogEvent>> {
        let query = self.query();
        let log_group = self.log_group_name.as_str();
        debug!(
            log_group = %log_group,
            start_ms = query.start_time_ms,
            end_ms = query.end_time_ms,
            "Querying log events"
        );

        let pages = self.client.paginate(query);

        stream::unfold(Some(pages), move |state| async move {
            let mut pages = state?;
            match pages.next().await? {
                Ok(page) => Some((Ok(page.events), Some(pages))),
                // Known paginator defect: the service repeats a token at the
                // end of the results. Treat it as exhaustion.
                Err(fault) if fault.is_duplicate_next_token() => {
                    warn!(
                        log_group = %log_group,
                        error = %fault,
                        "Duplicate pagination token, ending query"
                    );
                    None
                }
                Err(fault) => Some((Err(ReaderError::Source(fault)), None)),
            }
        })
        .map_ok(|events| stream::iter(events.into_iter().map(Ok::<_, ReaderError>)))
        .try_flatten()
        .boxed()
    }

    /// [`events`](Self::events) parsed into flow records
    pub fn records(&self) -> BoxStream<'_, Result<FlowRecord>> {
        self.events()
            .map(|event| event.and_then(|e| FlowRecord::from_event(&e)))
            .boxed()
    }
}

/// [`LogEventsPaginator`] backed by the AWS SDK CloudWatch Logs client
#[derive(Clone)]
pub struct CloudWatchLogsClient {
    client: LogsClient,
}

impl CloudWatchLogsClient {
    pub fn new(client: LogsClient) -> Self {
        Self { client }
    }

    /// Build a client from the shared AWS settings
    pub async fn from_config(config: &AwsConfig) -> Self {
        let sdk_config = config.load_sdk_config().await;
        let mut builder = aws_sdk_cloudwatchlogs::config::Builder::from(&sdk_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(region = ?sdk_config.region(), "CloudWatch Logs client initialized");

        Self::new(LogsClient::from_conf(builder.build()))
    }
}

impl From<FilterLogEventsOutput> for EventsPage {
    fn from(output: FilterLogEventsOutput) -> Self {
        let events = output
            .events()
            .iter()
            .map(|event| LogEvent {
                message: event.message().unwrap_or_default().to_string(),
                log_stream_name: event.log_stream_name().map(String::from),
                timestamp: event.timestamp(),
            })
            .collect();

        EventsPage { events }
    }
}

impl LogEventsPaginator for CloudWatchLogsClient {
    fn paginate(&self, query: FilterQuery) -> BoxStream<'_, Result<EventsPage, SourceFault>> {
        let pages = self
            .client
            .filter_log_events()
            .log_group_name(query.log_group_name)
            .start_time(query.start_time_ms)
            .end_time(query.end_time_ms)
            .set_filter_pattern(query.filter_pattern)
            .into_paginator()
            .send();

        stream::unfold(pages, |mut pages| async move {
            let page = pages
                .next()
                .await?
                .map(EventsPage::from)
                .map_err(|e| SourceFault::new(DisplayErrorContext(&e).to_string()));
            Some((page, pages))
        })
        .boxed()
    }
}
