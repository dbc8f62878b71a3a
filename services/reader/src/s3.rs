//! Flow log records from an S3 archive.
//!
//! Flow logs delivered to S3 are laid out as
//!
//! ```text
//! <prefix>/AWSLogs/<account>/vpcflowlogs/<region>/YYYY/MM/DD/<account>_vpcflowlogs_<region>_<flow log id>_YYYYMMDDTHHMMZ_<hash>.log.gz
//! ```
//!
//! [`S3FlowLogsReader`] walks that hierarchy (account → region → day → file)
//! as one lazy stream. A level is only listed once the consumer has drained
//! the previous entry, so stopping early never lists or fetches anything
//! beyond what was consumed.

use crate::error::{ReaderError, Result, SourceFault};
use crate::record::FlowRecord;
use crate::time_window::TimeWindow;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::MultiGzDecoder;
use futures::future;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const LOGS_DIRECTORY: &str = "AWSLogs/";
const SERVICE_DIRECTORY: &str = "vpcflowlogs/";
const DAY_PREFIX_FORMAT: &str = "%Y/%m/%d/";
const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%MZ";

/// One `ListObjectsV2` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
}

impl ListRequest {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            delimiter: None,
            continuation_token: None,
        }
    }

    /// List only the immediate children of `prefix`
    pub fn delimited(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            delimiter: Some("/".to_string()),
            ..Self::new(bucket, prefix)
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    /// Present when more results are available
    pub next_continuation_token: Option<String>,
}

/// Object listing and fetch capability of the archive store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, SourceFault>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, SourceFault>;
}

/// Bucket plus optional key prefix under which `AWSLogs/` lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLocation {
    pub bucket: String,
    pub prefix: String,
}

impl ArchiveLocation {
    /// Parse `bucket`, `bucket/prefix` or `s3://bucket/prefix`
    pub fn parse(location: &str) -> Self {
        let location = location.strip_prefix("s3://").unwrap_or(location);
        let (bucket, prefix) = location.split_once('/').unwrap_or((location, ""));
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Prefix of the per-account directories
    pub fn logs_prefix(&self) -> String {
        if self.prefix.is_empty() {
            LOGS_DIRECTORY.to_string()
        } else {
            format!("{}/{}", self.prefix, LOGS_DIRECTORY)
        }
    }
}

/// Reader for flow log files archived in S3
#[derive(Clone)]
pub struct S3FlowLogsReader {
    store: Arc<dyn ObjectStore>,
    location: ArchiveLocation,
    window: TimeWindow,
    include_accounts: Option<HashSet<String>>,
    include_regions: Option<HashSet<String>>,
}

impl S3FlowLogsReader {
    /// Read the last hour of every account and region under `location`
    pub fn new(store: Arc<dyn ObjectStore>, location: &str) -> Self {
        Self {
            store,
            location: ArchiveLocation::parse(location),
            window: TimeWindow::default(),
            include_accounts: None,
            include_regions: None,
        }
    }

    pub fn time_window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    /// Only read these account IDs
    pub fn include_accounts<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_accounts = Some(accounts.into_iter().map(Into::into).collect());
        self
    }

    /// Only read these regions
    pub fn include_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }

    pub fn location(&self) -> &ArchiveLocation {
        &self.location
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    /// Raw flow log lines of every matching file, header lines excluded
    pub fn lines(&self) -> BoxStream<'static, Result<String>> {
        let walk = Arc::new(self.clone());
        let accounts = walk.clone().account_prefixes();

        let regions = {
            let walk = walk.clone();
            move |account: String| walk.clone().region_prefixes(account)
        };
        let keys = {
            let walk = walk.clone();
            move |region: String| walk.clone().keys(region)
        };
        let lines = move |key: String| walk.clone().read_file(key);

        accounts
            .map_ok(regions)
            .try_flatten()
            .map_ok(keys)
            .try_flatten()
            .map_ok(lines)
            .try_flatten()
            .boxed()
    }

    /// [`lines`](Self::lines) parsed into flow records
    pub fn records(&self) -> BoxStream<'static, Result<FlowRecord>> {
        self.lines()
            .map(|line| line.and_then(|l| FlowRecord::from_message(&l)))
            .boxed()
    }

    /// `<prefix>/AWSLogs/<account>/` for each included account
    fn account_prefixes(self: Arc<Self>) -> BoxStream<'static, Result<String>> {
        let request = ListRequest::delimited(&self.location.bucket, self.location.logs_prefix());
        common_prefixes(self.store.clone(), request)
            .try_filter(move |prefix| {
                future::ready(is_included(self.include_accounts.as_ref(), prefix))
            })
            .boxed()
    }

    /// `<account>/vpcflowlogs/<region>/` for each included region
    fn region_prefixes(self: Arc<Self>, account_prefix: String) -> BoxStream<'static, Result<String>> {
        let request = ListRequest::delimited(
            &self.location.bucket,
            format!("{}{}", account_prefix, SERVICE_DIRECTORY),
        );
        common_prefixes(self.store.clone(), request)
            .try_filter(move |prefix| {
                future::ready(is_included(self.include_regions.as_ref(), prefix))
            })
            .boxed()
    }

    /// Keys under every day directory of `region_prefix` whose file name
    /// timestamp falls inside the window
    fn keys(self: Arc<Self>, region_prefix: String) -> BoxStream<'static, Result<String>> {
        let day_prefixes = day_prefixes(&self.window)
            .map(move |day| Ok::<_, ReaderError>(format!("{}{}", region_prefix, day)));

        stream::iter(day_prefixes)
            .map_ok(move |prefix| self.clone().keys_in_window(prefix))
            .try_flatten()
            .boxed()
    }

    fn keys_in_window(self: Arc<Self>, prefix: String) -> BoxStream<'static, Result<String>> {
        let request = ListRequest::new(&self.location.bucket, prefix);
        list_pages(self.store.clone(), request)
            .map_ok(|page| stream::iter(page.keys.into_iter().map(Ok::<_, ReaderError>)))
            .try_flatten()
            .try_filter(move |key| future::ready(self.is_key_in_window(key)))
            .boxed()
    }

    fn is_key_in_window(&self, key: &str) -> bool {
        match key_timestamp(key) {
            Some(timestamp) => self.window.contains(timestamp),
            None => {
                debug!(key = %key, "Skipping key without a flow log timestamp");
                false
            }
        }
    }

    fn read_file(self: Arc<Self>, key: String) -> BoxStream<'static, Result<String>> {
        stream::once(async move {
            let body = fetch_object(self.store.as_ref(), &self.location.bucket, &key).await?;
            Ok::<_, ReaderError>(stream::iter(GzipLines::new(key, body)))
        })
        .try_flatten()
        .boxed()
    }
}

#[instrument(skip(store))]
async fn fetch_object(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<Bytes> {
    let body = store.get_object(bucket, key).await?;
    info!(size_bytes = body.len(), "Fetched flow log archive");
    Ok(body)
}

/// Every page of a listing, following continuation tokens
fn list_pages(store: Arc<dyn ObjectStore>, request: ListRequest) -> BoxStream<'static, Result<ListPage>> {
    stream::try_unfold(Some(request), move |next| {
        let store = store.clone();
        async move {
            let Some(request) = next else {
                return Ok::<_, ReaderError>(None);
            };

            debug!(prefix = %request.prefix, "Listing objects");
            let page = store.list_objects(&request).await?;
            let next = page
                .next_continuation_token
                .clone()
                .map(|token| ListRequest {
                    continuation_token: Some(token),
                    ..request
                });

            Ok(Some((page, next)))
        }
    })
    .boxed()
}

fn common_prefixes(store: Arc<dyn ObjectStore>, request: ListRequest) -> BoxStream<'static, Result<String>> {
    list_pages(store, request)
        .map_ok(|page| stream::iter(page.common_prefixes.into_iter().map(Ok::<_, ReaderError>)))
        .try_flatten()
        .boxed()
}

/// Whether the last directory of `prefix` is in the allow-list.
/// No allow-list admits everything.
fn is_included(allow_list: Option<&HashSet<String>>, prefix: &str) -> bool {
    match allow_list {
        None => true,
        Some(allowed) => prefix
            .rsplit('/')
            .nth(1)
            .is_some_and(|name| allowed.contains(name)),
    }
}

/// `YYYY/MM/DD/` for every day from the start of `window.start` through the
/// start of `window.end`, inclusive
pub fn day_prefixes(window: &TimeWindow) -> impl Iterator<Item = String> {
    let last = window.end.date_naive();
    window
        .start
        .date_naive()
        .iter_days()
        .take_while(move |day| *day <= last)
        .map(|day| day.format(DAY_PREFIX_FORMAT).to_string())
}

/// Timestamp encoded in a flow log file name, i.e. its second-to-last `_`
/// separated segment
pub fn key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let file_name = key.rsplit('/').next()?;
    let mut segments = file_name.rsplit('_');
    segments.next()?;
    let stamp = segments.next()?;

    NaiveDateTime::parse_from_str(stamp, KEY_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Lines of a gzip compressed object, skipping the header line.
///
/// Owns the object body and the decoder; both are released when the
/// iterator is exhausted or dropped.
pub struct GzipLines {
    key: String,
    lines: io::Lines<BufReader<MultiGzDecoder<bytes::buf::Reader<Bytes>>>>,
    header_skipped: bool,
    done: bool,
}

impl GzipLines {
    pub fn new(key: String, body: Bytes) -> Self {
        Self {
            key,
            lines: BufReader::new(MultiGzDecoder::new(body.reader())).lines(),
            header_skipped: false,
            done: false,
        }
    }

    fn next_line(&mut self) -> Option<Result<String>> {
        match self.lines.next() {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(source)) => {
                self.done = true;
                Some(Err(ReaderError::Decompress {
                    key: self.key.clone(),
                    source,
                }))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

impl Iterator for GzipLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.header_skipped {
            self.header_skipped = true;
            if let Err(e) = self.next_line()? {
                return Some(Err(e));
            }
        }

        self.next_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::SAMPLE_RECORDS;
    use crate::record::FlowField;
    use chrono::{Duration, TimeZone};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const BUCKET: &str = "example-bucket";
    const REGION_PREFIX: &str = "AWSLogs/123456789010/vpcflowlogs/pangaea-1/";
    const DAY_PREFIX: &str = "AWSLogs/123456789010/vpcflowlogs/pangaea-1/2015/08/12/";

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn window() -> TimeWindow {
        TimeWindow::new(utc(2015, 8, 12, 12, 0, 0), utc(2015, 8, 12, 13, 0, 0))
    }

    fn log_key(stamp: &str) -> String {
        format!(
            "{}123456789010_vpcflowlogs_pangaea-1_fl-102010_{}_h45h.log.gz",
            DAY_PREFIX, stamp
        )
    }

    fn gzip(text: &str) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn archive_body(lines: &[&str]) -> Bytes {
        let header = FlowField::ALL.map(|f| f.as_str()).join(" ");
        let mut text = vec![header.as_str()];
        text.extend_from_slice(lines);
        gzip(&text.join("\n"))
    }

    fn prefixes(prefixes: &[&str]) -> ListPage {
        ListPage {
            common_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn keys(keys: Vec<String>) -> ListPage {
        ListPage {
            keys,
            ..Default::default()
        }
    }

    fn expect_listing(store: &mut MockObjectStore, prefix: &'static str, delimited: bool, page: ListPage) {
        store
            .expect_list_objects()
            .withf(move |req| {
                req.bucket == BUCKET && req.prefix == prefix && req.delimiter.is_some() == delimited
            })
            .times(1)
            .returning(move |_| Ok(page.clone()));
    }

    /// Accounts and regions outside the allow-lists are never listed: the
    /// mock panics on any call without a matching expectation.
    #[tokio::test]
    async fn test_iteration() {
        let mut store = MockObjectStore::new();
        expect_listing(
            &mut store,
            "AWSLogs/",
            true,
            prefixes(&["AWSLogs/123456789010/", "AWSLogs/123456789011/"]),
        );
        expect_listing(
            &mut store,
            "AWSLogs/123456789010/vpcflowlogs/",
            true,
            prefixes(&[REGION_PREFIX, "AWSLogs/123456789010/vpcflowlogs/pangaea-2/"]),
        );
        expect_listing(
            &mut store,
            DAY_PREFIX,
            false,
            keys(vec![
                // Too early
                log_key("20150812T1155Z"),
                // Right on time
                log_key("20150812T1200Z"),
                // Some fool put a different key here
                format!("{}test_file.log.gz", DAY_PREFIX),
            ]),
        );

        let body = archive_body(&SAMPLE_RECORDS);
        let wanted = log_key("20150812T1200Z");
        store
            .expect_get_object()
            .withf(move |bucket, key| bucket == BUCKET && key == wanted)
            .times(1)
            .returning(move |_, _| Ok(body.clone()));

        let reader = S3FlowLogsReader::new(Arc::new(store), BUCKET)
            .time_window(window())
            .include_accounts(["123456789010"])
            .include_regions(["pangaea-1"]);

        let actual: Vec<FlowRecord> = reader.records().try_collect().await.unwrap();
        let expected: Vec<FlowRecord> = SAMPLE_RECORDS
            .iter()
            .map(|m| FlowRecord::from_message(m).unwrap())
            .collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_stops_listing_when_consumer_stops() {
        let mut store = MockObjectStore::new();
        expect_listing(&mut store, "AWSLogs/", true, prefixes(&["AWSLogs/123456789010/"]));
        expect_listing(
            &mut store,
            "AWSLogs/123456789010/vpcflowlogs/",
            true,
            // The second region must never be listed
            prefixes(&[REGION_PREFIX, "AWSLogs/123456789010/vpcflowlogs/pangaea-2/"]),
        );
        expect_listing(
            &mut store,
            DAY_PREFIX,
            false,
            keys(vec![log_key("20150812T1200Z"), log_key("20150812T1210Z")]),
        );

        let body = archive_body(&SAMPLE_RECORDS);
        store
            .expect_get_object()
            .times(1)
            .returning(move |_, _| Ok(body.clone()));

        let reader = S3FlowLogsReader::new(Arc::new(store), BUCKET).time_window(window());

        let first: Vec<Result<String>> = reader.lines().take(2).collect().await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].as_ref().unwrap(), SAMPLE_RECORDS[0]);
        assert_eq!(first[1].as_ref().unwrap(), SAMPLE_RECORDS[1]);
    }

    #[tokio::test]
    async fn test_follows_continuation_tokens() {
        let mut store = MockObjectStore::new();
        expect_listing(&mut store, "data/AWSLogs/", true, prefixes(&["data/AWSLogs/1/"]));
        expect_listing(
            &mut store,
            "data/AWSLogs/1/vpcflowlogs/",
            true,
            prefixes(&["data/AWSLogs/1/vpcflowlogs/r/"]),
        );

        store
            .expect_list_objects()
            .withf(|req| req.prefix == "data/AWSLogs/1/vpcflowlogs/r/2015/08/12/" && req.continuation_token.is_none())
            .times(1)
            .returning(|_| {
                Ok(ListPage {
                    keys: vec!["data/AWSLogs/1/vpcflowlogs/r/2015/08/12/1_vpcflowlogs_r_fl_20150812T1200Z_a.log.gz".to_string()],
                    common_prefixes: vec![],
                    next_continuation_token: Some("page-2".to_string()),
                })
            });
        store
            .expect_list_objects()
            .withf(|req| req.continuation_token.as_deref() == Some("page-2"))
            .times(1)
            .returning(|_| {
                Ok(keys(vec![
                    "data/AWSLogs/1/vpcflowlogs/r/2015/08/12/1_vpcflowlogs_r_fl_20150812T1230Z_b.log.gz".to_string(),
                ]))
            });

        let first = archive_body(&SAMPLE_RECORDS[..1]);
        let second = archive_body(&SAMPLE_RECORDS[1..2]);
        store
            .expect_get_object()
            .times(2)
            .returning(move |_, key| {
                if key.ends_with("_a.log.gz") {
                    Ok(first.clone())
                } else {
                    Ok(second.clone())
                }
            });

        let reader = S3FlowLogsReader::new(Arc::new(store), "s3://example-bucket/data/")
            .time_window(window());

        let lines: Vec<String> = reader.lines().try_collect().await.unwrap();
        assert_eq!(lines, vec![SAMPLE_RECORDS[0], SAMPLE_RECORDS[1]]);
    }

    #[tokio::test]
    async fn test_listing_fault_propagates() {
        let mut store = MockObjectStore::new();
        store
            .expect_list_objects()
            .times(1)
            .returning(|_| Err(SourceFault::new("Access Denied")));

        let reader = S3FlowLogsReader::new(Arc::new(store), BUCKET).time_window(window());

        let results: Vec<Result<String>> = reader.lines().collect().await;
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(ReaderError::Source(fault)) => assert_eq!(fault.message, "Access Denied"),
            other => panic!("Expected source fault, got {:?}", other),
        }
    }

    #[test]
    fn test_key_window_boundaries() {
        let store = Arc::new(MockObjectStore::new());
        let start = utc(2015, 8, 12, 12, 0, 1);
        let end = utc(2015, 8, 12, 12, 30, 0);
        let reader = S3FlowLogsReader::new(store, BUCKET).time_window(TimeWindow::new(start, end));

        // One second before the start
        assert!(!reader.is_key_in_window(&log_key("20150812T1200Z")));
        let reader = reader.time_window(TimeWindow::new(start - Duration::seconds(1), end));
        // Exactly at the start
        assert!(reader.is_key_in_window(&log_key("20150812T1200Z")));
        // Exactly at the end
        assert!(!reader.is_key_in_window(&log_key("20150812T1230Z")));
        assert!(reader.is_key_in_window(&log_key("20150812T1229Z")));
    }

    #[test]
    fn test_unrecognized_keys_are_skipped() {
        let reader = S3FlowLogsReader::new(Arc::new(MockObjectStore::new()), BUCKET).time_window(window());

        assert!(!reader.is_key_in_window("AWSLogs/test_file.log.gz"));
        assert!(!reader.is_key_in_window("AWSLogs/no-underscores.log.gz"));
        assert!(!reader.is_key_in_window("AWSLogs/a_20151312T1200Z_b.log.gz"));
        assert!(!reader.is_key_in_window(""));
    }

    #[test]
    fn test_key_timestamp() {
        assert_eq!(
            key_timestamp(&log_key("20150812T1200Z")),
            Some(utc(2015, 8, 12, 12, 0, 0))
        );
        assert_eq!(key_timestamp("dir_20150812T1200Z/file.log.gz"), None);
    }

    #[test]
    fn test_day_prefixes() {
        let window = TimeWindow::new(utc(2015, 12, 30, 23, 0, 0), utc(2016, 1, 2, 0, 30, 0));
        let days: Vec<String> = day_prefixes(&window).collect();
        assert_eq!(
            days,
            vec!["2015/12/30/", "2015/12/31/", "2016/01/01/", "2016/01/02/"]
        );

        let days: Vec<String> = day_prefixes(&self::window()).collect();
        assert_eq!(days, vec!["2015/08/12/"]);

        let backwards = TimeWindow::new(utc(2015, 8, 13, 0, 0, 0), utc(2015, 8, 12, 0, 0, 0));
        assert_eq!(day_prefixes(&backwards).count(), 0);
    }

    #[test]
    fn test_archive_location() {
        let location = ArchiveLocation::parse("example-bucket");
        assert_eq!(location.bucket, "example-bucket");
        assert_eq!(location.logs_prefix(), "AWSLogs/");

        let location = ArchiveLocation::parse("example-bucket/");
        assert_eq!(location.logs_prefix(), "AWSLogs/");

        let location = ArchiveLocation::parse("s3://example-bucket/a/b/");
        assert_eq!(location.bucket, "example-bucket");
        assert_eq!(location.logs_prefix(), "a/b/AWSLogs/");
    }

    #[test]
    fn test_allow_lists() {
        let allowed: HashSet<String> = ["123456789010".to_string()].into();
        assert!(is_included(None, "AWSLogs/123456789011/"));
        assert!(is_included(Some(&allowed), "AWSLogs/123456789010/"));
        assert!(!is_included(Some(&allowed), "AWSLogs/123456789011/"));
        assert!(!is_included(Some(&allowed), "123456789010"));
    }

    #[test]
    fn test_gzip_lines_skip_header() {
        let lines: Vec<String> = GzipLines::new("k".to_string(), archive_body(&SAMPLE_RECORDS[..2]))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines, vec![SAMPLE_RECORDS[0], SAMPLE_RECORDS[1]]);

        let mut header_only = GzipLines::new("k".to_string(), gzip("version account_id\n"));
        assert!(header_only.next().is_none());
        assert!(header_only.next().is_none());

        assert!(GzipLines::new("k".to_string(), gzip("")).next().is_none());
    }

    #[test]
    fn test_gzip_lines_bad_body() {
        let mut lines = GzipLines::new("bad.log.gz".to_string(), Bytes::from_static(b"not gzip"));
        match lines.next() {
            Some(Err(ReaderError::Decompress { key, .. })) => assert_eq!(key, "bad.log.gz"),
            other => panic!("Expected decompress error, got {:?}", other),
        }
        assert!(lines.next().is_none());
    }
}
