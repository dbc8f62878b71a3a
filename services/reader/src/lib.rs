//! Flow Logs Reader
//!
//! Reads AWS VPC Flow Log records from CloudWatch Logs or from the gzip
//! archives flow logs deliver to S3, and exposes both as a stream of typed
//! [`FlowRecord`]s.
//!
//! ## Architecture
//!
//! ```text
//! CloudWatch Logs              S3 archive
//! ┌──────────────┐            ┌────────────────────────┐
//! │ FilterLog    │            │ AWSLogs/{account}/     │
//! │ Events pages │            │   vpcflowlogs/{region}/│
//! └──────────────┘            │     {yyyy/mm/dd}/*.gz  │
//!        │                    └────────────────────────┘
//!        ▼                               │
//! ┌──────────────┐            ┌────────────────────────┐
//! │ FlowLogs     │            │ S3FlowLogs             │
//! │ Reader       │            │ Reader                 │
//! └──────────────┘            └────────────────────────┘
//!        │                               │
//!        └───────────────┬───────────────┘
//!                        ▼
//!                 ┌──────────────┐      ┌──────────────┐
//!                 │ FlowRecord   │─────▶│ Aggregator   │
//!                 └──────────────┘      └──────────────┘
//! ```
//!
//! Both readers are lazy: nothing is listed, fetched or paged until the
//! consumer polls for the next record.

pub mod actions;
pub mod aggregate;
pub mod cloudwatch;
pub mod config;
pub mod error;
pub mod record;
pub mod s3;
pub mod s3_client;
pub mod time_window;

pub use aggregate::{aggregate_stream, aggregated_records, Aggregator, FlowSummary, DEFAULT_KEY_FIELDS};
pub use cloudwatch::{CloudWatchLogsClient, FlowLogsReader, LogEvent, LogEventsPaginator};
pub use config::Config;
pub use error::{ReaderError, Result, SourceFault};
pub use record::{Action, FieldValue, FlowField, FlowRecord, LogStatus};
pub use s3::{ObjectStore, S3FlowLogsReader};
pub use s3_client::S3ObjectStore;
pub use time_window::TimeWindow;
