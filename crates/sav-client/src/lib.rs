pub mod api;
pub mod debounce;
pub mod desk;
pub mod error;
pub mod search;

use std::time::Duration;

pub use api::{ApiClient, PhotoRequest, PublishReceipt, Upload};
pub use debounce::{Debouncer, LatestOnly};
pub use desk::{DeskController, PublishOutcome, QuietPeriods};
pub use error::{ApiError, DeskFlowError};
pub use search::{ContactSearch, SearchSource};

/// Quiet period of search-as-you-type inputs.
pub const SEARCH_QUIET: Duration = Duration::from_millis(300);
/// Quiet period before an "include in report" flag is persisted.
pub const INCLUDE_QUIET: Duration = Duration::from_millis(500);
pub const DRAFT_QUIET: Duration = Duration::from_millis(600);
pub const NOTES_QUIET: Duration = Duration::from_millis(700);
pub const CONTEXT_QUIET: Duration = Duration::from_millis(700);
