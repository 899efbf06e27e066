pub const IN_FLIGHT_RECORDS: &str = "import_flow_in_flight_records";
pub const CONSUMERS_PAUSED: &str = "import_flow_consumers_paused";
pub const CONSUMERS_RESUMED: &str = "import_flow_consumers_resumed";
pub const CONSUMER_SIGNAL_FAILED: &str = "import_flow_consumer_signal_failed";
pub const COUNTER_UNDERFLOW: &str = "import_flow_counter_underflow";
pub const CHUNKS_ADMITTED: &str = "import_flow_chunks_admitted";
pub const CHUNKS_DUPLICATED: &str = "import_flow_chunks_duplicated";

pub const DISPATCH_SUBMITTED: &str = "import_dispatch_submitted";
pub const DISPATCH_MERGED: &str = "import_dispatch_merged";
pub const DISPATCH_PENDING_KEYS: &str = "import_dispatch_pending_keys";
pub const DISPATCH_FLUSHES: &str = "import_dispatch_flushes";
pub const DISPATCH_FLUSH_TIME: &str = "import_dispatch_flush_time_seconds";
pub const DISPATCH_RETRIES: &str = "import_dispatch_retries";
pub const DISPATCH_DROPPED_KEYS: &str = "import_dispatch_dropped_keys";

pub const PROGRESS_OVERFLOW: &str = "import_progress_exceeds_total";
pub const EVENTS_RECEIVED: &str = "import_worker_events_received";
pub const EVENT_PARSE_ERROR: &str = "import_worker_event_parse_error";
