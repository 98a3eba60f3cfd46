//! Diesel schema for queue persistence.
//!
//! Timestamps are integer milliseconds since the Unix epoch so that ordering
//! and range comparisons stay numeric inside SQLite.

diesel::table! {
    /// Queued, running and finished tasks.
    task_queue (id) {
        /// Monotonic task identifier.
        id -> BigInt,
        /// Routing type.
        task_type -> Text,
        /// Precedence; lower runs first.
        priority -> Integer,
        /// Opaque payload.
        payload -> Binary,
        /// Compatibility tags as a JSON array of `key=value` strings.
        compatibility -> Text,
        /// Lifecycle status.
        status -> Text,
        /// Failed attempts so far.
        attempts -> Integer,
        /// Attempt budget.
        max_attempts -> Integer,
        /// Earliest eligible time.
        run_after_ms -> BigInt,
        /// Lease expiry, set only while leased.
        lease_until_ms -> Nullable<BigInt>,
        /// Lease holder, set only while leased.
        locked_by -> Nullable<Text>,
        /// Claim time, set only while leased.
        reserved_at_ms -> Nullable<BigInt>,
        /// Deduplication key.
        idempotency_key -> Nullable<Text>,
        /// Terminal failure reason.
        error_message -> Nullable<Text>,
        /// Opaque success result.
        task_result -> Nullable<Binary>,
        /// Creation time.
        created_at_ms -> BigInt,
        /// Latest lifecycle change.
        updated_at_ms -> BigInt,
        /// Entry into a terminal state.
        finished_at_ms -> Nullable<BigInt>,
    }
}

diesel::table! {
    /// Compatibility tags denormalised for indexed filtering.
    task_tags (task_id, tag) {
        /// Owning task.
        task_id -> BigInt,
        /// Tag in `key=value` form.
        tag -> Text,
    }
}

diesel::table! {
    /// Known workers and their liveness.
    workers (worker_id) {
        /// Worker identity.
        worker_id -> Text,
        /// Declared capabilities as a JSON array of `key=value` strings.
        capabilities -> Text,
        /// First registration time.
        registered_at_ms -> BigInt,
        /// Latest heartbeat.
        last_heartbeat_ms -> BigInt,
    }
}

diesel::table! {
    /// Append-only task history.
    task_logs (id) {
        /// Monotonic entry identifier.
        id -> BigInt,
        /// Owning task.
        task_id -> BigInt,
        /// Write time.
        timestamp_ms -> BigInt,
        /// Severity.
        level -> Text,
        /// Human-readable message.
        message -> Text,
        /// Structured details as JSON text.
        details -> Text,
    }
}

diesel::table! {
    /// Applied schema versions.
    schema_version (version) {
        /// Schema version number.
        version -> Integer,
        /// When the version was applied.
        applied_at_ms -> BigInt,
    }
}

diesel::joinable!(task_tags -> task_queue (task_id));
diesel::joinable!(task_logs -> task_queue (task_id));

diesel::allow_tables_to_appear_in_same_query!(task_queue, task_tags, task_logs, workers);
